use std::time::Duration;

use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

pub const SHEETS_API_BASE: &str = "https://sheets.googleapis.com/v4/spreadsheets/";

#[derive(Debug, Error)]
pub enum SheetError {
    #[error("sheet request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("sheet access denied ({status}): {body}")]
    Auth { status: u16, body: String },
    #[error("sheet quota exhausted: {0}")]
    Quota(String),
    #[error("sheet api returned {status}: {body}")]
    Http { status: u16, body: String },
    #[error("invalid sheet configuration: {0}")]
    Config(String),
}

/// Append-only spreadsheet collaborator.
///
/// Rows are positional: cell `i` of a data row belongs to header column `i`.
#[async_trait]
pub trait SheetStore: Send + Sync {
    /// First row of the sheet; empty when the sheet has no rows.
    async fn get_header(&self) -> Result<Vec<String>, SheetError>;

    /// Overwrite the first row.
    async fn set_header(&self, header: &[String]) -> Result<(), SheetError>;

    /// Every row, header included, in sheet order.
    async fn get_all_rows(&self) -> Result<Vec<Vec<String>>, SheetError>;

    /// Append rows after the last non-empty row.
    async fn append_rows(&self, rows: &[Vec<String>]) -> Result<(), SheetError>;
}

#[derive(Debug, Clone)]
pub struct GoogleSheetsConfig {
    pub spreadsheet_id: String,
    pub tab: String,
    pub access_token: String,
    pub api_base: String,
    pub timeout: Duration,
}

impl GoogleSheetsConfig {
    pub fn new(
        spreadsheet_id: impl Into<String>,
        tab: impl Into<String>,
        access_token: impl Into<String>,
    ) -> Self {
        Self {
            spreadsheet_id: spreadsheet_id.into(),
            tab: tab.into(),
            access_token: access_token.into(),
            api_base: SHEETS_API_BASE.to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<JsonValue>>,
}

/// Google Sheets v4 `spreadsheets.values` client authenticated with a bearer token.
#[derive(Debug, Clone)]
pub struct GoogleSheetsStore {
    client: reqwest::Client,
    spreadsheet_url: Url,
    tab: String,
    access_token: String,
}

impl GoogleSheetsStore {
    pub fn new(config: GoogleSheetsConfig) -> Result<Self, SheetError> {
        if config.spreadsheet_id.trim().is_empty() {
            return Err(SheetError::Config("spreadsheet id is empty".into()));
        }
        if config.access_token.trim().is_empty() {
            return Err(SheetError::Config("access token is empty".into()));
        }
        let base = Url::parse(&config.api_base)
            .map_err(|e| SheetError::Config(format!("api base {}: {e}", config.api_base)))?;
        let mut spreadsheet_url = base;
        spreadsheet_url
            .path_segments_mut()
            .map_err(|_| SheetError::Config(format!("api base {} cannot be a base", config.api_base)))?
            .pop_if_empty()
            .push(&config.spreadsheet_id);

        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            client,
            spreadsheet_url,
            tab: config.tab,
            access_token: config.access_token,
        })
    }

    fn header_range(&self) -> String {
        format!("{}!A1:Z1", self.tab)
    }

    fn data_range(&self) -> String {
        format!("{}!A1:Z1000000", self.tab)
    }

    fn anchor_range(&self) -> String {
        format!("{}!A1", self.tab)
    }

    /// `<spreadsheet>/values/<range><suffix>` with the range percent-encoded.
    fn values_url(&self, range: &str, suffix: &str) -> Url {
        let mut url = self.spreadsheet_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.push("values").push(&format!("{range}{suffix}"));
        }
        url
    }

    async fn read_range(&self, range: &str) -> Result<Vec<Vec<String>>, SheetError> {
        let url = self.values_url(range, "");
        debug!(%url, "reading sheet range");
        let resp = self
            .client
            .get(url)
            .bearer_auth(&self.access_token)
            .send()
            .await?;
        let body: ValueRange = check_status(resp).await?.json().await?;
        Ok(body
            .values
            .into_iter()
            .map(|row| row.iter().map(cell_to_string).collect())
            .collect())
    }
}

fn cell_to_string(cell: &JsonValue) -> String {
    match cell {
        JsonValue::String(s) => s.clone(),
        JsonValue::Null => String::new(),
        other => other.to_string(),
    }
}

async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, SheetError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => SheetError::Auth {
            status: status.as_u16(),
            body,
        },
        StatusCode::TOO_MANY_REQUESTS => SheetError::Quota(body),
        _ => SheetError::Http {
            status: status.as_u16(),
            body,
        },
    })
}

#[async_trait]
impl SheetStore for GoogleSheetsStore {
    async fn get_header(&self) -> Result<Vec<String>, SheetError> {
        let rows = self.read_range(&self.header_range()).await?;
        Ok(rows.into_iter().next().unwrap_or_default())
    }

    async fn set_header(&self, header: &[String]) -> Result<(), SheetError> {
        let mut url = self.values_url(&self.anchor_range(), "");
        url.query_pairs_mut().append_pair("valueInputOption", "RAW");
        let resp = self
            .client
            .put(url)
            .bearer_auth(&self.access_token)
            .json(&json!({ "values": [header] }))
            .send()
            .await?;
        check_status(resp).await?;
        Ok(())
    }

    async fn get_all_rows(&self) -> Result<Vec<Vec<String>>, SheetError> {
        self.read_range(&self.data_range()).await
    }

    async fn append_rows(&self, rows: &[Vec<String>]) -> Result<(), SheetError> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut url = self.values_url(&self.anchor_range(), ":append");
        url.query_pairs_mut()
            .append_pair("valueInputOption", "RAW")
            .append_pair("insertDataOption", "INSERT_ROWS");
        let resp = self
            .client
            .post(url)
            .bearer_auth(&self.access_token)
            .json(&json!({ "values": rows }))
            .send()
            .await?;
        check_status(resp).await?;
        Ok(())
    }
}

/// Process-local sheet used for dry runs and tests.
#[derive(Debug, Default)]
pub struct InMemorySheet {
    rows: Mutex<Vec<Vec<String>>>,
}

impl InMemorySheet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rows(rows: Vec<Vec<String>>) -> Self {
        Self {
            rows: Mutex::new(rows),
        }
    }

    pub async fn snapshot(&self) -> Vec<Vec<String>> {
        self.rows.lock().await.clone()
    }
}

#[async_trait]
impl SheetStore for InMemorySheet {
    async fn get_header(&self) -> Result<Vec<String>, SheetError> {
        Ok(self.rows.lock().await.first().cloned().unwrap_or_default())
    }

    async fn set_header(&self, header: &[String]) -> Result<(), SheetError> {
        let mut rows = self.rows.lock().await;
        match rows.first_mut() {
            Some(first) => *first = header.to_vec(),
            None => rows.push(header.to_vec()),
        }
        Ok(())
    }

    async fn get_all_rows(&self) -> Result<Vec<Vec<String>>, SheetError> {
        Ok(self.rows.lock().await.clone())
    }

    async fn append_rows(&self, new_rows: &[Vec<String>]) -> Result<(), SheetError> {
        self.rows.lock().await.extend(new_rows.iter().cloned());
        Ok(())
    }
}
