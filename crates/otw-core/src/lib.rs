//! Core listing model, normalization and date classification for OTW.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod dates;

pub const CRATE_NAME: &str = "otw-core";

/// Canonical listing columns, in the order they occupy in the external store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Column {
    DomainCategory,
    InquiryDeadline,
    DocumentFee,
    IssuingAuthority,
    ReferenceNumber,
    SubmissionDeadline,
    Url,
    Title,
    PublishedAt,
}

impl Column {
    pub const ALL: [Column; 9] = [
        Column::DomainCategory,
        Column::InquiryDeadline,
        Column::DocumentFee,
        Column::IssuingAuthority,
        Column::ReferenceNumber,
        Column::SubmissionDeadline,
        Column::Url,
        Column::Title,
        Column::PublishedAt,
    ];

    pub const COUNT: usize = Self::ALL.len();

    pub fn position(self) -> usize {
        self as usize
    }

    /// Header text the portal's own sheets use for this column.
    pub fn default_header(self) -> &'static str {
        match self {
            Column::DomainCategory => "النشاط الاساسي",
            Column::InquiryDeadline => "اخر توقيت لاستلام الاستفسارات",
            Column::DocumentFee => "قيمة الكراسة",
            Column::IssuingAuthority => "الجهة",
            Column::ReferenceNumber => "الرقم المرجعي",
            Column::SubmissionDeadline => "اخر موعد لتقديم العرض",
            Column::Url => "الرابط",
            Column::Title => "العنوان",
            Column::PublishedAt => "تاريخ نشرها",
        }
    }
}

impl fmt::Display for Column {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Column::DomainCategory => "domain_category",
            Column::InquiryDeadline => "inquiry_deadline",
            Column::DocumentFee => "document_fee",
            Column::IssuingAuthority => "issuing_authority",
            Column::ReferenceNumber => "reference_number",
            Column::SubmissionDeadline => "submission_deadline",
            Column::Url => "url",
            Column::Title => "title",
            Column::PublishedAt => "published_at",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ColumnSetError {
    #[error("expected {expected} column names, got {actual}")]
    WrongCount { expected: usize, actual: usize },
    #[error("column name at position {0} is empty")]
    EmptyName(usize),
    #[error("column name '{0}' appears more than once")]
    Duplicate(String),
}

/// Exact, ordered header row expected in the external store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnSet {
    names: Vec<String>,
}

impl ColumnSet {
    pub fn new(names: Vec<String>) -> Result<Self, ColumnSetError> {
        if names.len() != Column::COUNT {
            return Err(ColumnSetError::WrongCount {
                expected: Column::COUNT,
                actual: names.len(),
            });
        }
        for (i, name) in names.iter().enumerate() {
            if name.trim().is_empty() {
                return Err(ColumnSetError::EmptyName(i));
            }
            if names[..i].contains(name) {
                return Err(ColumnSetError::Duplicate(name.clone()));
            }
        }
        Ok(Self { names })
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn name(&self, column: Column) -> &str {
        &self.names[column.position()]
    }

    pub fn matches_header(&self, header: &[String]) -> bool {
        header == self.names.as_slice()
    }
}

impl Default for ColumnSet {
    fn default() -> Self {
        Self {
            names: Column::ALL
                .iter()
                .map(|c| c.default_header().to_string())
                .collect(),
        }
    }
}

/// Outcome of extracting a single field from a card.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum FieldExtraction {
    Extracted(String),
    #[default]
    Absent,
}

impl FieldExtraction {
    /// Trims the candidate; blank text counts as absent.
    pub fn from_text(text: Option<&str>) -> Self {
        match text.map(str::trim) {
            Some(value) if !value.is_empty() => FieldExtraction::Extracted(value.to_string()),
            _ => FieldExtraction::Absent,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            FieldExtraction::Extracted(value) => value,
            FieldExtraction::Absent => "",
        }
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, FieldExtraction::Absent)
    }
}

/// Field mapping handed from a card parser to the normalizer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawFields {
    fields: BTreeMap<Column, FieldExtraction>,
}

impl RawFields {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, column: Column, extraction: FieldExtraction) {
        self.fields.insert(column, extraction);
    }

    pub fn with(mut self, column: Column, value: &str) -> Self {
        self.set(column, FieldExtraction::from_text(Some(value)));
        self
    }

    pub fn get(&self, column: Column) -> &FieldExtraction {
        static ABSENT: FieldExtraction = FieldExtraction::Absent;
        self.fields.get(&column).unwrap_or(&ABSENT)
    }

    pub fn value(&self, column: Column) -> &str {
        self.get(column).as_str()
    }

    pub fn absent_columns(&self) -> Vec<Column> {
        Column::ALL
            .into_iter()
            .filter(|c| self.get(*c).is_absent())
            .collect()
    }
}

/// Why a raw mapping did not become a record.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum Discard {
    #[error("listing has no title")]
    MissingTitle,
    #[error("listing has no url")]
    MissingUrl,
}

/// Composite identity used for duplicate detection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IdentityKey {
    Reference(String),
    Untracked { title: String, url: String },
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdentityKey::Reference(reference) => write!(f, "ref:{reference}"),
            IdentityKey::Untracked { title, url } => write!(f, "untracked:{title}|{url}"),
        }
    }
}

/// Canonical, fixed-column tender listing.
///
/// Every field is free text and the empty string means "unknown". Title and
/// url are guaranteed non-empty; records are immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "ListingFields", into = "ListingFields")]
pub struct ListingRecord {
    values: [String; Column::COUNT],
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ListingFields {
    domain_category: String,
    inquiry_deadline: String,
    document_fee: String,
    issuing_authority: String,
    reference_number: String,
    submission_deadline: String,
    url: String,
    title: String,
    published_at: String,
}

impl ListingRecord {
    /// Reshape a raw field mapping into canonical order, gating on the
    /// two required fields.
    pub fn from_fields(raw: &RawFields) -> Result<Self, Discard> {
        let values = Column::ALL.map(|c| raw.value(c).trim().to_string());
        Self::from_values(values)
    }

    fn from_values(values: [String; Column::COUNT]) -> Result<Self, Discard> {
        if values[Column::Title.position()].is_empty() {
            return Err(Discard::MissingTitle);
        }
        if values[Column::Url.position()].is_empty() {
            return Err(Discard::MissingUrl);
        }
        Ok(Self { values })
    }

    pub fn get(&self, column: Column) -> &str {
        &self.values[column.position()]
    }

    pub fn title(&self) -> &str {
        self.get(Column::Title)
    }

    pub fn url(&self) -> &str {
        self.get(Column::Url)
    }

    pub fn reference_number(&self) -> &str {
        self.get(Column::ReferenceNumber)
    }

    pub fn published_at(&self) -> &str {
        self.get(Column::PublishedAt)
    }

    pub fn identity_key(&self) -> IdentityKey {
        let reference = self.reference_number();
        if reference.is_empty() {
            IdentityKey::Untracked {
                title: self.title().to_string(),
                url: self.url().to_string(),
            }
        } else {
            IdentityKey::Reference(reference.to_string())
        }
    }

    /// Row cells in store column order.
    pub fn to_row(&self) -> Vec<String> {
        self.values.to_vec()
    }
}

impl TryFrom<ListingFields> for ListingRecord {
    type Error = Discard;

    fn try_from(f: ListingFields) -> Result<Self, Self::Error> {
        Self::from_values([
            f.domain_category,
            f.inquiry_deadline,
            f.document_fee,
            f.issuing_authority,
            f.reference_number,
            f.submission_deadline,
            f.url,
            f.title,
            f.published_at,
        ])
    }
}

impl From<ListingRecord> for ListingFields {
    fn from(record: ListingRecord) -> Self {
        let [domain_category, inquiry_deadline, document_fee, issuing_authority, reference_number, submission_deadline, url, title, published_at] =
            record.values;
        Self {
            domain_category,
            inquiry_deadline,
            document_fee,
            issuing_authority,
            reference_number,
            submission_deadline,
            url,
            title,
            published_at,
        }
    }
}

/// Three-bucket relevance label assigned by the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelevanceLabel {
    High,
    Medium,
    Low,
}

impl RelevanceLabel {
    pub const HIGH_THRESHOLD: f64 = 0.7;
    pub const MEDIUM_THRESHOLD: f64 = 0.4;

    pub fn from_score(score: f64) -> Self {
        if score >= Self::HIGH_THRESHOLD {
            RelevanceLabel::High
        } else if score >= Self::MEDIUM_THRESHOLD {
            RelevanceLabel::Medium
        } else {
            RelevanceLabel::Low
        }
    }

    pub fn arabic(self) -> &'static str {
        match self {
            RelevanceLabel::High => "مرتفع",
            RelevanceLabel::Medium => "متوسط",
            RelevanceLabel::Low => "منخفض",
        }
    }
}
