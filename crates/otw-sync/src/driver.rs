use chrono::{Local, NaiveDate};
use futures::stream::{self, StreamExt};
use otw_adapters::SourceAdapter;
use otw_core::{dates, Discard, IdentityKey, ListingRecord};
use otw_storage::{FetchError, FetchedResponse, PageArchive, PageSource};
use serde::Serialize;
use tracing::{debug, info, info_span, warn};

use crate::dedup::SeenSet;

#[derive(Debug, Clone)]
pub struct SearchSettings {
    pub per_keyword_limit: usize,
    pub require_today: bool,
    pub concurrency: usize,
    pub today: NaiveDate,
}

impl SearchSettings {
    pub fn new(per_keyword_limit: usize, require_today: bool) -> Self {
        Self {
            per_keyword_limit,
            require_today,
            concurrency: 4,
            today: Local::now().date_naive(),
        }
    }
}

/// Result of fetching one keyword's search page.
#[derive(Debug)]
pub enum FetchOutcome {
    Page(FetchedResponse),
    NoContent,
    Failed(FetchError),
}

impl FetchOutcome {
    fn from_result(result: Result<FetchedResponse, FetchError>) -> Self {
        match result {
            Ok(resp) if resp.body.trim().is_empty() => FetchOutcome::NoContent,
            Ok(resp) => FetchOutcome::Page(resp),
            Err(FetchError::EmptyBody { .. }) => FetchOutcome::NoContent,
            Err(err) => FetchOutcome::Failed(err),
        }
    }
}

/// What happened to one candidate card.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CardOutcome {
    Accepted(ListingRecord),
    Incomplete(Discard),
    NotToday { published_at: String },
    Duplicate(IdentityKey),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KeywordStatus {
    Searched,
    NoContent,
    FetchFailed,
}

/// Per-keyword counters for logs and the run report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeywordReport {
    pub keyword: String,
    pub search_url: String,
    pub status: KeywordStatus,
    pub card_selector: Option<String>,
    pub cards_found: usize,
    pub accepted: usize,
    pub incomplete: usize,
    pub not_today: usize,
    pub duplicates: usize,
    pub capped: bool,
    pub error: Option<String>,
}

impl KeywordReport {
    fn new(keyword: &str, search_url: &str, status: KeywordStatus) -> Self {
        Self {
            keyword: keyword.to_string(),
            search_url: search_url.to_string(),
            status,
            card_selector: None,
            cards_found: 0,
            accepted: 0,
            incomplete: 0,
            not_today: 0,
            duplicates: 0,
            capped: false,
            error: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AcceptedListing {
    pub keyword: String,
    pub record: ListingRecord,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SearchRun {
    pub accepted: Vec<AcceptedListing>,
    pub keywords: Vec<KeywordReport>,
}

impl SearchRun {
    pub fn records(&self) -> Vec<ListingRecord> {
        self.accepted.iter().map(|a| a.record.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.accepted.is_empty()
    }
}

/// Runs every keyword through fetch, card parsing, normalization, the today
/// filter and in-run dedup.
///
/// Pages are fetched concurrently; everything after the fetch happens in one
/// pass over the keywords in their configured order, so results and per-keyword
/// caps match a sequential run.
pub struct KeywordSearchDriver<'a> {
    adapter: &'a dyn SourceAdapter,
    pages: &'a dyn PageSource,
    archive: Option<&'a PageArchive>,
    settings: SearchSettings,
}

impl<'a> KeywordSearchDriver<'a> {
    pub fn new(
        adapter: &'a dyn SourceAdapter,
        pages: &'a dyn PageSource,
        settings: SearchSettings,
    ) -> Self {
        Self {
            adapter,
            pages,
            archive: None,
            settings,
        }
    }

    pub fn with_archive(mut self, archive: &'a PageArchive) -> Self {
        self.archive = Some(archive);
        self
    }

    pub async fn run(&self, keywords: &[String]) -> SearchRun {
        let fetched: Vec<(String, String, FetchOutcome)> = stream::iter(keywords.iter().cloned())
            .map(|keyword: String| async move {
                let url = self.adapter.search_url(&keyword);
                let outcome = self.fetch(&keyword, &url).await;
                (keyword, url, outcome)
            })
            .buffered(self.settings.concurrency.max(1))
            .collect()
            .await;

        let mut seen = SeenSet::new();
        let mut run = SearchRun::default();
        for (keyword, url, outcome) in fetched {
            let report = self.merge_keyword(&mut seen, &keyword, &url, outcome, &mut run.accepted);
            run.keywords.push(report);
        }

        info!(
            source_id = self.adapter.source_id(),
            keywords = run.keywords.len(),
            accepted = run.accepted.len(),
            "keyword search finished"
        );
        run
    }

    async fn fetch(&self, keyword: &str, url: &str) -> FetchOutcome {
        let outcome = FetchOutcome::from_result(self.pages.fetch_page(url).await);
        match &outcome {
            FetchOutcome::Page(resp) => {
                if let Some(archive) = self.archive {
                    if let Err(err) = archive
                        .archive_page(resp.fetched_at, self.adapter.source_id(), &resp.body)
                        .await
                    {
                        warn!(keyword, error = %err, "failed to archive search page");
                    }
                }
            }
            FetchOutcome::NoContent => info!(keyword, "search page had no content"),
            FetchOutcome::Failed(err) => warn!(keyword, error = %err, "keyword skipped after fetch failure"),
        }
        outcome
    }

    fn merge_keyword(
        &self,
        seen: &mut SeenSet,
        keyword: &str,
        url: &str,
        outcome: FetchOutcome,
        accepted: &mut Vec<AcceptedListing>,
    ) -> KeywordReport {
        let span = info_span!("keyword_search", keyword, source_id = self.adapter.source_id());
        let _entered = span.enter();

        let page = match outcome {
            FetchOutcome::Page(page) => page,
            FetchOutcome::NoContent => return KeywordReport::new(keyword, url, KeywordStatus::NoContent),
            FetchOutcome::Failed(err) => {
                let mut report = KeywordReport::new(keyword, url, KeywordStatus::FetchFailed);
                report.error = Some(err.to_string());
                return report;
            }
        };

        let mut report = KeywordReport::new(keyword, url, KeywordStatus::Searched);
        let selection = self.adapter.select_cards(&page.body);
        report.card_selector = selection.selector;
        report.cards_found = selection.cards.len();

        for (index, card) in selection.cards.iter().enumerate() {
            match self.evaluate_card(seen, card) {
                CardOutcome::Accepted(record) => {
                    debug!(identity = %record.identity_key(), "accepted listing");
                    accepted.push(AcceptedListing {
                        keyword: keyword.to_string(),
                        record,
                    });
                    report.accepted += 1;
                    if report.accepted >= self.settings.per_keyword_limit {
                        report.capped = index + 1 < selection.cards.len();
                        break;
                    }
                }
                CardOutcome::Incomplete(reason) => {
                    debug!(%reason, "card discarded");
                    report.incomplete += 1;
                }
                CardOutcome::NotToday { published_at } => {
                    debug!(%published_at, "card not published today");
                    report.not_today += 1;
                }
                CardOutcome::Duplicate(key) => {
                    debug!(identity = %key, "duplicate listing");
                    report.duplicates += 1;
                }
            }
        }

        info!(
            cards = report.cards_found,
            accepted = report.accepted,
            capped = report.capped,
            "keyword merged"
        );
        report
    }

    /// Parse, normalize, filter and dedup one card. Accepting inserts into `seen`.
    pub fn evaluate_card(&self, seen: &mut SeenSet, card_html: &str) -> CardOutcome {
        let fields = self.adapter.parse_card(card_html);
        let record = match ListingRecord::from_fields(&fields) {
            Ok(record) => record,
            Err(reason) => return CardOutcome::Incomplete(reason),
        };

        let published_at = record.published_at();
        if self.settings.require_today
            && !published_at.is_empty()
            && !dates::is_today_on(published_at, self.settings.today)
        {
            return CardOutcome::NotToday {
                published_at: published_at.to_string(),
            };
        }

        if !seen.insert(&record) {
            return CardOutcome::Duplicate(record.identity_key());
        }
        CardOutcome::Accepted(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use async_trait::async_trait;
    use chrono::Utc;
    use otw_adapters::{etimad_adapter, PortalSettings};
    use otw_core::Column;

    enum Stub {
        Html(String),
        Status(u16),
        Empty,
    }

    #[derive(Default)]
    struct StubPages {
        pages: HashMap<String, Stub>,
    }

    impl StubPages {
        fn with(mut self, adapter: &dyn SourceAdapter, keyword: &str, stub: Stub) -> Self {
            self.pages.insert(adapter.search_url(keyword), stub);
            self
        }
    }

    #[async_trait]
    impl PageSource for StubPages {
        async fn fetch_page(&self, url: &str) -> Result<FetchedResponse, FetchError> {
            match self.pages.get(url) {
                Some(Stub::Html(body)) => Ok(FetchedResponse::ok(url, Utc::now(), body.clone())),
                Some(Stub::Empty) => Err(FetchError::EmptyBody { url: url.into() }),
                Some(Stub::Status(status)) => Err(FetchError::HttpStatus {
                    status: *status,
                    url: url.into(),
                }),
                None => Err(FetchError::HttpStatus {
                    status: 404,
                    url: url.into(),
                }),
            }
        }
    }

    fn card(reference: &str, title: &str, href: &str, published: &str) -> String {
        let mut html = format!(r#"<div class="card-body"><h4><a href="{href}">{title}</a></h4>"#);
        if !reference.is_empty() {
            html.push_str(&format!("<p>الرقم المرجعي: {reference}</p>"));
        }
        if !published.is_empty() {
            html.push_str(&format!("<p>تاريخ النشر: {published}</p>"));
        }
        html.push_str("</div>");
        html
    }

    fn page(cards: &[String]) -> Stub {
        Stub::Html(format!("<html><body>{}</body></html>", cards.concat()))
    }

    fn settings(limit: usize) -> SearchSettings {
        SearchSettings {
            per_keyword_limit: limit,
            require_today: true,
            concurrency: 4,
            today: NaiveDate::from_ymd_opt(2026, 10, 19).unwrap(),
        }
    }

    fn keywords(list: &[&str]) -> Vec<String> {
        list.iter().map(|k| k.to_string()).collect()
    }

    #[tokio::test]
    async fn same_reference_today_and_yesterday_yields_one_listing() {
        let adapter = etimad_adapter(&PortalSettings::default()).unwrap();
        let pages = StubPages::default().with(
            &adapter,
            "هاكاثون",
            page(&[
                card("123", "تنظيم هاكاثون", "/t/1", "اليوم"),
                card("123", "تنظيم هاكاثون", "/t/1", "2026-10-18"),
            ]),
        );
        let driver = KeywordSearchDriver::new(&adapter, &pages, settings(25));
        let run = driver.run(&keywords(&["هاكاثون"])).await;

        assert_eq!(run.accepted.len(), 1);
        let record = &run.accepted[0].record;
        assert_eq!(record.reference_number(), "123");
        assert_eq!(record.url(), "https://portal.etimad.sa/t/1");
        assert_eq!(run.keywords[0].not_today, 1);
        assert_eq!(run.keywords[0].status, KeywordStatus::Searched);
    }

    #[tokio::test]
    async fn per_keyword_cap_stops_processing() {
        let adapter = etimad_adapter(&PortalSettings::default()).unwrap();
        let cards: Vec<String> = (1..=4)
            .map(|i| card(&format!("R{i}"), &format!("فعالية {i}"), &format!("/t/{i}"), "اليوم"))
            .collect();
        let pages = StubPages::default().with(&adapter, "فعالية", page(&cards));
        let driver = KeywordSearchDriver::new(&adapter, &pages, settings(2));
        let run = driver.run(&keywords(&["فعالية"])).await;

        let refs: Vec<&str> = run.accepted.iter().map(|a| a.record.reference_number()).collect();
        assert_eq!(refs, vec!["R1", "R2"]);
        assert!(run.keywords[0].capped);
        assert_eq!(run.keywords[0].cards_found, 4);
    }

    #[tokio::test]
    async fn duplicates_across_keywords_are_emitted_once_in_keyword_order() {
        let adapter = etimad_adapter(&PortalSettings::default()).unwrap();
        let shared = card("R1", "هاكاثون الابتكار", "/t/1", "اليوم");
        let pages = StubPages::default()
            .with(&adapter, "ابتكار", page(&[card("R2", "مسابقة ابتكار", "/t/2", ""), shared.clone()]))
            .with(&adapter, "هاكاثون", page(&[shared]));
        let driver = KeywordSearchDriver::new(&adapter, &pages, settings(25));
        let run = driver.run(&keywords(&["ابتكار", "هاكاثون"])).await;

        let accepted: Vec<(&str, &str)> = run
            .accepted
            .iter()
            .map(|a| (a.keyword.as_str(), a.record.reference_number()))
            .collect();
        assert_eq!(accepted, vec![("ابتكار", "R2"), ("ابتكار", "R1")]);
        assert_eq!(run.keywords[1].duplicates, 1);
        assert_eq!(run.keywords[1].accepted, 0);
    }

    #[tokio::test]
    async fn failing_keywords_do_not_abort_the_run() {
        let adapter = etimad_adapter(&PortalSettings::default()).unwrap();
        let pages = StubPages::default()
            .with(&adapter, "event", Stub::Status(503))
            .with(&adapter, "events", Stub::Empty)
            .with(&adapter, "hackathon", page(&[card("H1", "Hackathon", "/t/h1", "Today")]));
        let driver = KeywordSearchDriver::new(&adapter, &pages, settings(25));
        let run = driver.run(&keywords(&["event", "events", "hackathon"])).await;

        assert_eq!(run.accepted.len(), 1);
        let statuses: Vec<KeywordStatus> = run.keywords.iter().map(|k| k.status).collect();
        assert_eq!(
            statuses,
            vec![KeywordStatus::FetchFailed, KeywordStatus::NoContent, KeywordStatus::Searched]
        );
        assert!(run.keywords[0].error.as_deref().unwrap().contains("503"));
    }

    #[tokio::test]
    async fn today_filter_respects_flag_and_empty_dates() {
        let adapter = etimad_adapter(&PortalSettings::default()).unwrap();
        let cards = [
            card("A", "بلا تاريخ", "/t/a", ""),
            card("B", "امس", "/t/b", "18/10/2026"),
            card("", "بلا رقم", "https://portal.etimad.sa/t/c", "19 أكتوبر 2026"),
        ];
        let pages = StubPages::default().with(&adapter, "فعاليات", page(&cards));

        let strict = KeywordSearchDriver::new(&adapter, &pages, settings(25));
        let run = strict.run(&keywords(&["فعاليات"])).await;
        let titles: Vec<&str> = run.accepted.iter().map(|a| a.record.title()).collect();
        assert_eq!(titles, vec!["بلا تاريخ", "بلا رقم"]);

        let mut relaxed_settings = settings(25);
        relaxed_settings.require_today = false;
        let relaxed = KeywordSearchDriver::new(&adapter, &pages, relaxed_settings);
        assert_eq!(relaxed.run(&keywords(&["فعاليات"])).await.accepted.len(), 3);
    }

    #[test]
    fn cards_without_link_are_incomplete() {
        let adapter = etimad_adapter(&PortalSettings::default()).unwrap();
        let pages = StubPages::default();
        let driver = KeywordSearchDriver::new(&adapter, &pages, settings(25));
        let mut seen = SeenSet::new();
        let outcome = driver.evaluate_card(&mut seen, "<div><h5>بلا رابط</h5></div>");
        assert_eq!(outcome, CardOutcome::Incomplete(Discard::MissingUrl));
        assert!(seen.is_empty());

        let outcome = driver.evaluate_card(&mut seen, &card("X", "عنوان", "/t/x", "اليوم"));
        let CardOutcome::Accepted(record) = outcome else {
            panic!("expected acceptance");
        };
        assert_eq!(record.get(Column::ReferenceNumber), "X");
    }

    #[tokio::test]
    async fn fetched_pages_are_archived() {
        let dir = tempfile::tempdir().unwrap();
        let archive = PageArchive::new(dir.path());
        let adapter = etimad_adapter(&PortalSettings::default()).unwrap();
        let pages = StubPages::default().with(&adapter, "event", page(&[card("E", "Event", "/t/e", "Today")]));
        let driver = KeywordSearchDriver::new(&adapter, &pages, settings(25)).with_archive(&archive);
        driver.run(&keywords(&["event"])).await;

        let stamp_dirs: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(stamp_dirs.len(), 1);
    }
}
