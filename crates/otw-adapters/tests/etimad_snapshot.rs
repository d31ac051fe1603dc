use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use otw_adapters::{
    adapter_for_source, load_captured_page, load_captured_pages, CapturedPageSource,
    PortalSettings, ETIMAD_SOURCE_ID,
};
use otw_core::Column;
use otw_storage::PageSource;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct Snapshot {
    selector: String,
    cards: Vec<BTreeMap<String, String>>,
}

fn fixtures_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures")
}

fn load_snapshot() -> Snapshot {
    let path = fixtures_root().join("etimad/hackathon/snapshot.json");
    serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap()
}

#[test]
fn hackathon_page_matches_snapshot() {
    let page = load_captured_page(fixtures_root().join("etimad/hackathon/bundle.json")).unwrap();
    let adapter = adapter_for_source(&page.source_id, &PortalSettings::default())
        .unwrap()
        .expect("etimad adapter registered");
    assert_eq!(adapter.search_url(&page.keyword), page.captured_from_url);

    let html = page.raw_artifact.inline_text.as_deref().unwrap();
    let selection = adapter.select_cards(html);
    let snapshot = load_snapshot();
    assert_eq!(selection.selector.as_deref(), Some(snapshot.selector.as_str()));
    assert_eq!(selection.cards.len(), snapshot.cards.len());

    for (i, (card, expected)) in selection.cards.iter().zip(&snapshot.cards).enumerate() {
        let fields = adapter.parse_card(card);
        for column in Column::ALL {
            assert_eq!(
                fields.value(column),
                expected[&column.to_string()],
                "card {i} column {column}"
            );
        }
    }
}

#[tokio::test]
async fn captured_pages_replay_through_page_source() {
    let pages = load_captured_pages(fixtures_root(), ETIMAD_SOURCE_ID).unwrap();
    assert_eq!(pages.len(), 1);
    let url = pages[0].captured_from_url.clone();
    let source = CapturedPageSource::new(pages);

    let response = source.fetch_page(&url).await.unwrap();
    assert!(response.status.is_success());
    assert!(response.body.contains("هاكاثون"));
}
