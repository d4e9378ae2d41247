use std::path::{Path, PathBuf};

use finale_adapters::{adapter_for_source, BlockSelectors, FINALEOUTDOOR_SOURCE_ID};
use finale_core::ScrapedStatusEntry;

fn sample_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/finaleoutdoor/sample")
}

#[test]
fn golden_json_snapshot_test_finaleoutdoor() {
    let adapter = adapter_for_source(FINALEOUTDOOR_SOURCE_ID, &BlockSelectors::default())
        .expect("selectors")
        .expect("registered adapter");
    let html = std::fs::read_to_string(sample_dir().join("listing.html")).expect("read listing");
    let expected: Vec<ScrapedStatusEntry> = serde_json::from_str(
        &std::fs::read_to_string(sample_dir().join("snapshot.json")).expect("read snapshot"),
    )
    .expect("parse snapshot");

    let actual = adapter.extract(&html).expect("extract");
    assert_eq!(actual, expected);
}
