use std::path::{Path, PathBuf};
use std::time::Duration;

use jobscout_adapters::{load_fixture_bundle, CrawlQuery, FixtureSource, PostingSource};
use tokio::time::Instant;

fn sample_bundle_path() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .join("fixtures/sample/bundle.json")
}

fn soon() -> Instant {
    Instant::now() + Duration::from_secs(5)
}

#[test]
fn sample_bundle_hydrates_listing_html() {
    let bundle = load_fixture_bundle(sample_bundle_path()).expect("load bundle");
    assert_eq!(bundle.queries.len(), 2);
    assert!(bundle.queries[0].listing_html_text.is_none());
    assert!(bundle.queries[1]
        .listing_html_text
        .as_deref()
        .is_some_and(|html| html.contains("Junior Data Analyst")));
}

#[tokio::test]
async fn sample_source_replays_inline_postings() {
    let source = FixtureSource::from_path(sample_bundle_path()).expect("source");
    let mut query = CrawlQuery::new("Backend Engineer");
    query.location = "remote".to_string();

    let postings = source.fetch_postings(&query, soon()).await.expect("fetch");
    let titles: Vec<_> = postings.iter().map(|p| p.title.as_str()).collect();
    assert_eq!(titles, vec!["Senior Backend Engineer", "Graphic Designer"]);
    assert_eq!(postings[1].location, "");
}

#[tokio::test]
async fn sample_source_parses_captured_listing_page() {
    let source = FixtureSource::from_path(sample_bundle_path()).expect("source");
    let postings = source
        .fetch_postings(&CrawlQuery::new("data analyst"), soon())
        .await
        .expect("fetch");

    assert_eq!(postings.len(), 2);
    assert_eq!(postings[0].id, "4101");
    assert_eq!(postings[0].company, "Contoso Analytics");
    assert_eq!(postings[0].location, "Austin, TX");
    assert_eq!(
        postings[0].url,
        "https://jobs.example.com/jobs/view/junior-data-analyst-4101?refId=abc"
    );
    assert_eq!(postings[1].title, "Data Scientist, New Grad");
    assert_eq!(postings[1].posted_at, "");
}
