use std::time::Duration;

use jobscout_adapters::{CrawlQuery, FetchError, HtmlListingSource, PostingSource};
use jobscout_storage::{HttpClientConfig, HttpError, HttpFetcher};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::time::Instant;

const FIRST_PAGE: &str = r#"<ul><li>
  <div class="base-card" data-entity-urn="urn:li:jobPosting:5001">
    <a class="base-card__full-link" href="/jobs/view/5001"></a>
    <h3 class="base-search-card__title">Platform Engineer</h3>
  </div>
</li></ul>"#;

/// Serves one listing page, then never answers follow-up pages or
/// `stalled` searches.
async fn spawn_listing_server() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => request.extend_from_slice(&buf[..n]),
                    }
                }
                let head = String::from_utf8_lossy(&request).into_owned();
                let request_line = head.lines().next().unwrap_or_default();
                if request_line.contains("start=") || request_line.contains("keywords=stalled") {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    return;
                }
                let response = format!(
                    "HTTP/1.1 200 OK\r\ncontent-type: text/html\r\ncontent-length: {}\r\n\
                     connection: close\r\n\r\n{FIRST_PAGE}",
                    FIRST_PAGE.len()
                );
                let _ = stream.write_all(response.as_bytes()).await;
            });
        }
    });
    format!("http://{addr}/jobs/search")
}

fn source(search_url: &str) -> HtmlListingSource {
    let http = HttpFetcher::new(HttpClientConfig {
        request_interval: Duration::ZERO,
        ..Default::default()
    })
    .unwrap();
    HtmlListingSource::new("local", search_url, 25, http).unwrap()
}

#[tokio::test]
async fn stalled_second_page_keeps_first_page_results() {
    let search_url = spawn_listing_server().await;
    let mut query = CrawlQuery::new("platform");
    query.max_pages = 3;
    let started = Instant::now();

    let postings = source(&search_url)
        .fetch_postings(&query, started + Duration::from_secs(1))
        .await
        .expect("first page survives the deadline");

    assert_eq!(postings.len(), 1);
    assert_eq!(postings[0].id, "5001");
    assert_eq!(postings[0].title, "Platform Engineer");
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn stalled_first_page_reports_the_deadline() {
    let search_url = spawn_listing_server().await;
    let started = Instant::now();

    let err = source(&search_url)
        .fetch_postings(&CrawlQuery::new("stalled"), started + Duration::from_millis(500))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        FetchError::Http(HttpError::DeadlineExceeded { .. })
    ));
    assert!(started.elapsed() < Duration::from_secs(5));
}
