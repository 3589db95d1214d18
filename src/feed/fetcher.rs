use std::future::Future;
use std::time::Duration;

use futures::StreamExt;
use reqwest::header::{HeaderName, ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED};
use reqwest::StatusCode;
use thiserror::Error;

use crate::config::Config;
use crate::feed::parser::{parse_feed, ParsedFeed};
use crate::storage::Feed;

/// Errors that can occur during a conditional fetch.
///
/// [`FetchError::Unreachable`] is the distinct "this feed cannot be reached"
/// signal; a `304 Not Modified` is not an error but
/// [`FetchOutcome::NotModified`].
#[derive(Debug, Error)]
pub enum FetchError {
    /// The server answered 404/410, or the host could not be resolved or connected to
    #[error("'{0}' was not found!")]
    Unreachable(String),
    /// Any other network-level error (TLS, protocol, body read, truncated body)
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// HTTP response with a non-2xx status other than 304/404/410
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// Request exceeded the configured timeout
    #[error("Request timed out")]
    Timeout,
    /// Response body exceeded the configured size limit
    #[error("Response too large")]
    ResponseTooLarge,
    /// Feed XML could not be parsed as RSS or Atom
    #[error("Parse error: {0}")]
    Parse(String),
}

/// Result of a successful conditional fetch.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    /// The server confirmed the cached tokens are current.
    NotModified,
    Parsed(FetchedFeed),
}

/// A freshly downloaded feed together with the validators the server sent.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FetchedFeed {
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub feed: ParsedFeed,
}

/// Conditional fetch capability consumed by the reconciler.
///
/// Implementations are stateless with respect to the feed: they read its
/// cached validators but never modify it.
pub trait FeedFetcher {
    fn fetch(&self, feed: &Feed) -> impl Future<Output = Result<FetchOutcome, FetchError>> + Send;
}

/// [`FeedFetcher`] over HTTP using `If-None-Match` / `If-Modified-Since`.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    timeout: Duration,
    max_bytes: usize,
}

impl HttpFetcher {
    pub fn new(client: reqwest::Client, timeout: Duration, max_bytes: usize) -> Self {
        Self {
            client,
            timeout,
            max_bytes,
        }
    }

    /// Builds a fetcher with the timeout, size limit and user agent of `config`.
    pub fn from_config(config: &Config) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.as_str())
            .build()?;
        Ok(Self::new(
            client,
            Duration::from_secs(config.request_timeout_secs),
            config.max_feed_bytes,
        ))
    }
}

impl FeedFetcher for HttpFetcher {
    /// Fetches `feed`, sending its cached validators as conditional headers.
    ///
    /// # Errors
    ///
    /// - [`FetchError::Unreachable`] - 404/410, unresolvable host, refused connection
    /// - [`FetchError::Timeout`] - no response within the configured timeout
    /// - [`FetchError::HttpStatus`] - any other non-2xx status
    /// - [`FetchError::ResponseTooLarge`] - body exceeded the size limit
    /// - [`FetchError::Parse`] - body is not RSS or Atom
    ///
    /// No retries are attempted.
    async fn fetch(&self, feed: &Feed) -> Result<FetchOutcome, FetchError> {
        let mut request = self.client.get(&feed.url);
        if let Some(etag) = &feed.etag {
            request = request.header(IF_NONE_MATCH, etag.as_str());
        }
        if let Some(modified) = &feed.last_modified {
            request = request.header(IF_MODIFIED_SINCE, modified.as_str());
        }

        let response = match tokio::time::timeout(self.timeout, request.send()).await {
            Err(_) => return Err(FetchError::Timeout),
            Ok(Err(e)) if e.is_connect() || e.is_builder() => {
                tracing::warn!(feed = %feed.url, error = %e, "Feed unreachable");
                return Err(FetchError::Unreachable(feed.url.clone()));
            }
            Ok(Err(e)) => return Err(FetchError::Network(e)),
            Ok(Ok(response)) => response,
        };

        match response.status() {
            StatusCode::NOT_MODIFIED => {
                tracing::debug!(feed = %feed.url, "Feed not modified");
                return Ok(FetchOutcome::NotModified);
            }
            StatusCode::NOT_FOUND | StatusCode::GONE => {
                tracing::warn!(feed = %feed.url, status = %response.status(), "Feed unreachable");
                return Err(FetchError::Unreachable(feed.url.clone()));
            }
            status if !status.is_success() => {
                return Err(FetchError::HttpStatus(status.as_u16()));
            }
            _ => {}
        }

        let etag = header_string(&response, ETAG);
        let last_modified = header_string(&response, LAST_MODIFIED);
        let bytes = read_limited_bytes(response, self.max_bytes).await?;
        let parsed = parse_feed(&bytes).map_err(|e| FetchError::Parse(e.to_string()))?;

        tracing::debug!(
            feed = %feed.url,
            entries = parsed.entries.len(),
            etag = ?etag,
            "Fetched feed"
        );

        Ok(FetchOutcome::Parsed(FetchedFeed {
            etag,
            last_modified,
            feed: parsed,
        }))
    }
}

fn header_string(response: &reqwest::Response, name: HeaderName) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, FetchError> {
    // Fast path: check Content-Length header
    if let Some(len) = response.content_length() {
        if len > limit as u64 {
            return Err(FetchError::ResponseTooLarge);
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(FetchError::Network)?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(FetchError::ResponseTooLarge);
        }
        bytes.extend_from_slice(&chunk);
    }

    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const VALID_RSS: &str = r#"<?xml version="1.0"?>
<rss version="2.0"><channel>
    <title>Test Feed</title>
    <link>https://example.com/</link>
    <item><guid>1</guid><title>Test</title></item>
</channel></rss>"#;

    fn fetcher() -> HttpFetcher {
        HttpFetcher::new(reqwest::Client::new(), Duration::from_secs(5), 1024 * 1024)
    }

    fn feed_at(server: &MockServer) -> Feed {
        Feed::new(format!("{}/feed", server.uri()))
    }

    #[tokio::test]
    async fn test_fetch_parses_and_returns_validators() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/feed"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(VALID_RSS)
                    .insert_header("Content-Type", "application/xml")
                    .insert_header("ETag", "\"v2\"")
                    .insert_header("Last-Modified", "Tue, 02 Jan 2024 00:00:00 GMT"),
            )
            .mount(&mock_server)
            .await;

        let fetched = match fetcher().fetch(&feed_at(&mock_server)).await.unwrap() {
            FetchOutcome::Parsed(fetched) => fetched,
            other => panic!("Expected Parsed, got {:?}", other),
        };
        assert_eq!(fetched.etag.as_deref(), Some("\"v2\""));
        assert_eq!(
            fetched.last_modified.as_deref(),
            Some("Tue, 02 Jan 2024 00:00:00 GMT")
        );
        assert_eq!(fetched.feed.title.as_deref(), Some("Test Feed"));
        assert_eq!(fetched.feed.entries.len(), 1);
        assert_eq!(fetched.feed.entries[0].id, "1");
    }

    #[tokio::test]
    async fn test_fetch_sends_conditional_headers_and_handles_304() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/feed"))
            .and(header("If-None-Match", "\"v1\""))
            .and(header_exists("If-Modified-Since"))
            .respond_with(ResponseTemplate::new(304))
            .expect(1)
            .mount(&mock_server)
            .await;

        let mut feed = feed_at(&mock_server);
        feed.etag = Some("\"v1\"".to_string());
        feed.last_modified = Some("Mon, 01 Jan 2024 00:00:00 GMT".to_string());

        let outcome = fetcher().fetch(&feed).await.unwrap();
        assert_eq!(outcome, FetchOutcome::NotModified);
    }

    #[tokio::test]
    async fn test_fetch_404_is_unreachable() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&mock_server)
            .await;

        let feed = feed_at(&mock_server);
        match fetcher().fetch(&feed).await {
            Err(FetchError::Unreachable(url)) => assert_eq!(url, feed.url),
            other => panic!("Expected Unreachable, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_fetch_refused_connection_is_unreachable() {
        let feed = Feed::new("http://127.0.0.1:1/feed");
        let result = fetcher().fetch(&feed).await;
        assert!(matches!(result, Err(FetchError::Unreachable(_))));
    }

    #[tokio::test]
    async fn test_fetch_500_fails_without_retry() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&mock_server)
            .await;

        let result = fetcher().fetch(&feed_at(&mock_server)).await;
        assert!(matches!(result, Err(FetchError::HttpStatus(500))));
    }

    #[tokio::test]
    async fn test_malformed_feed_parse_error() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<not valid xml"))
            .mount(&mock_server)
            .await;

        let result = fetcher().fetch(&feed_at(&mock_server)).await;
        assert!(matches!(result, Err(FetchError::Parse(_))));
    }

    #[tokio::test]
    async fn test_oversized_response_rejected() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(VALID_RSS))
            .mount(&mock_server)
            .await;

        let small = HttpFetcher::new(reqwest::Client::new(), Duration::from_secs(5), 16);
        let result = small.fetch(&feed_at(&mock_server)).await;
        assert!(matches!(result, Err(FetchError::ResponseTooLarge)));
    }

    #[tokio::test]
    async fn test_slow_response_times_out() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(VALID_RSS)
                    .set_delay(Duration::from_secs(2)),
            )
            .mount(&mock_server)
            .await;

        let impatient =
            HttpFetcher::new(reqwest::Client::new(), Duration::from_millis(100), 1024 * 1024);
        let result = impatient.fetch(&feed_at(&mock_server)).await;
        assert!(matches!(result, Err(FetchError::Timeout)));
    }

    #[tokio::test]
    async fn test_truncated_body_is_network_error() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        // Promises 1000 bytes, sends a few, then hangs up
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 1024];
            let _ = socket.read(&mut request).await;
            let _ = socket
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 1000\r\n\r\n<rss version=")
                .await;
            let _ = socket.shutdown().await;
        });

        let feed = Feed::new(format!("http://{addr}/feed"));
        let result = fetcher().fetch(&feed).await;
        assert!(matches!(result, Err(FetchError::Network(_))), "got {:?}", result);
    }
}
