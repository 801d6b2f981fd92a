use async_trait::async_trait;
use reqwest::{
    header::{ACCEPT, CONTENT_TYPE, USER_AGENT},
    Client,
};

use crate::{
    config::FeedConfig,
    error::{LaunchError, Result},
    releases::Release,
};

const ACCEPT_FEED: &str = "application/vnd.github.v3+json";
const MAX_BODY_IN_ERROR: usize = 2_000;

/// Source of published runtime releases.
#[async_trait]
pub trait ReleaseFeed: Send + Sync {
    async fn releases(&self) -> Result<Vec<Release>>;
}

/// The GitHub releases API for one repository.
#[derive(Debug, Clone)]
pub struct GithubFeed {
    client: Client,
    cfg: FeedConfig,
}

impl GithubFeed {
    pub fn new(client: Client, cfg: FeedConfig) -> Self {
        Self { client, cfg }
    }
}

#[async_trait]
impl ReleaseFeed for GithubFeed {
    async fn releases(&self) -> Result<Vec<Release>> {
        let url = self.cfg.releases_url();
        let resp = self
            .client
            .get(&url)
            .header(ACCEPT, ACCEPT_FEED)
            .header(USER_AGENT, &self.cfg.user_agent)
            .send()
            .await
            .map_err(|e| LaunchError::network(&url, e))?;

        let status = resp.status();
        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_ascii_lowercase();
        let body = resp
            .text()
            .await
            .map_err(|e| LaunchError::network(&url, e))?;

        let feed_error = |message: String| LaunchError::FeedError {
            url: url.clone(),
            status: Some(status.as_u16()),
            message,
        };

        if !is_json(&content_type) {
            return Err(feed_error(format!(
                "response with status {status} has unexpected Content-Type {content_type:?}, body: {}",
                clamp(&body)
            )));
        }

        let json: serde_json::Value = serde_json::from_str(&body)
            .map_err(|e| feed_error(format!("invalid JSON: {e}")))?;

        if !status.is_success() {
            let msg = json
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("no message");
            return Err(feed_error(format!(
                "unsuccessful status {status}, message: {msg}"
            )));
        }

        serde_json::from_value(json)
            .map_err(|e| feed_error(format!("unexpected release list shape: {e}")))
    }
}

fn is_json(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .map(str::trim)
        .is_some_and(|media| media == "application/json")
}

fn clamp(body: &str) -> String {
    body.chars().take(MAX_BODY_IN_ERROR).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn feed_for(server: &MockServer) -> GithubFeed {
        let cfg = FeedConfig {
            api_base: server.uri(),
            ..FeedConfig::default()
        };
        GithubFeed::new(Client::new(), cfg)
    }

    #[tokio::test]
    async fn parses_release_list() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/krachzack/fernspielapparat/releases"))
            .and(header("accept", ACCEPT_FEED))
            .and(header("user-agent", "Krachzack-Weichspielapparat"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {
                    "tag_name": "v0.2.0",
                    "published_at": "2021-06-01T00:00:00Z",
                    "assets": [{"name": "fernspielapparat-linux.tar.gz", "url": "https://x/1"}]
                },
                {"tag_name": "draft", "published_at": null, "assets": []}
            ])))
            .expect(1)
            .mount(&server)
            .await;

        let releases = feed_for(&server).releases().await.expect("releases");
        assert_eq!(releases.len(), 2);
        assert_eq!(releases[0].assets[0].name, "fernspielapparat-linux.tar.gz");
        assert!(releases[1].published_at.is_none());
    }

    #[tokio::test]
    async fn non_success_status_surfaces_feed_message() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(403)
                    .set_body_json(serde_json::json!({"message": "API rate limit exceeded"})),
            )
            .mount(&server)
            .await;

        let err = feed_for(&server).releases().await.unwrap_err();
        match err {
            LaunchError::FeedError {
                status, message, ..
            } => {
                assert_eq!(status, Some(403));
                assert!(message.contains("rate limit"), "{message}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn html_response_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw("<html>captive portal</html>", "text/html"),
            )
            .mount(&server)
            .await;

        let err = feed_for(&server).releases().await.unwrap_err();
        assert!(matches!(err, LaunchError::FeedError { .. }));
        assert!(err.to_string().contains("text/html"));
    }

    #[test]
    fn json_content_type_allows_parameters() {
        assert!(is_json("application/json"));
        assert!(is_json("application/json; charset=utf-8"));
        assert!(!is_json("application/octet-stream"));
        assert!(!is_json(""));
    }
}
