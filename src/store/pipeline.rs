//! REST key-value backend spoken over a command pipeline.
//!
//! Every operation is one HTTP POST to `<url>/pipeline` whose body is an
//! array of command arrays, e.g. `[["GET","k"],["SET","k","v","EX","60"]]`.
//! The reply is an array of `{"result": ...}` objects in the same order.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, trace};

use crate::config::StoreConfig;
use crate::error::{RateLimitError, Result};

/// Keys requested per SCAN page.
pub const SCAN_PAGE_SIZE: u32 = 100;

/// The primitive key-value operations the remote entry store needs.
#[async_trait]
pub trait KvBackend: Send + Sync {
    /// Fetch a value.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Store a value that expires after `ttl_secs`.
    async fn set(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()>;

    /// Delete keys. An empty slice is a no-op.
    async fn delete(&self, keys: &[String]) -> Result<()>;

    /// List every key matching a glob pattern, following the cursor to the end.
    async fn scan(&self, pattern: &str) -> Result<Vec<String>>;
}

/// One entry of a pipeline reply.
#[derive(Debug, Deserialize)]
struct PipelineReply {
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<String>,
}

/// HTTP client for a REST key-value store with a `/pipeline` endpoint.
#[derive(Debug, Clone)]
pub struct PipelineClient {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl PipelineClient {
    /// Create a client for the given endpoint and token.
    pub fn new(base_url: &str, token: &str, client: reqwest::Client) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        }
    }

    /// Create a client from store configuration.
    pub fn from_config(config: &StoreConfig) -> Result<Self> {
        let url = config
            .url
            .as_deref()
            .ok_or_else(|| RateLimitError::Config("store.url is not set".to_string()))?;
        let token = config
            .token
            .as_deref()
            .ok_or_else(|| RateLimitError::Config("store.token is not set".to_string()))?;

        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;
        Ok(Self::new(url, token, client))
    }

    /// The endpoint this client talks to.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Execute a batch of commands and return their results in order.
    pub async fn pipeline(&self, commands: Vec<Vec<String>>) -> Result<Vec<Value>> {
        let url = format!("{}/pipeline", self.base_url);
        let expected = commands.len();
        trace!(commands = expected, "Sending pipeline");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .json(&commands)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(RateLimitError::Backend(format!(
                "pipeline request failed: {}",
                status
            )));
        }

        let replies: Vec<PipelineReply> = response.json().await?;
        if replies.len() != expected {
            return Err(RateLimitError::Backend(format!(
                "pipeline returned {} replies for {} commands",
                replies.len(),
                expected
            )));
        }

        replies
            .into_iter()
            .map(|reply| match reply.error {
                Some(error) => Err(RateLimitError::Backend(error)),
                None => Ok(reply.result),
            })
            .collect()
    }

    async fn single(&self, command: Vec<String>) -> Result<Value> {
        self.pipeline(vec![command])
            .await?
            .pop()
            .ok_or_else(|| RateLimitError::Backend("empty pipeline reply".to_string()))
    }
}

#[async_trait]
impl KvBackend for PipelineClient {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        match self.single(vec!["GET".into(), key.into()]).await? {
            Value::Null => Ok(None),
            Value::String(value) => Ok(Some(value)),
            other => Ok(Some(other.to_string())),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()> {
        self.single(vec![
            "SET".into(),
            key.into(),
            value.into(),
            "EX".into(),
            ttl_secs.to_string(),
        ])
        .await?;
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut command = Vec::with_capacity(keys.len() + 1);
        command.push("DEL".to_string());
        command.extend(keys.iter().cloned());
        self.single(command).await?;
        Ok(())
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>> {
        let mut cursor = "0".to_string();
        let mut keys = Vec::new();

        loop {
            let reply = self
                .single(vec![
                    "SCAN".into(),
                    cursor.clone(),
                    "MATCH".into(),
                    pattern.into(),
                    "COUNT".into(),
                    SCAN_PAGE_SIZE.to_string(),
                ])
                .await?;

            let (next, page) = parse_scan_reply(&reply)?;
            debug!(cursor = %next, found = page.len(), "Scanned key page");
            keys.extend(page);

            if next == "0" {
                return Ok(keys);
            }
            cursor = next;
        }
    }
}

/// Split a `[cursor, [keys...]]` SCAN reply.
fn parse_scan_reply(reply: &Value) -> Result<(String, Vec<String>)> {
    let malformed = || RateLimitError::Backend(format!("malformed SCAN reply: {}", reply));

    let cursor = match reply.get(0) {
        Some(Value::String(cursor)) => cursor.clone(),
        Some(Value::Number(cursor)) => cursor.to_string(),
        _ => return Err(malformed()),
    };
    let keys = reply
        .get(1)
        .and_then(Value::as_array)
        .ok_or_else(malformed)?
        .iter()
        .filter_map(|key| key.as_str().map(str::to_string))
        .collect();

    Ok((cursor, keys))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> PipelineClient {
        PipelineClient::new(&server.uri(), "test-token", reqwest::Client::new())
    }

    #[tokio::test]
    async fn test_get_sends_authenticated_pipeline() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/pipeline"))
            .and(header("authorization", "Bearer test-token"))
            .and(body_json(json!([["GET", "ratelimit:k"]])))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"result": "{\"count\":1}"}])))
            .expect(1)
            .mount(&server)
            .await;

        let value = client_for(&server).get("ratelimit:k").await.unwrap();
        assert_eq!(value.as_deref(), Some("{\"count\":1}"));
    }

    #[tokio::test]
    async fn test_get_missing_key() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"result": null}])))
            .mount(&server)
            .await;

        assert_eq!(client_for(&server).get("nope").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_set_uses_expiry() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_json(json!([["SET", "k", "v", "EX", "42"]])))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"result": "OK"}])))
            .expect(1)
            .mount(&server)
            .await;

        client_for(&server).set("k", "v", 42).await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_without_keys_sends_nothing() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"result": 0}])))
            .expect(0)
            .mount(&server)
            .await;

        client_for(&server).delete(&[]).await.unwrap();
    }

    #[tokio::test]
    async fn test_non_success_status_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = client_for(&server).get("k").await.unwrap_err();
        assert!(matches!(err, RateLimitError::Backend(_)));
    }

    #[tokio::test]
    async fn test_command_error_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!([{"error": "WRONGTYPE"}])),
            )
            .mount(&server)
            .await;

        let err = client_for(&server).get("k").await.unwrap_err();
        assert!(matches!(err, RateLimitError::Backend(ref msg) if msg == "WRONGTYPE"));
    }

    #[tokio::test]
    async fn test_scan_follows_cursor() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_json(json!([["SCAN", "0", "MATCH", "ratelimit:*", "COUNT", "100"]])))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!([{"result": ["5", ["ratelimit:a", "ratelimit:b"]]}])),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_json(json!([["SCAN", "5", "MATCH", "ratelimit:*", "COUNT", "100"]])))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!([{"result": ["0", ["ratelimit:c"]]}])),
            )
            .expect(1)
            .mount(&server)
            .await;

        let keys = client_for(&server).scan("ratelimit:*").await.unwrap();
        assert_eq!(keys, vec!["ratelimit:a", "ratelimit:b", "ratelimit:c"]);
    }

    #[test]
    fn test_parse_scan_reply_rejects_garbage() {
        assert!(parse_scan_reply(&json!("nope")).is_err());
        assert!(parse_scan_reply(&json!(["0", "not-a-list"])).is_err());
        let (cursor, keys) = parse_scan_reply(&json!([0, []])).unwrap();
        assert_eq!(cursor, "0");
        assert!(keys.is_empty());
    }
}
