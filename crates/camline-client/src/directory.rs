//! External collaborators: the server directory service and the ext-data
//! resolver.
//!
//! Both are object-safe async traits so tests and embedders can swap in
//! their own implementations; the HTTP-backed defaults talk to the
//! platform's published endpoints.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{ClientError, ClientResult};

/// A boxed future for async trait methods, keeping the traits object-safe.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Supplies the list of candidate chat-edge hostnames.
///
/// Consulted once per `connect()`; the engine picks uniformly at random
/// among the candidates.
pub trait ServerDirectory: Send + Sync {
    /// Returns fully-qualified chat-server hostnames.
    fn chat_servers(&self) -> BoxFuture<'_, ClientResult<Vec<String>>>;
}

/// Resolves an out-of-band ext-data payload reference to its JSON document.
pub trait ExtDataResolver: Send + Sync {
    /// Fetches the document referenced by `extdata`.
    fn resolve(&self, extdata: &Value) -> BoxFuture<'_, ClientResult<Value>>;
}

/// HTTP-backed server directory.
///
/// Fetches the platform's server-config document once and caches it for the
/// life of the client; the candidate list changes rarely and a reconnect
/// storm should not hammer the directory endpoint.
pub struct HttpServerDirectory {
    http: reqwest::Client,
    url: String,
    domain: String,
    cached: Mutex<Option<Vec<String>>>,
}

impl HttpServerDirectory {
    /// Creates a directory client for the given config URL and domain
    /// suffix.
    pub fn new(url: impl Into<String>, domain: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("failed to create HTTP client");
        Self {
            http,
            url: url.into(),
            domain: domain.into(),
            cached: Mutex::new(None),
        }
    }

    async fn fetch(&self) -> ClientResult<Vec<String>> {
        debug!(url = %self.url, "fetching server directory");
        let body = self
            .http
            .get(&self.url)
            .send()
            .await
            .map_err(|e| ClientError::Directory(e.to_string()))?
            .text()
            .await
            .map_err(|e| ClientError::Directory(e.to_string()))?;

        let config: Value = serde_json::from_str(&body)
            .map_err(|e| ClientError::Directory(format!("malformed server config: {e}")))?;

        let servers: Vec<String> = config
            .get("chat_servers")
            .and_then(Value::as_array)
            .map(|names| {
                names
                    .iter()
                    .filter_map(Value::as_str)
                    .map(|name| format!("{name}.{}", self.domain))
                    .collect()
            })
            .unwrap_or_default();

        if servers.is_empty() {
            return Err(ClientError::directory("no chat servers listed"));
        }
        Ok(servers)
    }
}

impl ServerDirectory for HttpServerDirectory {
    fn chat_servers(&self) -> BoxFuture<'_, ClientResult<Vec<String>>> {
        Box::pin(async {
            let mut cached = self.cached.lock().await;
            if let Some(servers) = cached.as_ref() {
                return Ok(servers.clone());
            }
            let servers = self.fetch().await?;
            *cached = Some(servers.clone());
            Ok(servers)
        })
    }
}

/// HTTP-backed ext-data resolver. Builds the platform's query-string fetch
/// from the reference fields and decodes the response as JSON.
pub struct HttpExtDataResolver {
    http: reqwest::Client,
    base_url: String,
}

impl HttpExtDataResolver {
    /// Creates a resolver for the given endpoint.
    pub fn new(base_url: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("failed to create HTTP client");
        Self {
            http,
            base_url: base_url.into(),
        }
    }
}

impl ExtDataResolver for HttpExtDataResolver {
    fn resolve(&self, extdata: &Value) -> BoxFuture<'_, ClientResult<Value>> {
        // The reference names the response key plus routing hints, all of
        // which are echoed back as query parameters.
        let query: Vec<(String, String)> = ["respkey", "type", "opts", "serv"]
            .iter()
            .filter_map(|name| {
                extdata.get(name).map(|value| {
                    let value = match value {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    ((*name).to_string(), value)
                })
            })
            .collect();

        Box::pin(async move {
            debug!(params = query.len(), "resolving ext-data reference");
            let response = self
                .http
                .get(&self.base_url)
                .query(&query)
                .send()
                .await
                .map_err(|e| ClientError::ExtData(e.to_string()))?;

            if !response.status().is_success() {
                warn!(status = %response.status(), "ext-data endpoint returned an error");
                return Err(ClientError::ExtData(format!(
                    "status {}",
                    response.status()
                )));
            }

            response
                .json()
                .await
                .map_err(|e| ClientError::ExtData(e.to_string()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticDirectory(Vec<String>);

    impl ServerDirectory for StaticDirectory {
        fn chat_servers(&self) -> BoxFuture<'_, ClientResult<Vec<String>>> {
            let servers = self.0.clone();
            Box::pin(async move { Ok(servers) })
        }
    }

    #[tokio::test]
    async fn static_directory_lists_servers() {
        let directory = StaticDirectory(vec!["127.0.0.1".into()]);
        assert_eq!(directory.chat_servers().await.unwrap(), vec!["127.0.0.1"]);
    }
}
