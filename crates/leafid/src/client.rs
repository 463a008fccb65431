//! An HTTP client for `leafid-server`.
//!
//! Requests are spread round-robin across every configured endpoint. A
//! response is only accepted when it carries a positive id and an empty
//! message; anything else is returned as [`ClientError::Rejected`].

use core::time::Duration;
use std::sync::Arc;

use portable_atomic::{AtomicUsize, Ordering};
use reqwest::Url;
use serde::Deserialize;

/// Settings for a [`Client`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientConfig {
    /// `host:port` of each server.
    pub endpoints: Vec<String>,
    pub request_path: String,
    /// Query parameter carrying the key.
    pub query_param: String,
    pub timeout: Duration,
}

impl ClientConfig {
    pub fn new(endpoints: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            endpoints: endpoints.into_iter().map(Into::into).collect(),
            request_path: "/api/id".to_string(),
            query_param: "key".to_string(),
            timeout: Duration::from_secs(3),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("no endpoints configured")]
    NoEndpoints,

    #[error("invalid endpoint `{endpoint}`: {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    #[error("request failed: {0}")]
    Transport(#[source] reqwest::Error),

    #[error("failed to read response body: {0}")]
    Body(#[source] reqwest::Error),

    #[error("malformed response: {0}")]
    Decode(#[source] serde_json::Error),

    /// The server answered but did not hand out an id.
    #[error("id:{id}, err:{msg}")]
    Rejected { id: i64, msg: String },
}

impl ClientError {
    /// A negative code per failure stage, for callers that only log numbers.
    pub const fn code(&self) -> i64 {
        match self {
            Self::NoEndpoints | Self::InvalidEndpoint { .. } | Self::Transport(_) => -1,
            Self::Body(_) => -2,
            Self::Decode(_) => -3,
            Self::Rejected { .. } => -4,
        }
    }
}

#[derive(Debug, Deserialize)]
struct IdBody {
    id: i64,
    #[serde(default)]
    msg: String,
}

/// Fetches ids from one or more servers.
///
/// Cloning is cheap; clones share the connection pool and the round-robin
/// cursor.
#[derive(Clone, Debug)]
pub struct Client {
    http: reqwest::Client,
    urls: Vec<Url>,
    query_param: String,
    cursor: Arc<AtomicUsize>,
}

impl Client {
    /// # Errors
    ///
    /// Returns an error if no endpoint is given or the HTTP client cannot be
    /// built.
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        if config.endpoints.is_empty() {
            return Err(ClientError::NoEndpoints);
        }
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(ClientError::Transport)?;
        let urls = config
            .endpoints
            .iter()
            .map(|endpoint| {
                let raw = format!("http://{endpoint}{}", config.request_path);
                Url::parse(&raw).map_err(|e| ClientError::InvalidEndpoint {
                    endpoint: endpoint.clone(),
                    reason: e.to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            http,
            urls,
            query_param: config.query_param,
            cursor: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// The URL the next request would go to, without the key.
    fn next_url(&self) -> Url {
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % self.urls.len();
        self.urls[idx].clone()
    }

    /// Fetches the next id for `key`.
    ///
    /// # Errors
    ///
    /// See [`ClientError`]. Error responses from the server carry their id
    /// code and message in [`ClientError::Rejected`].
    pub async fn get_id(&self, key: &str) -> Result<i64, ClientError> {
        let mut url = self.next_url();
        url.query_pairs_mut().append_pair(&self.query_param, key);

        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(ClientError::Transport)?;
        let body = response.bytes().await.map_err(ClientError::Body)?;
        let IdBody { id, msg } = serde_json::from_slice(&body).map_err(ClientError::Decode)?;

        if id <= 0 || !msg.is_empty() {
            return Err(ClientError::Rejected { id, msg });
        }
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requires_an_endpoint() {
        let err = Client::new(ClientConfig::new(Vec::<String>::new())).unwrap_err();
        assert!(matches!(err, ClientError::NoEndpoints));
        assert_eq!(err.code(), -1);
    }

    #[test]
    fn rejects_an_unparsable_endpoint() {
        let err = Client::new(ClientConfig::new(["exa mple:80"])).unwrap_err();
        assert!(matches!(err, ClientError::InvalidEndpoint { .. }));
    }

    #[test]
    fn cycles_through_endpoints() {
        let mut config = ClientConfig::new(["10.0.0.1:8080", "10.0.0.2:8080"]);
        config.request_path = "/id".to_string();
        let client = Client::new(config).unwrap();
        let shared = client.clone();

        let hosts: Vec<String> = (0..4)
            .map(|i| {
                let url = if i % 2 == 0 {
                    client.next_url()
                } else {
                    shared.next_url()
                };
                assert_eq!(url.path(), "/id");
                url.host_str().unwrap().to_string()
            })
            .collect();
        assert_eq!(hosts, ["10.0.0.1", "10.0.0.2", "10.0.0.1", "10.0.0.2"]);
    }

    #[test]
    fn rejection_keeps_the_server_message() {
        let err = ClientError::Rejected {
            id: -2,
            msg: "halted".to_string(),
        };
        assert_eq!(err.to_string(), "id:-2, err:halted");
        assert_eq!(err.code(), -4);
    }
}
