//! # HTTP Client Layer
//!
//! All outbound HTTP goes through one [`NetClient`]: status probes, sync
//! page pulls, public-key fetches, anchor submission, and the broadcast
//! fan-outs that drive both consensus engines.
//!
//! Every call carries the per-request timeout from config — probes and
//! fan-outs are invoked from watcher loops, and an unreachable peer must
//! cost one timeout, not a hung watcher.
//!
//! Broadcasts are fire-and-forget by design: each target gets its own
//! bounded task, failures are logged and never retried, and one dead peer
//! cannot starve delivery to the rest.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::config::HTTP_TIMEOUT;
use crate::peers::PeerStatus;

/// Upper bound on concurrent broadcast posts.
const BROADCAST_PERMITS: usize = 16;

/// Errors from outbound HTTP calls. At the gateway these all map to the
/// "peer unavailable" class.
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    #[error("request to {addr}{path} failed: {source}")]
    Transport {
        addr: String,
        path: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{addr}{path} answered status {status}")]
    BadStatus {
        addr: String,
        path: String,
        status: u16,
    },
}

/// Shared HTTP client with protocol-wide timeouts.
#[derive(Clone)]
pub struct NetClient {
    client: reqwest::Client,
    fanout: Arc<Semaphore>,
}

impl NetClient {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            client,
            fanout: Arc::new(Semaphore::new(BROADCAST_PERMITS)),
        }
    }

    fn url(addr: &str, path: &str) -> String {
        format!("http://{addr}{path}")
    }

    /// GET a JSON document from a peer.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        addr: &str,
        path: &str,
    ) -> Result<T, NetError> {
        let response = self
            .client
            .get(Self::url(addr, path))
            .send()
            .await
            .map_err(|source| NetError::Transport {
                addr: addr.to_string(),
                path: path.to_string(),
                source,
            })?;
        if !response.status().is_success() {
            return Err(NetError::BadStatus {
                addr: addr.to_string(),
                path: path.to_string(),
                status: response.status().as_u16(),
            });
        }
        response.json().await.map_err(|source| NetError::Transport {
            addr: addr.to_string(),
            path: path.to_string(),
            source,
        })
    }

    /// GET a JSON document with URL-encoded query parameters.
    pub async fn get_json_with_query<T: DeserializeOwned>(
        &self,
        addr: &str,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, NetError> {
        let response = self
            .client
            .get(Self::url(addr, path))
            .query(query)
            .send()
            .await
            .map_err(|source| NetError::Transport {
                addr: addr.to_string(),
                path: path.to_string(),
                source,
            })?;
        if !response.status().is_success() {
            return Err(NetError::BadStatus {
                addr: addr.to_string(),
                path: path.to_string(),
                status: response.status().as_u16(),
            });
        }
        response.json().await.map_err(|source| NetError::Transport {
            addr: addr.to_string(),
            path: path.to_string(),
            source,
        })
    }

    /// GET a plain-text body (the PEM served at `/getPublicKey`).
    pub async fn get_text(&self, addr: &str, path: &str) -> Result<String, NetError> {
        let response = self
            .client
            .get(Self::url(addr, path))
            .send()
            .await
            .map_err(|source| NetError::Transport {
                addr: addr.to_string(),
                path: path.to_string(),
                source,
            })?;
        if !response.status().is_success() {
            return Err(NetError::BadStatus {
                addr: addr.to_string(),
                path: path.to_string(),
                status: response.status().as_u16(),
            });
        }
        response.text().await.map_err(|source| NetError::Transport {
            addr: addr.to_string(),
            path: path.to_string(),
            source,
        })
    }

    /// POST a JSON body and decode a JSON reply.
    pub async fn post_json<B: Serialize, T: DeserializeOwned>(
        &self,
        addr: &str,
        path: &str,
        body: &B,
    ) -> Result<T, NetError> {
        let response = self
            .client
            .post(Self::url(addr, path))
            .json(body)
            .send()
            .await
            .map_err(|source| NetError::Transport {
                addr: addr.to_string(),
                path: path.to_string(),
                source,
            })?;
        if !response.status().is_success() {
            return Err(NetError::BadStatus {
                addr: addr.to_string(),
                path: path.to_string(),
                status: response.status().as_u16(),
            });
        }
        response.json().await.map_err(|source| NetError::Transport {
            addr: addr.to_string(),
            path: path.to_string(),
            source,
        })
    }

    /// POST a JSON body where only the status matters.
    pub async fn post_json_ack<B: Serialize>(
        &self,
        addr: &str,
        path: &str,
        body: &B,
    ) -> Result<u16, NetError> {
        let response = self
            .client
            .post(Self::url(addr, path))
            .json(body)
            .send()
            .await
            .map_err(|source| NetError::Transport {
                addr: addr.to_string(),
                path: path.to_string(),
                source,
            })?;
        Ok(response.status().as_u16())
    }

    /// Probe a peer's `/status`. `None` covers timeout, non-200, and
    /// undecodable bodies alike — a peer that cannot answer its status is
    /// dead for liveness purposes.
    pub async fn probe_status(&self, addr: &str) -> Option<PeerStatus> {
        self.get_json::<PeerStatus>(addr, "/status").await.ok()
    }

    /// Fire-and-forget fan-out: POST `body` to `path` on every target.
    ///
    /// The body is serialized once; each target runs in its own task
    /// under the fan-out semaphore. Failures are logged per target and
    /// never surface to the caller.
    pub fn broadcast<B: Serialize>(&self, targets: &[String], path: &str, body: &B) {
        let Ok(payload) = serde_json::to_value(body) else {
            warn!(path, "broadcast body not serializable; dropping");
            return;
        };
        for target in targets {
            let client = self.client.clone();
            let permits = self.fanout.clone();
            let url = Self::url(target, path);
            let target = target.clone();
            let path = path.to_string();
            let payload = payload.clone();
            tokio::spawn(async move {
                let _permit = permits.acquire_owned().await;
                match client.post(url).json(&payload).send().await {
                    Ok(response) => {
                        debug!(%target, %path, status = response.status().as_u16(), "broadcast delivered")
                    }
                    Err(e) => warn!(%target, %path, error = %e, "broadcast failed"),
                }
            });
        }
    }
}

impl Default for NetClient {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urls_are_plain_http_host_port() {
        assert_eq!(
            NetClient::url("cp-node-01:5000", "/status"),
            "http://cp-node-01:5000/status"
        );
    }
}
