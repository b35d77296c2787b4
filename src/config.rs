// SPDX-FileCopyrightText: Copyright (c) 2024-2025 gpupool contributors
// SPDX-License-Identifier: Apache-2.0

//! Cluster configuration, loaded from environment variables.
//!
//! The canonical server URL always carries a trailing slash; every state
//! subtree, peer record and token claim uses this canonical form as its key.

use serde::{Deserialize, Serialize};

/// ENV holding this server's public URL, e.g. `http://10.0.0.5:8080/`
const SERVER_URL_ENV: &str = "CLUSTER_SERVER_URL";

/// ENV holding the listen port (default 8080)
const PORT_ENV: &str = "BACKEND_PORT";

/// ENV holding a JSON array of device groups, e.g. `[["0"],["1","2"]]`.
/// Each group becomes one logical device whose id is the comma-joined list.
const DEVICES_MAP_ENV: &str = "CLUSTER_DEVICES_MAP";

/// ENV holding a JSON array of `[pipeId, frozen]` pairs loaded at boot,
/// one per device in order.
const PRELOAD_MODELS_ENV: &str = "PRELOAD_MODELS";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Canonical URL of this server, trailing slash guaranteed.
    pub server_url: String,
    pub port: u16,
    /// Logical device ids, each a comma-joined `CUDA_VISIBLE_DEVICES` group.
    pub devices: Option<Vec<String>>,
    /// Pipes to load at boot: `(pipe_id, frozen)` per device in order.
    pub preload: Vec<(String, bool)>,
    /// Hard cap on a single dispatch, seconds.
    pub dispatch_timeout_secs: u64,
    /// Expiry of server-to-server capability tokens, seconds.
    pub server_token_ttl_secs: i64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:8080/".to_string(),
            port: 8080,
            devices: None,
            preload: Vec::new(),
            dispatch_timeout_secs: 260,
            server_token_ttl_secs: 60,
        }
    }
}

/// Ensure a URL ends with `/` so it can be used as a state subtree key.
pub fn canonical_url(url: &str) -> String {
    if url.ends_with('/') {
        url.to_string()
    } else {
        format!("{url}/")
    }
}

impl ClusterConfig {
    /// Build configuration from the process environment.
    pub fn from_env() -> crate::Result<Self> {
        let port = match std::env::var(PORT_ENV) {
            Ok(v) => v
                .parse::<u16>()
                .map_err(|e| crate::error!("invalid {PORT_ENV}: {e}"))?,
            Err(_) => 8080,
        };

        let server_url = std::env::var(SERVER_URL_ENV)
            .map(|u| canonical_url(&u))
            .unwrap_or_else(|_| format!("http://localhost:{port}/"));

        let devices = match std::env::var(DEVICES_MAP_ENV) {
            Ok(raw) => {
                let groups: Vec<serde_json::Value> = serde_json::from_str(&raw)
                    .map_err(|e| crate::error!("invalid {DEVICES_MAP_ENV}: {e}"))?;
                Some(
                    groups
                        .into_iter()
                        .map(|group| match group {
                            serde_json::Value::Array(ids) => ids
                                .iter()
                                .map(|id| id.as_str().map(str::to_string).unwrap_or_else(|| id.to_string()))
                                .collect::<Vec<_>>()
                                .join(","),
                            other => other.to_string(),
                        })
                        .collect(),
                )
            }
            Err(_) => None,
        };

        let preload = match std::env::var(PRELOAD_MODELS_ENV) {
            Ok(raw) => serde_json::from_str::<Vec<(String, u8)>>(&raw)
                .map_err(|e| crate::error!("invalid {PRELOAD_MODELS_ENV}: {e}"))?
                .into_iter()
                .map(|(pipe, frozen)| (pipe, frozen != 0))
                .collect(),
            Err(_) => Vec::new(),
        };

        Ok(Self {
            server_url,
            port,
            devices,
            preload,
            ..Self::default()
        })
    }

    /// True when `url` names this server.
    pub fn is_local(&self, url: &str) -> bool {
        canonical_url(url) == self.server_url
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_url_appends_slash() {
        assert_eq!(canonical_url("http://a:1"), "http://a:1/");
        assert_eq!(canonical_url("http://a:1/"), "http://a:1/");
    }

    #[test]
    fn test_is_local() {
        let config = ClusterConfig {
            server_url: "http://localhost:8080/".into(),
            ..Default::default()
        };
        assert!(config.is_local("http://localhost:8080"));
        assert!(config.is_local("http://localhost:8080/"));
        assert!(!config.is_local("http://other:8080/"));
    }
}
