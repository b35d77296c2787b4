// SPDX-FileCopyrightText: Copyright (c) 2024-2025 gpupool contributors
// SPDX-License-Identifier: Apache-2.0

//! Federation: the peer registry and the handshake that moves a peer from
//! REQUESTED to GRANTED, plus lifecycle of outbound state sessions.
//!
//! Trust is pairwise. A peer asks to connect, an admin grants it, and from
//! then on each side verifies the other's short-lived tokens against the
//! public key captured at request time.

pub mod session;

use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::auth::{self, AuthError, Claims, Keypair};
use crate::protocols::SessionMessage;
use crate::state::StateHub;
use crate::storage::KvStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerStatus {
    #[serde(rename = "REQUESTED")]
    Requested,
    #[serde(rename = "GRANTED")]
    Granted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConnection {
    pub status: PeerStatus,
    #[serde(rename = "publicKey")]
    pub public_key: String,
    #[serde(default)]
    pub permissions: Value,
}

/// Canonical peer URL: always a trailing slash, so registry keys and state
/// subtree keys agree.
pub fn canonical_url(url: &str) -> String {
    crate::config::canonical_url(url.trim())
}

pub struct Federation {
    peers: KvStore<PeerConnection>,
    keypair: Arc<Keypair>,
    hub: Arc<StateHub>,
    client: reqwest::Client,
    sessions: DashMap<String, CancellationToken>,
    shutdown: CancellationToken,
}

impl Federation {
    pub fn new(
        peers: KvStore<PeerConnection>,
        keypair: Arc<Keypair>,
        hub: Arc<StateHub>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            peers,
            keypair,
            hub,
            client: reqwest::Client::new(),
            sessions: DashMap::new(),
            shutdown,
        }
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    pub fn connections(&self) -> Vec<(String, PeerConnection)> {
        self.peers.entries()
    }

    pub fn peer(&self, url: &str) -> Option<PeerConnection> {
        self.peers.get(&canonical_url(url))
    }

    /// Outbound half of the handshake: ask a remote server to register us.
    pub async fn request_connection(&self, peer_url: &str) -> crate::Result<()> {
        let peer_url = canonical_url(peer_url);
        let response = self
            .client
            .post(format!("{peer_url}requestConnectionHandler"))
            .json(&serde_json::json!({ "serverURL": self.hub.local_url() }))
            .send()
            .await?;
        if !response.status().is_success() {
            crate::raise!("connection request to {peer_url} failed: {}", response.status());
        }
        Ok(())
    }

    /// Inbound half: fetch the requester's public key, record the pending
    /// connection, and let admins know.
    pub async fn handle_connection_request(&self, requester_url: &str) -> crate::Result<()> {
        let requester_url = canonical_url(requester_url);
        // A repeat request from a known peer changes nothing and must not
        // spam admins.
        if self.peers.get(&requester_url).is_some() {
            return Ok(());
        }

        #[derive(Deserialize)]
        struct PublicKeyReply {
            #[serde(rename = "publicKey")]
            public_key: String,
        }
        let reply: PublicKeyReply = self
            .client
            .get(format!("{requester_url}public"))
            .send()
            .await?
            .json()
            .await?;

        let connection = PeerConnection {
            status: PeerStatus::Requested,
            public_key: reply.public_key,
            permissions: Value::Object(Default::default()),
        };
        self.peers.put(&requester_url, connection.clone())?;

        self.hub.broadcast_admin(SessionMessage::NewConnectionRequest {
            connection,
            url: requester_url.clone(),
        });
        tracing::info!(peer = %requester_url, "connection requested");
        Ok(())
    }

    /// Promote a pending peer and open its state session.
    pub fn grant_connection(&self, peer_url: &str) -> crate::Result<()> {
        let peer_url = canonical_url(peer_url);
        let mut connection = self
            .peers
            .get(&peer_url)
            .ok_or_else(|| crate::error!("no pending connection for {peer_url}"))?;
        connection.status = PeerStatus::Granted;
        self.peers.put(&peer_url, connection)?;
        self.start_session(&peer_url);
        Ok(())
    }

    /// Drop a pending request without granting it.
    pub fn reject_connection(&self, peer_url: &str) -> crate::Result<()> {
        self.peers.del(&canonical_url(peer_url))
    }

    /// Forget a peer entirely: stop its session and discard its subtree.
    pub fn remove_connection(&self, peer_url: &str) -> crate::Result<()> {
        let peer_url = canonical_url(peer_url);
        if let Some((_, token)) = self.sessions.remove(&peer_url) {
            token.cancel();
        }
        self.peers.del(&peer_url)?;
        self.hub.delete_remote(&peer_url);
        Ok(())
    }

    /// Open sessions for every already-granted peer (boot path).
    pub fn start_granted_sessions(&self) {
        for (url, connection) in self.peers.entries() {
            if connection.status == PeerStatus::Granted {
                self.start_session(&url);
            }
        }
    }

    fn start_session(&self, peer_url: &str) {
        if let Some((_, old)) = self.sessions.remove(peer_url) {
            old.cancel();
        }
        let cancel = self.shutdown.child_token();
        self.sessions.insert(peer_url.to_string(), cancel.clone());
        tokio::spawn(session::run(
            peer_url.to_string(),
            self.hub.clone(),
            self.keypair.clone(),
            cancel,
        ));
    }

    /// Verify a server-to-server token: the claimed server must be a
    /// GRANTED peer and the token must verify against its key with full
    /// permissions.
    pub fn verify_server_token(&self, claimed_url: &str, token: &str) -> Result<Claims, AuthError> {
        let claimed_url = canonical_url(claimed_url);
        let connection = self.peer(&claimed_url).ok_or(AuthError::UnknownPeer)?;
        if connection.status != PeerStatus::Granted {
            return Err(AuthError::UnknownPeer);
        }
        let claims = auth::verify(token, &connection.public_key)?;
        if claims.server_url.as_deref() != Some(claimed_url.as_str()) || !claims.full_permissions {
            return Err(AuthError::Forbidden);
        }
        Ok(claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn federation_with_peer(status: PeerStatus) -> (Federation, Arc<Keypair>) {
        let peer_keypair = Arc::new(Keypair::generate());
        let peers = KvStore::in_memory();
        peers
            .put(
                "http://peer:8080/",
                PeerConnection {
                    status,
                    public_key: peer_keypair.public_base64(),
                    permissions: Value::Object(Default::default()),
                },
            )
            .unwrap();
        let federation = Federation::new(
            peers,
            Arc::new(Keypair::generate()),
            Arc::new(StateHub::new("http://local:8080/")),
            CancellationToken::new(),
        );
        (federation, peer_keypair)
    }

    #[test]
    fn test_canonical_url_adds_exactly_one_slash() {
        assert_eq!(canonical_url("http://a:1"), "http://a:1/");
        assert_eq!(canonical_url("http://a:1/"), "http://a:1/");
    }

    #[test]
    fn test_server_token_verifies_only_for_granted_peer() {
        let (federation, peer_keypair) = federation_with_peer(PeerStatus::Granted);
        let token = peer_keypair.server_token("http://peer:8080/").unwrap();

        let claims = federation
            .verify_server_token("http://peer:8080", &token)
            .unwrap();
        assert!(claims.full_permissions);

        // Token claiming a different URL than it was signed for.
        let other = peer_keypair.server_token("http://other:8080/").unwrap();
        assert_eq!(
            federation.verify_server_token("http://peer:8080", &other),
            Err(AuthError::Forbidden)
        );
    }

    #[test]
    fn test_requested_peer_is_not_trusted_yet() {
        let (federation, peer_keypair) = federation_with_peer(PeerStatus::Requested);
        let token = peer_keypair.server_token("http://peer:8080/").unwrap();
        assert_eq!(
            federation.verify_server_token("http://peer:8080/", &token),
            Err(AuthError::UnknownPeer)
        );
    }

    #[tokio::test]
    async fn test_grant_promotes_and_remove_forgets() {
        let (federation, _) = federation_with_peer(PeerStatus::Requested);
        federation.grant_connection("http://peer:8080/").unwrap();
        assert_eq!(
            federation.peer("http://peer:8080/").unwrap().status,
            PeerStatus::Granted
        );

        federation.remove_connection("http://peer:8080/").unwrap();
        assert!(federation.peer("http://peer:8080/").is_none());
    }
}
