// SPDX-FileCopyrightText: Copyright (c) 2024-2025 gpupool contributors
// SPDX-License-Identifier: Apache-2.0

//! Outbound state session to one granted peer.
//!
//! The session authenticates with a fresh server token, ingests the peer's
//! `INIT_STATE` and subsequent `PATCH_STATE` fragments, and treats silence
//! longer than the liveness window as a dead link. On any close the peer's
//! subtree is dropped immediately; scheduling must never see stale remote
//! devices. Reconnects back off exponentially from 1 s, capped at 30 s, and
//! reset once a connection is established.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::auth::Keypair;
use crate::protocols::SessionMessage;
use crate::state::StateHub;

pub const LIVENESS_TIMEOUT: Duration = Duration::from_secs(15);
const BACKOFF_CAP_SECS: u64 = 30;

pub async fn run(
    peer_url: String,
    hub: Arc<StateHub>,
    keypair: Arc<Keypair>,
    cancel: CancellationToken,
) {
    let mut failures: u32 = 0;
    loop {
        if cancel.is_cancelled() {
            return;
        }

        match connect_and_serve(&peer_url, &hub, &keypair, &cancel).await {
            Ok(()) => {
                failures = 0;
                tracing::info!(peer = %peer_url, "state session closed");
            }
            Err(err) => {
                failures += 1;
                tracing::warn!(peer = %peer_url, %err, failures, "state session connect failed");
            }
        }
        hub.delete_remote(&peer_url);

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(backoff_delay(failures)) => {}
        }
    }
}

/// 1 s, 2 s, 4 s, … capped at 30 s. Zero failures (a session that was
/// actually up) restarts at the base delay.
fn backoff_delay(failures: u32) -> Duration {
    let exp = failures.saturating_sub(1).min(6);
    Duration::from_secs((1u64 << exp).min(BACKOFF_CAP_SECS))
}

/// Connection errors bubble up; once the socket is established, every
/// termination path is an `Ok` so the backoff resets.
async fn connect_and_serve(
    peer_url: &str,
    hub: &StateHub,
    keypair: &Keypair,
    cancel: &CancellationToken,
) -> crate::Result<()> {
    let token = keypair.server_token(hub.local_url())?;
    let endpoint = ws_endpoint(peer_url, &token, hub.local_url())?;
    let (stream, _) = connect_async(endpoint).await?;
    let (mut write, mut read) = stream.split();
    tracing::info!(peer = %peer_url, "state session open");

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = write.send(Message::Close(None)).await;
                return Ok(());
            }
            _ = tokio::time::sleep(LIVENESS_TIMEOUT) => {
                tracing::warn!(peer = %peer_url, "peer went silent, closing session");
                let _ = write.send(Message::Close(None)).await;
                return Ok(());
            }
            frame = read.next() => frame,
        };

        match frame {
            Some(Ok(Message::Text(text))) => handle_message(peer_url, hub, &text),
            Some(Ok(Message::Ping(payload))) => {
                let _ = write.send(Message::Pong(payload)).await;
            }
            Some(Ok(Message::Close(_))) | None => return Ok(()),
            Some(Ok(_)) => {}
            Some(Err(err)) => {
                tracing::warn!(peer = %peer_url, %err, "state session read error");
                return Ok(());
            }
        }
    }
}

fn handle_message(peer_url: &str, hub: &StateHub, text: &str) {
    let message: SessionMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(err) => {
            tracing::warn!(peer = %peer_url, %err, "unparseable session message");
            return;
        }
    };
    match message {
        SessionMessage::InitState { state } => {
            if let Some(subtree) = state.get(peer_url) {
                hub.init_remote(peer_url, subtree.clone());
            } else {
                tracing::warn!(peer = %peer_url, "INIT_STATE without the peer's own subtree");
            }
        }
        SessionMessage::PatchState { delta } => hub.patch_remote(peer_url, delta),
        SessionMessage::Heartbeat { .. } => {}
        SessionMessage::NewConnectionRequest { .. } => {}
    }
}

fn ws_endpoint(peer_url: &str, token: &str, local_url: &str) -> crate::Result<String> {
    let mut endpoint = url::Url::parse(peer_url)?.join("ws")?;
    let scheme = match endpoint.scheme() {
        "https" | "wss" => "wss",
        _ => "ws",
    };
    endpoint
        .set_scheme(scheme)
        .map_err(|_| crate::error!("cannot derive ws scheme for {peer_url}"))?;
    endpoint
        .query_pairs_mut()
        .append_pair("token", token)
        .append_pair("serverURL", local_url);
    Ok(endpoint.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    #[test]
    fn test_backoff_doubles_from_one_second_and_caps() {
        let secs: Vec<u64> = (0..8).map(|f| backoff_delay(f).as_secs()).collect();
        assert_eq!(secs, [1, 1, 2, 4, 8, 16, 30, 30]);
    }

    #[test]
    fn test_ws_endpoint_carries_token_and_identity() {
        let endpoint = ws_endpoint("http://peer:8080/", "tok", "http://local:9090/").unwrap();
        assert!(endpoint.starts_with("ws://peer:8080/ws?"));
        assert!(endpoint.contains("token=tok"));
        assert!(endpoint.contains("serverURL=http%3A%2F%2Flocal%3A9090%2F"));

        let secure = ws_endpoint("https://peer/", "t", "http://l/").unwrap();
        assert!(secure.starts_with("wss://peer/ws?"));
    }

    #[tokio::test]
    async fn test_session_ingests_state_and_drops_subtree_on_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let peer_url = format!("http://127.0.0.1:{port}/");

        // Scripted peer: accept once, send INIT_STATE then PATCH_STATE,
        // then close.
        let script_peer = peer_url.clone();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();

            let init = json!({
                "type": "INIT_STATE",
                "state": { (script_peer.clone()): {"devices": [], "models": {}} },
            });
            ws.send(Message::Text(init.to_string())).await.unwrap();

            let patch = json!({
                "type": "PATCH_STATE",
                "delta": { (script_peer): {"devices": {"$set": [{"deviceId": "0"}]}} },
            });
            ws.send(Message::Text(patch.to_string())).await.unwrap();

            tokio::time::sleep(Duration::from_millis(200)).await;
            ws.send(Message::Close(None)).await.unwrap();
        });

        let hub = Arc::new(StateHub::new("http://local:1/"));
        let cancel = CancellationToken::new();
        let session = tokio::spawn(run(
            peer_url.clone(),
            hub.clone(),
            Arc::new(Keypair::generate()),
            cancel.clone(),
        ));

        // Wait for the patch to land.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(subtree) = hub.store().server(&peer_url) {
                if subtree["devices"][0]["deviceId"] == "0" {
                    break;
                }
            }
            assert!(tokio::time::Instant::now() < deadline, "patch never applied");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        // After the close the subtree must disappear.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while hub.store().server(&peer_url).is_some() {
            assert!(tokio::time::Instant::now() < deadline, "subtree never dropped");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        cancel.cancel();
        let _ = session.await;
    }
}
