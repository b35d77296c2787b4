// SPDX-FileCopyrightText: Copyright (c) 2024-2025 gpupool contributors
// SPDX-License-Identifier: Apache-2.0

//! Worker process supervision: spawn one worker per device, connect its
//! Unix socket, and respawn on exit. Requests in flight when a worker dies
//! are lost; their callers see timeouts.

use std::path::PathBuf;
use std::time::Duration;

use tokio::net::UnixStream;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::{WorkerChannel, WorkerPool};

const RESPAWN_DELAY: Duration = Duration::from_secs(2);
const SOCKET_WAIT: Duration = Duration::from_millis(250);
const SOCKET_WAIT_ATTEMPTS: u32 = 40;

/// How to launch a worker process.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    pub program: String,
    pub args: Vec<String>,
    /// Directory the worker creates its `unix<device>.sock` in.
    pub socket_dir: PathBuf,
}

impl WorkerCommand {
    fn socket_path(&self, device_id: &str) -> PathBuf {
        self.socket_dir.join(format!("unix{device_id}.sock"))
    }
}

/// Run the spawn/connect/wait/respawn loop for one device until cancelled.
pub async fn supervise(
    command: WorkerCommand,
    device_id: String,
    pool: std::sync::Arc<WorkerPool>,
    cancel: CancellationToken,
) {
    loop {
        if cancel.is_cancelled() {
            return;
        }

        match run_once(&command, &device_id, &pool, &cancel).await {
            Ok(status) => {
                tracing::warn!(device = %device_id, %status, "worker exited");
            }
            Err(err) => {
                tracing::error!(device = %device_id, %err, "worker spawn failed");
            }
        }
        pool.remove(&device_id);

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(RESPAWN_DELAY) => {}
        }
    }
}

async fn run_once(
    command: &WorkerCommand,
    device_id: &str,
    pool: &WorkerPool,
    cancel: &CancellationToken,
) -> crate::Result<std::process::ExitStatus> {
    let socket_path = command.socket_path(device_id);
    // A stale socket from a previous run would connect to nothing.
    let _ = std::fs::remove_file(&socket_path);

    let mut child = Command::new(&command.program)
        .args(&command.args)
        .env("CUDA_VISIBLE_DEVICES", device_id)
        .kill_on_drop(true)
        .spawn()?;

    // The worker binds its socket once its runtime is up.
    let mut connected = None;
    for _ in 0..SOCKET_WAIT_ATTEMPTS {
        if let Ok(stream) = UnixStream::connect(&socket_path).await {
            connected = Some(stream);
            break;
        }
        tokio::time::sleep(SOCKET_WAIT).await;
    }
    let stream = match connected {
        Some(s) => s,
        None => {
            let _ = child.kill().await;
            crate::raise!(
                "worker for device {device_id} never bound {}",
                socket_path.display()
            );
        }
    };

    pool.insert(WorkerChannel::attach(device_id, stream));
    tracing::info!(device = %device_id, "worker online");

    tokio::select! {
        status = child.wait() => Ok(status?),
        _ = cancel.cancelled() => {
            let _ = child.kill().await;
            Ok(child.wait().await?)
        }
    }
}
