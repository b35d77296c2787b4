// SPDX-FileCopyrightText: Copyright (c) 2024-2025 gpupool contributors
// SPDX-License-Identifier: Apache-2.0

//! gpupool
//!
//! Control plane for a federated GPU inference cluster: device scheduling,
//! replicated cluster state, per-device worker RPC multiplexing and the
//! request dispatch lifecycle that ties them together.

pub use anyhow::{Context as ErrorContext, Error, Result, anyhow as error, bail as raise};

pub mod auth;
pub mod config;
pub mod dispatch;
pub mod federation;
pub mod http;
pub mod logging;
pub mod payment;
pub mod protocols;
pub mod queue;
pub mod scheduler;
pub mod state;
pub mod storage;
pub mod telemetry;
pub mod worker;

pub use config::ClusterConfig;
pub use state::{StateHub, StateStore};
pub use tokio_util::sync::CancellationToken;
