// SPDX-FileCopyrightText: Copyright (c) 2024-2025 gpupool contributors
// SPDX-License-Identifier: Apache-2.0

//! Logging setup.
//!
//! Filters come from the `GPUPOOL_LOG` environment variable (same syntax as
//! `RUST_LOG`); the default level is `info` with the usual chatty HTTP
//! internals dialed down to `error`.

use std::sync::Once;

use tracing_subscriber::EnvFilter;

/// ENV used to set the log filter
const FILTER_ENV: &str = "GPUPOOL_LOG";

/// Default log level
const DEFAULT_FILTER_LEVEL: &str = "info";

static INIT: Once = Once::new();

fn default_filter() -> String {
    [
        DEFAULT_FILTER_LEVEL,
        "h2=error",
        "hyper_util=error",
        "tower=error",
        "rustls=error",
        "tungstenite=error",
    ]
    .join(",")
}

/// Initialize the global tracing subscriber. Idempotent.
pub fn init() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_env(FILTER_ENV)
            .unwrap_or_else(|_| EnvFilter::new(default_filter()));

        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    });
}
