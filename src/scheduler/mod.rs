// SPDX-FileCopyrightText: Copyright (c) 2024-2025 gpupool contributors
// SPDX-License-Identifier: Apache-2.0

//! Device selection.
//!
//! A pure function from (pipe id, cluster state, locality constraint) to the
//! best device. Candidates are filtered by model installation and device
//! flags, annotated with capacity facts, then evaluated in four tiers; the
//! head of the first non-empty tier wins.

pub mod sort;

use std::cmp::Ordering;

use serde::Serialize;
use thiserror::Error;

use crate::state::{ClusterState, Device, ModelStatus, ServerState};
use sort::{SortKey, SortProps, sort_by_keys};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchedulingError {
    #[error("Model {vendor}/{model} not installed")]
    ModelNotInstalled { vendor: String, model: String },
    #[error("No available devices to load {0}")]
    NoDevices(String),
    /// All tiers were empty. Callers treat this as a 404 with no message
    /// payload.
    #[error("no schedulable device")]
    NoCandidate,
}

/// Whether a device's total VRAM can hold a pipe at all.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CapacityPolicy {
    /// Always passes: CPU offload lets GPUs load models larger than VRAM.
    #[default]
    AlwaysFits,
    /// Require total VRAM >= the pipe's declared size.
    TotalVram,
}

impl CapacityPolicy {
    fn fits(&self, device: &Device, required_vram: u64) -> bool {
        match self {
            CapacityPolicy::AlwaysFits => true,
            CapacityPolicy::TotalVram => {
                total_memory_mb(device, |g| g.memory_total) * 1024 * 1024 > required_vram
            }
        }
    }
}

/// The scheduling decision handed to the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Selection {
    #[serde(rename = "serverURL")]
    pub server_url: String,
    #[serde(rename = "deviceId")]
    pub device_id: String,
    #[serde(rename = "requiredVRAM")]
    pub required_vram: u64,
}

fn total_memory_mb(device: &Device, field: fn(&crate::state::GpuSnapshot) -> u64) -> u64 {
    device.gpus.iter().map(field).sum()
}

struct Candidate {
    server_url: String,
    is_local: bool,
    required_vram: u64,
    enough_free_vram: bool,
    free_mb: u64,
    max_tflops: f64,
    power_limit: f64,
    queue_size: usize,
    pipe_loaded: bool,
    frozen: bool,
    device_id: String,
}

impl SortProps for Candidate {
    fn prop(&self, name: &str) -> Option<f64> {
        match name {
            "freeMB" => Some(self.free_mb as f64),
            "maxTflops" => Some(self.max_tflops),
            "powerLimit" => Some(self.power_limit),
            "queueSize" => Some(self.queue_size as f64),
            "isLocal" => Some(if self.is_local { 1.0 } else { 0.0 }),
            _ => None,
        }
    }
}

/// Free VRAM minus required VRAM, with a 10% safety margin on both the
/// total and the remainder. No declared size means the check passes.
fn have_enough_free_vram(device: &Device, required_vram: u64) -> bool {
    if required_vram == 0 {
        return true;
    }
    let free = total_memory_mb(device, |g| g.memory_free) as f64 * 1024.0 * 1024.0;
    let total = total_memory_mb(device, |g| g.memory_total) as f64 * 1024.0 * 1024.0;
    const OFFSET: f64 = 0.1;
    let mut diff = free - required_vram as f64 - total * OFFSET;
    diff -= diff * OFFSET;
    diff.round() > 0.0
}

fn annotate(
    server_url: &str,
    local_url: &str,
    required_vram: u64,
    pipe_id: &str,
    device: &Device,
) -> Candidate {
    Candidate {
        server_url: server_url.to_string(),
        is_local: server_url == local_url,
        required_vram,
        enough_free_vram: have_enough_free_vram(device, required_vram),
        free_mb: total_memory_mb(device, |g| g.memory_free),
        max_tflops: device.gpus.iter().map(|g| g.max_tflops).sum(),
        power_limit: device.gpus.iter().map(|g| g.power_limit).sum(),
        queue_size: device.queue.len(),
        pipe_loaded: device.pipes.iter().any(|p| p == pipe_id),
        frozen: device.frozen,
        device_id: device.device_id.clone(),
    }
}

fn installed_model<'a>(
    server: &'a ServerState,
    vendor: &str,
    model: &str,
) -> Option<&'a crate::state::ModelInfo> {
    server
        .models
        .get(vendor)
        .and_then(|m| m.get(model))
        .filter(|info| info.status == ModelStatus::Installed)
}

/// Select the best device for `pipe_id` across `state`.
///
/// `local_only` restricts candidates to `local_url`'s own subtree (used for
/// requests arriving from a remote server so forwards cannot bounce).
pub fn select_device(
    pipe_id: &str,
    state: &ClusterState,
    local_url: &str,
    local_only: bool,
    policy: CapacityPolicy,
) -> Result<Selection, SchedulingError> {
    let mut parts = pipe_id.splitn(3, "--");
    let vendor = parts.next().unwrap_or_default();
    let model = parts.next().unwrap_or_default();

    let servers: Vec<(&String, &ServerState)> = state
        .iter()
        .filter(|(url, _)| !local_only || url.as_str() == local_url)
        .filter(|(_, server)| installed_model(server, vendor, model).is_some())
        .collect();

    if servers.is_empty() {
        return Err(SchedulingError::ModelNotInstalled {
            vendor: vendor.to_string(),
            model: model.to_string(),
        });
    }

    let mut candidates: Vec<Candidate> = Vec::new();
    for (url, server) in &servers {
        let required_vram = installed_model(server, vendor, model)
            .map(|info| info.size)
            .unwrap_or(0);

        for device in &server.devices {
            if device.disabled {
                continue;
            }
            let pipe_loaded = device.pipes.iter().any(|p| p == pipe_id);
            if pipe_loaded || (!device.frozen && policy.fits(device, required_vram)) {
                candidates.push(annotate(url, local_url, required_vram, pipe_id, device));
            }
        }
    }

    if candidates.is_empty() {
        return Err(SchedulingError::NoDevices(pipe_id.to_string()));
    }

    // Tier A: idle, pipe loaded or unfrozen
    if let Some(selection) = pick(
        candidates
            .iter()
            .filter(|c| c.queue_size == 0 && (c.pipe_loaded || !c.frozen))
            .collect(),
        &[
            SortKey::Prop("maxTflops"),
            SortKey::Prop("powerLimit"),
            SortKey::Cmp(&pipe_loaded_cmp),
            SortKey::Prop("isLocal"),
        ],
    ) {
        return Ok(selection);
    }

    // Tier B: idle with enough free VRAM
    if let Some(selection) = pick(
        candidates
            .iter()
            .filter(|c| c.queue_size == 0 && c.enough_free_vram)
            .collect(),
        &[
            SortKey::Prop("maxTflops"),
            SortKey::Prop("powerLimit"),
            SortKey::Prop("isLocal"),
        ],
    ) {
        return Ok(selection);
    }

    // Tier C: idle without enough free VRAM
    if let Some(selection) = pick(
        candidates
            .iter()
            .filter(|c| c.queue_size == 0 && !c.enough_free_vram)
            .collect(),
        &[
            SortKey::Prop("maxTflops"),
            SortKey::Prop("powerLimit"),
            SortKey::Prop("isLocal"),
        ],
    ) {
        return Ok(selection);
    }

    // Tier D: busy devices. The reversal markers invert the comparison, so
    // queueSize actually sorts ascending; timeStarted is not a candidate
    // key and is skipped.
    if let Some(selection) = pick(
        candidates.iter().filter(|c| c.queue_size > 0).collect(),
        &[SortKey::Prop("-queueSize"), SortKey::Prop("-timeStarted")],
    ) {
        return Ok(selection);
    }

    Err(SchedulingError::NoCandidate)
}

/// Ranks devices with the pipe already resident above those without.
fn pipe_loaded_cmp(a: &&Candidate, b: &&Candidate) -> Ordering {
    match (a.pipe_loaded, b.pipe_loaded) {
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        _ => Ordering::Equal,
    }
}

/// Sort one tier and lift its best candidate into a `Selection`.
fn pick<'a>(mut tier: Vec<&'a Candidate>, keys: &[SortKey<'_, &'a Candidate>]) -> Option<Selection> {
    if tier.is_empty() {
        return None;
    }
    sort_by_keys(&mut tier, keys);
    let best = tier[0];
    Some(Selection {
        server_url: best.server_url.clone(),
        device_id: best.device_id.clone(),
        required_vram: best.required_vram,
    })
}

impl SortProps for &Candidate {
    fn prop(&self, name: &str) -> Option<f64> {
        (**self).prop(name)
    }
}
