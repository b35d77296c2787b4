// SPDX-FileCopyrightText: Copyright (c) 2024-2025 gpupool contributors
// SPDX-License-Identifier: Apache-2.0

//! Telemetry collaborators: GPU facts and the model catalog.
//!
//! Both are traits so the replicator can run against static fixtures in
//! tests and benchmarks. Production impls shell out to vendor tooling and
//! are deployment-specific.

use async_trait::async_trait;
use serde_json::Value;

use crate::state::{GpuSnapshot, ModelsMap};

/// Source of per-GPU facts for this host.
#[async_trait]
pub trait TelemetrySource: Send + Sync {
    async fn gpus(&self) -> crate::Result<Vec<GpuSnapshot>>;
}

/// Source of the installed-model map and the pipes catalog.
#[async_trait]
pub trait ModelCatalog: Send + Sync {
    async fn models(&self) -> crate::Result<ModelsMap>;
    fn pipes_map(&self) -> Value;
}

/// Fixed snapshots, for tests and single-host deployments without SMI.
#[derive(Debug, Clone, Default)]
pub struct StaticTelemetry {
    pub gpus: Vec<GpuSnapshot>,
}

#[async_trait]
impl TelemetrySource for StaticTelemetry {
    async fn gpus(&self) -> crate::Result<Vec<GpuSnapshot>> {
        Ok(self.gpus.clone())
    }
}

#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    pub models: ModelsMap,
    pub pipes_map: Value,
}

#[async_trait]
impl ModelCatalog for StaticCatalog {
    async fn models(&self) -> crate::Result<ModelsMap> {
        Ok(self.models.clone())
    }

    fn pipes_map(&self) -> Value {
        self.pipes_map.clone()
    }
}

impl StaticCatalog {
    /// Load `{"models": …, "pipesMap": …}` from a JSON file.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        #[derive(serde::Deserialize)]
        struct CatalogFile {
            #[serde(default)]
            models: ModelsMap,
            #[serde(rename = "pipesMap", default)]
            pipes_map: Value,
        }
        let bytes = std::fs::read(path.as_ref())?;
        let file: CatalogFile = serde_json::from_slice(&bytes)?;
        Ok(Self {
            models: file.models,
            pipes_map: file.pipes_map,
        })
    }
}

/// Shells out to `nvidia-smi` and parses its CSV output.
#[derive(Debug, Clone, Copy, Default)]
pub struct SmiTelemetry;

const SMI_QUERY: &str = "--query-gpu=index,temperature.gpu,fan.speed,memory.total,memory.free,memory.used,power.draw,power.limit";

#[async_trait]
impl TelemetrySource for SmiTelemetry {
    async fn gpus(&self) -> crate::Result<Vec<GpuSnapshot>> {
        let output = tokio::process::Command::new("nvidia-smi")
            .arg(SMI_QUERY)
            .arg("--format=csv,noheader,nounits")
            .output()
            .await?;
        if !output.status.success() {
            crate::raise!(
                "nvidia-smi failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(parse_smi_csv(&String::from_utf8_lossy(&output.stdout)))
    }
}

fn parse_smi_csv(csv: &str) -> Vec<GpuSnapshot> {
    csv.lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| {
            let fields: Vec<&str> = line.split(',').map(str::trim).collect();
            let mut fields = fields.into_iter();
            let index = fields.next()?.to_string();
            let num = |raw: Option<&str>| raw.and_then(|v| v.parse::<f64>().ok()).unwrap_or(0.0);
            let temperature_gpu = num(fields.next());
            let fan_speed = num(fields.next());
            let memory_total = num(fields.next()) as u64;
            let memory_free = num(fields.next()) as u64;
            let memory_used = num(fields.next()) as u64;
            let power_draw = num(fields.next());
            let power_limit = num(fields.next());
            Some(GpuSnapshot {
                index,
                memory_total,
                memory_free,
                memory_used,
                power_draw,
                power_limit,
                temperature_gpu,
                fan_speed,
                max_tflops: 0.0,
            })
        })
        .collect()
}

/// A device owns the GPUs whose indices appear in its comma-separated id
/// ("0,1" owns GPUs 0 and 1).
pub fn gpus_for_device(device_id: &str, gpus: &[GpuSnapshot]) -> Vec<GpuSnapshot> {
    let indices: Vec<&str> = device_id.split(',').map(str::trim).collect();
    gpus.iter()
        .filter(|gpu| indices.contains(&gpu.index.as_str()))
        .cloned()
        .collect()
}

/// Expensive sources are polled on a cadence rather than every replication
/// cycle: SMI every 2nd cycle, the model listing every 4th. Off-cycle reads
/// reuse the cached answer.
pub struct PollCadence {
    cycle: u64,
    pub smi_every: u64,
    pub models_every: u64,
}

impl Default for PollCadence {
    fn default() -> Self {
        Self {
            cycle: 0,
            smi_every: 2,
            models_every: 4,
        }
    }
}

impl PollCadence {
    /// Advance one cycle; returns (poll_smi, poll_models). The first cycle
    /// polls everything so boot state is never empty.
    pub fn tick(&mut self) -> (bool, bool) {
        let smi = self.cycle % self.smi_every == 0;
        let models = self.cycle % self.models_every == 0;
        self.cycle = self.cycle.wrapping_add(1);
        (smi, models)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gpu(index: &str) -> GpuSnapshot {
        GpuSnapshot {
            index: index.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_gpus_for_device_matches_index_membership() {
        let gpus = vec![gpu("0"), gpu("1"), gpu("2")];
        let owned = gpus_for_device("0,2", &gpus);
        let indices: Vec<_> = owned.iter().map(|g| g.index.as_str()).collect();
        assert_eq!(indices, ["0", "2"]);
        assert!(gpus_for_device("3", &gpus).is_empty());
    }

    #[test]
    fn test_smi_csv_parsing() {
        let csv = "0, 45, 30, 24576, 20000, 4576, 120.5, 350.0\n1, 50, 35, 24576, 24576, 0, 15.0, 350.0\n";
        let gpus = parse_smi_csv(csv);
        assert_eq!(gpus.len(), 2);
        assert_eq!(gpus[0].index, "0");
        assert_eq!(gpus[0].memory_free, 20000);
        assert_eq!(gpus[0].power_draw, 120.5);
        assert_eq!(gpus[1].memory_used, 0);
    }

    #[test]
    fn test_cadence_polls_everything_first_then_throttles() {
        let mut cadence = PollCadence::default();
        let ticks: Vec<_> = (0..4).map(|_| cadence.tick()).collect();
        assert_eq!(
            ticks,
            [(true, true), (false, false), (true, false), (false, false)]
        );
        // cycle 4 polls both again
        assert_eq!(cadence.tick(), (true, true));
    }
}
