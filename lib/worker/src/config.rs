// SPDX-FileCopyrightText: Copyright (c) 2025 kvflow contributors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use figment::{
    Figment,
    providers::{Env, Serialized},
};
use kvflow_core::protocols::WorkerId;
use rand::Rng as _;
use serde::{Deserialize, Serialize};

use crate::engine::EngineArgs;

/// Worker configuration, read from `KVFLOW_WORKER_*` environment variables
/// over built-in defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Stable identifier; generated at startup if unset.
    pub worker_id: Option<String>,

    /// Base URL of the router's internal endpoints.
    pub router_url: String,

    /// URL under which the router can reach this worker; advertised in
    /// heartbeats. Defaults to `http://{host}:{port}`.
    pub advertise_url: Option<String>,

    pub host: String,
    pub port: u16,

    pub num_blocks: usize,
    pub block_size: usize,

    pub prefill_base_ms: f64,
    pub prefill_per_block_ms: f64,
    pub decode_per_token_ms: f64,

    pub heartbeat_period_secs: f64,
    pub sync_period_secs: f64,

    /// Simulated time runs this much faster than wall clock.
    pub speedup_ratio: f64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: None,
            router_url: "http://127.0.0.1:8080".to_string(),
            advertise_url: None,
            host: "127.0.0.1".to_string(),
            port: 8081,
            num_blocks: 924,
            block_size: 16,
            prefill_base_ms: 5.0,
            prefill_per_block_ms: 2.5,
            decode_per_token_ms: 15.0,
            heartbeat_period_secs: 1.0,
            sync_period_secs: 5.0,
            speedup_ratio: 1.0,
        }
    }
}

impl WorkerConfig {
    /// Instantiates and reads worker configuration from the environment.
    pub fn from_settings() -> anyhow::Result<Self> {
        let config: Self = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Env::prefixed("KVFLOW_WORKER_"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.num_blocks > 0, "num_blocks must be positive");
        anyhow::ensure!(self.block_size > 0, "block_size must be positive");
        anyhow::ensure!(self.speedup_ratio > 0.0, "speedup_ratio must be positive");
        anyhow::ensure!(
            self.heartbeat_period_secs > 0.0 && self.sync_period_secs > 0.0,
            "report periods must be positive"
        );
        Ok(())
    }

    /// The configured id, or a generated `worker-<n>` one.
    pub fn resolved_worker_id(&self) -> WorkerId {
        self.worker_id.clone().unwrap_or_else(|| {
            format!("worker-{}", rand::rng().random_range(1000..10000))
        })
    }

    pub fn resolved_advertise_url(&self) -> String {
        self.advertise_url
            .clone()
            .unwrap_or_else(|| format!("http://{}:{}", self.host, self.port))
    }

    pub fn engine_args(&self) -> EngineArgs {
        EngineArgs::builder()
            .num_blocks(self.num_blocks)
            .block_size(self.block_size)
            .prefill_base_ms(self.prefill_base_ms)
            .prefill_per_block_ms(self.prefill_per_block_ms)
            .decode_per_token_ms(self.decode_per_token_ms)
            .speedup_ratio(self.speedup_ratio)
            .build()
            .expect("engine args from validated config must build")
    }
}
