// SPDX-FileCopyrightText: Copyright (c) 2025 kvflow contributors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Serialized},
};
use serde::{Deserialize, Serialize};

/// Worker-selection strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingStrategy {
    /// Longest cached prefix wins; fall back to least-loaded on a miss.
    CacheAware,
    /// Rotate through live workers.
    RoundRobin,
    /// Minimum reported load, rotating through ties.
    LeastLoaded,
}

impl std::str::FromStr for RoutingStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "cache_aware" => Ok(RoutingStrategy::CacheAware),
            "round_robin" => Ok(RoutingStrategy::RoundRobin),
            "least_loaded" => Ok(RoutingStrategy::LeastLoaded),
            other => Err(format!(
                "invalid strategy '{other}'; expected cache_aware, round_robin or least_loaded"
            )),
        }
    }
}

/// Router configuration, read from `KVFLOW_ROUTER_*` environment variables
/// over built-in defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    pub strategy: RoutingStrategy,

    /// Forward requests to the chosen worker (true) or return the routing
    /// decision only (false).
    pub proxy_mode: bool,

    pub host: String,
    pub port: u16,

    /// Tokens per cache block; must match the workers.
    pub block_size: usize,

    /// Worker cache capacity in blocks; prompts needing more are rejected
    /// up front.
    pub cache_capacity_blocks: usize,

    /// Load added to the chosen worker at dispatch time, corrected by its
    /// next heartbeat. Tuned to a typical request duration.
    pub speculative_load_ms: f64,

    /// Workers whose last heartbeat is older than this are dropped.
    pub stale_worker_timeout_secs: f64,

    /// Deadline for a whole dispatch, including the proxy round trip.
    pub request_timeout_secs: f64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            strategy: RoutingStrategy::CacheAware,
            proxy_mode: false,
            host: "127.0.0.1".to_string(),
            port: 8080,
            block_size: 16,
            cache_capacity_blocks: 924,
            speculative_load_ms: 50.0,
            stale_worker_timeout_secs: 10.0,
            request_timeout_secs: 30.0,
        }
    }
}

impl RouterConfig {
    /// Instantiates and reads router configuration from the environment.
    pub fn from_settings() -> anyhow::Result<Self> {
        let config: Self = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Env::prefixed("KVFLOW_ROUTER_"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.block_size > 0, "block_size must be positive");
        anyhow::ensure!(
            self.cache_capacity_blocks > 0,
            "cache_capacity_blocks must be positive"
        );
        anyhow::ensure!(
            self.stale_worker_timeout_secs > 0.0,
            "stale_worker_timeout_secs must be positive"
        );
        anyhow::ensure!(
            self.request_timeout_secs > 0.0,
            "request_timeout_secs must be positive"
        );
        Ok(())
    }

    pub fn stale_worker_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.stale_worker_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.request_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_parse() {
        assert_eq!(
            "cache_aware".parse::<RoutingStrategy>().unwrap(),
            RoutingStrategy::CacheAware
        );
        assert_eq!(
            "ROUND_ROBIN".parse::<RoutingStrategy>().unwrap(),
            RoutingStrategy::RoundRobin
        );
        assert!("sticky".parse::<RoutingStrategy>().is_err());
    }

    #[test]
    fn test_strategy_serde_names() {
        assert_eq!(
            serde_json::to_string(&RoutingStrategy::LeastLoaded).unwrap(),
            "\"least_loaded\""
        );
        let strategy: RoutingStrategy = serde_json::from_str("\"cache_aware\"").unwrap();
        assert_eq!(strategy, RoutingStrategy::CacheAware);
    }

    #[test]
    fn test_defaults_are_valid() {
        RouterConfig::default().validate().unwrap();
    }
}
