// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Runtime configuration.
//!
//! Defaults suit a single-rank process. `from_env` overlays `PARCELX_*`
//! variables on top of the defaults.

use std::time::Duration;

use crate::addr::{Rank, MAX_RANKS};
use crate::error::ConfigError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Worker threads. 0 means one per available CPU.
    pub workers: usize,
    /// This locality.
    pub rank: Rank,
    /// Total localities.
    pub ranks: u32,
    /// Initial ring size of each work-stealing deque.
    pub deque_capacity: usize,
    /// Completed-thread stacks kept per worker for reuse.
    pub stack_cache: usize,
    /// Parcel envelopes kept per worker for reuse.
    pub parcel_cache: usize,
    /// Spin/yield steps before an idle worker parks.
    pub idle_spins: u32,
    /// Longest single park of an idle worker.
    pub idle_park_max: Duration,
    /// Base seed for victim selection.
    pub seed: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workers: 0,
            rank: 0,
            ranks: 1,
            deque_capacity: 64,
            stack_cache: 128,
            parcel_cache: 256,
            idle_spins: 10,
            idle_park_max: Duration::from_millis(2),
            seed: 0x9E37_79B9_7F4A_7C15,
        }
    }
}

impl Config {
    /// Config with exactly `n` workers (0 = auto).
    pub fn with_workers(n: usize) -> Self {
        Self {
            workers: n,
            ..Self::default()
        }
    }

    /// Defaults overlaid with `PARCELX_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(v) = parse(&lookup, "PARCELX_WORKERS")? {
            config.workers = v as usize;
        }
        if let Some(v) = parse(&lookup, "PARCELX_STACK_CACHE")? {
            config.stack_cache = v as usize;
        }
        if let Some(v) = parse(&lookup, "PARCELX_PARCEL_CACHE")? {
            config.parcel_cache = v as usize;
        }
        if let Some(v) = parse(&lookup, "PARCELX_DEQUE_CAPACITY")? {
            config.deque_capacity = v as usize;
        }
        if let Some(v) = parse(&lookup, "PARCELX_SEED")? {
            config.seed = v;
        }
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ranks == 0 {
            return Err(ConfigError::NoRanks);
        }
        if self.ranks > MAX_RANKS {
            return Err(ConfigError::TooManyRanks(self.ranks));
        }
        if self.rank >= self.ranks {
            return Err(ConfigError::RankOutOfRange {
                rank: self.rank,
                ranks: self.ranks,
            });
        }
        Ok(())
    }

    /// Worker count with `0` resolved against the host.
    pub fn resolved_workers(&self) -> usize {
        if self.workers == 0 {
            std::thread::available_parallelism()
                .map(|p| p.get())
                .unwrap_or(4)
        } else {
            self.workers
        }
    }
}

fn parse<F>(lookup: &F, var: &'static str) -> Result<Option<u64>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(var) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { var, value: raw }),
    }
}
