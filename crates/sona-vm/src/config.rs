//! Runtime configuration
//!
//! All tunables are read from the environment once at startup. Values that
//! fail to parse fall back to their defaults.

use std::env;
use std::thread;

/// Default number of blocking pool threads
const DEFAULT_BLOCKING_THREADS: usize = 4;

/// Default reductions granted per scheduling quantum
const DEFAULT_REDUCTIONS: u16 = 1000;

/// Default young-collection trigger in bytes
const DEFAULT_YOUNG_THRESHOLD: usize = 512 * 1024;

/// Default mature-collection trigger in bytes
const DEFAULT_MATURE_THRESHOLD: usize = 2 * 1024 * 1024;

/// VM configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of primary pool threads
    pub primary_threads: usize,

    /// Number of blocking pool threads
    pub blocking_threads: usize,

    /// Reductions granted to a process per resume
    pub reductions: u16,

    /// Young generation size in bytes; allocation beyond it triggers a
    /// young collection
    pub young_threshold: usize,

    /// Mature occupancy in bytes beyond which a mature collection runs
    pub mature_threshold: usize,
}

impl Config {
    /// Build a configuration from the environment
    pub fn from_env() -> Self {
        Self {
            primary_threads: env_value("SONA_CONCURRENCY", default_concurrency()),
            blocking_threads: env_value("SONA_BLOCKING_THREADS", DEFAULT_BLOCKING_THREADS),
            reductions: env_value("SONA_REDUCTIONS", DEFAULT_REDUCTIONS),
            young_threshold: env_value("SONA_YOUNG_THRESHOLD", DEFAULT_YOUNG_THRESHOLD),
            mature_threshold: env_value("SONA_MATURE_THRESHOLD", DEFAULT_MATURE_THRESHOLD),
        }
    }

    /// A configuration suitable for tests: small pools, small heaps
    pub fn for_tests() -> Self {
        Self {
            primary_threads: 2,
            blocking_threads: 2,
            reductions: 100,
            young_threshold: 32 * 1024,
            mature_threshold: 128 * 1024,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            primary_threads: default_concurrency(),
            blocking_threads: DEFAULT_BLOCKING_THREADS,
            reductions: DEFAULT_REDUCTIONS,
            young_threshold: DEFAULT_YOUNG_THRESHOLD,
            mature_threshold: DEFAULT_MATURE_THRESHOLD,
        }
    }
}

fn default_concurrency() -> usize {
    thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

fn env_value<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}
