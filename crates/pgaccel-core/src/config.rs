//! Process-wide configuration surface.
//!
//! Every knob is settable by unprivileged users unless noted; `validate()`
//! enforces the same ranges the runtime would refuse at set time.

use pgaccel_common::platform::BLCKSZ;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Reference cost of a sequential page fetch; anchor for the GPU cost knobs.
pub const DEFAULT_SEQ_PAGE_COST: f64 = 1.0;
/// Reference cost of a CPU operator evaluation.
pub const DEFAULT_CPU_OPERATOR_COST: f64 = 0.0025;

const MAX_KILOBYTES: i32 = i32::MAX / 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccelConfig {
    /// Master switch for planner integration.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Collect per-task timings for EXPLAIN.
    #[serde(default)]
    pub perfmon: bool,
    /// Permit bulk-exchange between operators.
    #[serde(default = "default_true")]
    pub bulkexec: bool,
    /// Fall back to the CPU path if the GPU path errors at runtime.
    #[serde(default = "default_true")]
    pub cpu_fallback: bool,
    /// Expose the generated-source path in EXPLAIN.
    #[serde(default)]
    pub debug_kernel_source: bool,
    /// Soft per-session cap on outstanding tasks.
    #[serde(default = "default_max_async_tasks")]
    pub max_async_tasks: i32,
    /// Minimum guarantee of concurrent tasks per session.
    #[serde(default = "default_min_async_tasks")]
    pub min_async_tasks: i32,
    /// Default data-store chunk, in kB (internal).
    #[serde(default = "default_chunk_size_kb")]
    pub chunk_size_kb: i32,
    /// Upper bound on a data-store chunk, in kB (internal).
    #[serde(default = "default_chunk_limit_kb")]
    pub chunk_limit_kb: i32,
    /// Safety factor applied when a chunk size is not predictable exactly.
    #[serde(default = "default_chunk_size_margin")]
    pub chunk_size_margin: f64,
    /// Planner cost to set up a GPU device.
    #[serde(default = "default_gpu_setup_cost")]
    pub gpu_setup_cost: f64,
    /// Planner cost to move data over DMA.
    #[serde(default = "default_gpu_dma_cost")]
    pub gpu_dma_cost: f64,
    /// Planner cost per operator evaluated on the GPU.
    #[serde(default = "default_gpu_operator_cost")]
    pub gpu_operator_cost: f64,

    /// Root under which compiled procedure binaries are cached.
    #[serde(default = "default_base_dir")]
    pub base_dir: String,
    /// Temporary directory component of the cache path.
    #[serde(default = "default_temp_dir")]
    pub temp_dir: String,
    /// File-name prefix of cache entries.
    #[serde(default = "default_temp_file_prefix")]
    pub temp_file_prefix: String,
    /// External device compiler executable.
    #[serde(default = "default_compiler_path")]
    pub compiler_path: String,
    /// Include path handed to the compiler for the extension's headers.
    #[serde(default = "default_include_dir")]
    pub include_dir: String,
}

impl Default for AccelConfig {
    fn default() -> Self {
        // serde defaults double as the programmatic defaults
        toml::from_str("").unwrap_or_else(|_| unreachable!("empty config must parse"))
    }
}

impl AccelConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self, CoreError> {
        let content = std::fs::read_to_string(path)?;
        let config: AccelConfig =
            toml::from_str(&content).map_err(|e| CoreError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from file if it exists, otherwise return defaults.
    pub fn load_or_default(path: &str) -> Self {
        Self::load(path).unwrap_or_default()
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.max_async_tasks < 4 {
            return Err(CoreError::Config(format!(
                "max_async_tasks must be at least 4, not {}",
                self.max_async_tasks
            )));
        }
        let min_cap = (self.max_async_tasks / 4).max(4);
        if self.min_async_tasks < 1 || self.min_async_tasks > min_cap {
            return Err(CoreError::Config(format!(
                "min_async_tasks must be between 1 and {min_cap}, not {}",
                self.min_async_tasks
            )));
        }
        for (name, kb) in [
            ("chunk_size", self.chunk_size_kb),
            ("chunk_limit", self.chunk_limit_kb),
        ] {
            if !(4096..=MAX_KILOBYTES).contains(&kb) {
                return Err(CoreError::Config(format!(
                    "{name} must be between 4096kB and {MAX_KILOBYTES}kB, not {kb}kB"
                )));
            }
        }
        if self.chunk_size_margin < 1.0 {
            return Err(CoreError::Config(format!(
                "chunk_size_margin must be at least 1.0, not {}",
                self.chunk_size_margin
            )));
        }
        for (name, cost) in [
            ("gpu_setup_cost", self.gpu_setup_cost),
            ("gpu_dma_cost", self.gpu_dma_cost),
            ("gpu_operator_cost", self.gpu_operator_cost),
        ] {
            if !cost.is_finite() || cost < 0.0 {
                return Err(CoreError::Config(format!(
                    "{name} must be a non-negative number, not {cost}"
                )));
            }
        }
        Ok(())
    }

    pub fn chunk_size(&self) -> usize {
        (self.chunk_size_kb as usize) << 10
    }

    pub fn chunk_size_limit(&self) -> usize {
        (self.chunk_limit_kb as usize) << 10
    }
}

fn default_true() -> bool {
    true
}

fn default_max_async_tasks() -> i32 {
    32
}

fn default_min_async_tasks() -> i32 {
    4
}

fn default_chunk_size_kb() -> i32 {
    // almost 32MB, leaving room for per-chunk bookkeeping
    32768 - (2 * BLCKSZ as i32 / 1024)
}

fn default_chunk_limit_kb() -> i32 {
    5 * default_chunk_size_kb()
}

fn default_chunk_size_margin() -> f64 {
    1.25
}

fn default_gpu_setup_cost() -> f64 {
    4000.0 * DEFAULT_SEQ_PAGE_COST
}

fn default_gpu_dma_cost() -> f64 {
    10.0 * DEFAULT_SEQ_PAGE_COST
}

fn default_gpu_operator_cost() -> f64 {
    DEFAULT_CPU_OPERATOR_COST / 16.0
}

fn default_base_dir() -> String {
    "base".to_string()
}

fn default_temp_dir() -> String {
    "pgsql_tmp".to_string()
}

fn default_temp_file_prefix() -> String {
    "pgsql_tmp".to_string()
}

fn default_compiler_path() -> String {
    "/usr/local/cuda/bin/nvcc".to_string()
}

fn default_include_dir() -> String {
    "share/extension".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = AccelConfig::default();
        config.validate().expect("defaults validate");
        assert!(config.enabled);
        assert!(!config.perfmon);
        assert!(config.bulkexec);
        assert!(config.cpu_fallback);
        assert_eq!(config.max_async_tasks, 32);
        assert_eq!(config.min_async_tasks, 4);
        assert_eq!(config.chunk_size_kb, 32752);
        assert_eq!(config.chunk_limit_kb, 5 * 32752);
        assert_eq!(config.gpu_setup_cost, 4000.0);
        assert_eq!(config.gpu_dma_cost, 10.0);
        assert_eq!(config.gpu_operator_cost, 0.0025 / 16.0);
    }

    #[test]
    fn rejects_out_of_range() {
        let mut config = AccelConfig::default();
        config.max_async_tasks = 2;
        assert!(config.validate().is_err());

        let mut config = AccelConfig::default();
        config.min_async_tasks = 100;
        assert!(config.validate().is_err());

        let mut config = AccelConfig::default();
        config.chunk_size_margin = 0.5;
        assert!(config.validate().is_err());

        let mut config = AccelConfig::default();
        config.gpu_dma_cost = -1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn toml_overrides() {
        let config: AccelConfig =
            toml::from_str("enabled = false\nmax_async_tasks = 64\n").expect("parse");
        assert!(!config.enabled);
        assert_eq!(config.max_async_tasks, 64);
        assert_eq!(config.min_async_tasks, 4);
        config.validate().expect("valid");
    }
}
