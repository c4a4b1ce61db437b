use std::path::PathBuf;
use std::time::Duration;

use crate::xrp::Mode;

/// Configuration for opening read contexts
#[derive(Debug, Clone)]
pub struct OffloadConfig {
    /// How the context reaches the offload program (default: Simulated)
    pub mode: Mode,

    /// Pinned offload program, used in privileged mode
    /// (default: /sys/fs/bpf/ashdb_xrp)
    pub program_path: PathBuf,

    /// Expected BPF program type of the pinned program (default: unchecked)
    pub program_type: Option<u32>,

    /// Sampling configuration
    pub sampler: SamplerConfig,
}

#[derive(Debug, Clone)]
pub struct SamplerConfig {
    /// Environment variable holding the sample rate (default: XRP_SAMPLE_RATE)
    pub rate_var: String,

    /// Environment variable whose presence enables adaptive sampling
    /// (default: XRP_ADAPTIVE_RATE)
    pub adaptive_var: String,

    /// How long a compaction keeps every lookup sampled (default: 30s)
    pub boost_window: Duration,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            rate_var: "XRP_SAMPLE_RATE".to_string(),
            adaptive_var: "XRP_ADAPTIVE_RATE".to_string(),
            boost_window: Duration::from_secs(30),
        }
    }
}

impl Default for OffloadConfig {
    fn default() -> Self {
        Self {
            mode: Mode::Simulated,
            program_path: PathBuf::from("/sys/fs/bpf/ashdb_xrp"),
            program_type: None,
            sampler: SamplerConfig::default(),
        }
    }
}

impl OffloadConfig {
    /// Create a new config for the given mode
    pub fn new(mode: Mode) -> Self {
        Self {
            mode,
            ..Default::default()
        }
    }

    /// Set the pinned program path
    pub fn program_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.program_path = path.into();
        self
    }

    /// Require the pinned program to have the given type
    pub fn program_type(mut self, prog_type: u32) -> Self {
        self.program_type = Some(prog_type);
        self
    }

    /// Configure sampling
    pub fn sampler(mut self, config: SamplerConfig) -> Self {
        self.sampler = config;
        self
    }
}

impl SamplerConfig {
    /// Set the sample rate variable
    pub fn rate_var(mut self, name: impl Into<String>) -> Self {
        self.rate_var = name.into();
        self
    }

    /// Set the adaptive toggle variable
    pub fn adaptive_var(mut self, name: impl Into<String>) -> Self {
        self.adaptive_var = name.into();
        self
    }

    /// Set the boost window
    pub fn boost_window(mut self, window: Duration) -> Self {
        self.boost_window = window;
        self
    }
}
