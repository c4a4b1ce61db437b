//! Adaptive sampling of the offload path.
//!
//! Readers send one lookup in `sample_rate` through the offload path. While
//! a compaction rewrites tables the engine wants every lookup sampled, so
//! `AdaptiveSampler::run_with_boosted_sampling` drops the rate to 1 for the
//! duration of a window and puts the previous rate back afterwards.
//!
//! The rate lives in process-wide settings that every reader consults at
//! call time. Readers on other threads may observe the boosted rate while a
//! window is open; nothing synchronizes them with the sampler.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::thread;
use std::time::{Duration, Instant};

use crate::config::SamplerConfig;

/// Rate used when none is configured or the configured one does not parse.
pub const DEFAULT_SAMPLE_RATE: u32 = 100;

/// Rate in effect while a boost window is open.
pub const BOOSTED_SAMPLE_RATE: u32 = 1;

/// Where the sample rate and the adaptive toggle are stored.
pub trait SampleSettings: Send + Sync {
    /// The raw configured rate, if any.
    fn sample_rate(&self) -> Option<String>;

    fn set_sample_rate(&self, rate: &str) -> io::Result<()>;

    fn adaptive_enabled(&self) -> bool;
}

impl<T: SampleSettings + ?Sized> SampleSettings for Arc<T> {
    fn sample_rate(&self) -> Option<String> {
        (**self).sample_rate()
    }

    fn set_sample_rate(&self, rate: &str) -> io::Result<()> {
        (**self).set_sample_rate(rate)
    }

    fn adaptive_enabled(&self) -> bool {
        (**self).adaptive_enabled()
    }
}

/// Settings read from the process environment. Adaptive mode is on when
/// the adaptive variable is present, whatever its value.
#[derive(Debug, Clone)]
pub struct EnvSettings {
    rate_var: String,
    adaptive_var: String,
}

impl EnvSettings {
    pub fn new(rate_var: impl Into<String>, adaptive_var: impl Into<String>) -> Self {
        Self {
            rate_var: rate_var.into(),
            adaptive_var: adaptive_var.into(),
        }
    }
}

impl Default for EnvSettings {
    fn default() -> Self {
        let config = SamplerConfig::default();
        Self::new(config.rate_var, config.adaptive_var)
    }
}

impl SampleSettings for EnvSettings {
    fn sample_rate(&self) -> Option<String> {
        std::env::var(&self.rate_var).ok()
    }

    fn set_sample_rate(&self, rate: &str) -> io::Result<()> {
        let invalid = |s: &str| s.is_empty() || s.contains('=') || s.contains('\0');
        if invalid(self.rate_var.as_str()) || rate.contains('\0') {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("cannot set {:?} to {:?}", self.rate_var, rate),
            ));
        }
        std::env::set_var(&self.rate_var, rate);
        Ok(())
    }

    fn adaptive_enabled(&self) -> bool {
        std::env::var_os(&self.adaptive_var).is_some()
    }
}

/// In-memory settings, shareable through an `Arc`.
#[derive(Debug, Default)]
pub struct MemorySettings {
    rate: RwLock<Option<String>>,
    adaptive: AtomicBool,
    read_only: AtomicBool,
}

impl MemorySettings {
    pub fn new(rate: Option<&str>, adaptive: bool) -> Self {
        Self {
            rate: RwLock::new(rate.map(str::to_string)),
            adaptive: AtomicBool::new(adaptive),
            read_only: AtomicBool::new(false),
        }
    }

    pub fn set_adaptive(&self, adaptive: bool) {
        self.adaptive.store(adaptive, Ordering::SeqCst);
    }

    /// Makes every subsequent `set_sample_rate` fail.
    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
    }
}

impl SampleSettings for MemorySettings {
    fn sample_rate(&self) -> Option<String> {
        self.rate.read().ok().and_then(|rate| rate.clone())
    }

    fn set_sample_rate(&self, rate: &str) -> io::Result<()> {
        if self.read_only.load(Ordering::SeqCst) {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "sample rate is read-only",
            ));
        }
        let mut current = self
            .rate
            .write()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "sample rate lock poisoned"))?;
        *current = Some(rate.to_string());
        Ok(())
    }

    fn adaptive_enabled(&self) -> bool {
        self.adaptive.load(Ordering::SeqCst)
    }
}

pub struct AdaptiveSampler<S = EnvSettings> {
    settings: S,
    boost_window: Duration,
}

impl AdaptiveSampler<EnvSettings> {
    pub fn from_config(config: &SamplerConfig) -> Self {
        Self::new(EnvSettings::new(&config.rate_var, &config.adaptive_var))
            .with_boost_window(config.boost_window)
    }
}

impl<S: SampleSettings> AdaptiveSampler<S> {
    pub fn new(settings: S) -> Self {
        Self {
            settings,
            boost_window: SamplerConfig::default().boost_window,
        }
    }

    pub fn with_boost_window(mut self, window: Duration) -> Self {
        self.boost_window = window;
        self
    }

    pub fn settings(&self) -> &S {
        &self.settings
    }

    pub fn boost_window(&self) -> Duration {
        self.boost_window
    }

    /// The current sample rate, `DEFAULT_SAMPLE_RATE` when unset or
    /// unparsable.
    pub fn sample_rate(&self) -> u32 {
        let Some(raw) = self.settings.sample_rate() else {
            return DEFAULT_SAMPLE_RATE;
        };
        match raw.trim().parse::<u32>() {
            Ok(rate) => rate,
            Err(e) => {
                tracing::warn!(value = %raw, error = %e, "Invalid sample rate, using default");
                DEFAULT_SAMPLE_RATE
            }
        }
    }

    /// Runs `body` with every lookup sampled, keeping the boost for at least
    /// `window`, then restores the previous rate. The rate is restored even
    /// if `body` panics. Without adaptive mode or a configured rate, `body`
    /// runs at the current rate.
    pub fn run_with_boosted_sampling<T>(&self, window: Duration, body: impl FnOnce() -> T) -> T {
        if !self.settings.adaptive_enabled() {
            return body();
        }
        let Some(previous) = self.settings.sample_rate() else {
            tracing::warn!("No sample rate configured, not boosting");
            return body();
        };

        tracing::info!(previous = %previous, ?window, "Setting sample rate to 1");
        if let Err(e) = self
            .settings
            .set_sample_rate(&BOOSTED_SAMPLE_RATE.to_string())
        {
            tracing::warn!(error = %e, "Failed to boost sample rate");
            return body();
        }

        let started = Instant::now();
        let _restore = RestoreRate {
            settings: &self.settings,
            previous,
        };
        let output = body();
        if let Some(remaining) = window.checked_sub(started.elapsed()) {
            thread::sleep(remaining);
        }
        output
    }

    /// Holds the boost for the configured window; the form a compaction
    /// trigger uses.
    pub fn boost(&self) {
        self.boost_for(self.boost_window)
    }

    pub fn boost_for(&self, window: Duration) {
        self.run_with_boosted_sampling(window, || ())
    }
}

struct RestoreRate<'a, S: SampleSettings> {
    settings: &'a S,
    previous: String,
}

impl<S: SampleSettings> Drop for RestoreRate<'_, S> {
    fn drop(&mut self) {
        match self.settings.set_sample_rate(&self.previous) {
            Ok(()) => tracing::debug!(rate = %self.previous, "Restored sample rate"),
            Err(e) => tracing::warn!(rate = %self.previous, error = %e, "Failed to restore sample rate"),
        }
    }
}

/// Picks which lookups take the offload path: every `rate`-th call, with
/// the rate read at call time.
#[derive(Debug, Default)]
pub struct OffloadThrottle {
    calls: AtomicU64,
}

impl OffloadThrottle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn should_offload<S: SampleSettings>(&self, sampler: &AdaptiveSampler<S>) -> bool {
        let rate = u64::from(sampler.sample_rate().max(1));
        self.calls.fetch_add(1, Ordering::Relaxed) % rate == 0
    }
}
