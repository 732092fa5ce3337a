//! Engine Configuration
//!
//! All tunables for the placement engine. Each subsystem gets its own
//! section so a YAML file only has to name the values it overrides:
//!
//! ```yaml
//! geometry:
//!   blks_per_stripe: 64
//!   stripes_per_segment: 256
//!   num_segments: 1024
//! gc:
//!   normal_threshold: 20
//!   urgent_threshold: 5
//! flow_control:
//!   enable: true
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// =============================================================================
// Constants
// =============================================================================

/// Default block size (4KB)
pub const DEFAULT_BLOCK_SIZE: usize = 4096;

/// Default blocks per stripe
pub const DEFAULT_BLKS_PER_STRIPE: u32 = 64;

/// Default stripes per segment
pub const DEFAULT_STRIPES_PER_SEGMENT: u32 = 64;

/// Default number of segments in the user data area
pub const DEFAULT_NUM_SEGMENTS: u32 = 128;

/// Default write buffer pool size (stripes)
pub const DEFAULT_WB_STRIPES: u32 = 64;

/// Default maximum number of volumes per array
pub const DEFAULT_MAX_VOLUMES: u32 = 256;

// =============================================================================
// Geometry
// =============================================================================

/// Static layout of the array.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeometryConfig {
    /// Bytes per block
    pub block_size: usize,

    /// Blocks per stripe
    pub blks_per_stripe: u32,

    /// Stripes per segment
    pub stripes_per_segment: u32,

    /// Segments in the user data area
    pub num_segments: u32,

    /// Stripes in the in-memory write buffer
    pub num_wb_stripes: u32,

    /// Maximum number of volumes
    pub max_volumes: u32,
}

impl Default for GeometryConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            blks_per_stripe: DEFAULT_BLKS_PER_STRIPE,
            stripes_per_segment: DEFAULT_STRIPES_PER_SEGMENT,
            num_segments: DEFAULT_NUM_SEGMENTS,
            num_wb_stripes: DEFAULT_WB_STRIPES,
            max_volumes: DEFAULT_MAX_VOLUMES,
        }
    }
}

impl GeometryConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 || !self.block_size.is_power_of_two() {
            return Err(Error::InvalidGeometry(
                "block_size must be a non-zero power of 2".into(),
            ));
        }
        if self.blks_per_stripe == 0 {
            return Err(Error::InvalidGeometry("blks_per_stripe must be > 0".into()));
        }
        if self.stripes_per_segment == 0 {
            return Err(Error::InvalidGeometry(
                "stripes_per_segment must be > 0".into(),
            ));
        }
        if self.num_segments < 2 {
            return Err(Error::InvalidGeometry("num_segments must be >= 2".into()));
        }
        if self.num_wb_stripes == 0 {
            return Err(Error::InvalidGeometry("num_wb_stripes must be > 0".into()));
        }
        if self.max_volumes == 0 {
            return Err(Error::InvalidGeometry("max_volumes must be > 0".into()));
        }
        let total = self.stripes_per_segment as u64 * self.num_segments as u64;
        if total >= u32::MAX as u64 {
            return Err(Error::InvalidGeometry(format!(
                "user area of {} stripes does not fit the stripe id space",
                total
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Garbage Collection
// =============================================================================

/// Garbage collection thresholds and retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GcConfig {
    /// Start normal GC at or below this many free segments
    pub normal_threshold: u32,

    /// Enter urgent GC (user allocation blocked) at or below this many
    pub urgent_threshold: u32,

    /// Interval of the background GC loop
    #[serde(with = "duration_ms")]
    pub poll_interval: Duration,

    /// Log a warning every time ownership retries cross a multiple of this
    pub ownership_retry_warn_threshold: u32,

    /// Retries before a flush completion escalates to a GC priority hold
    pub max_ownership_retries: u32,

    /// Initial back-off between ownership attempts
    #[serde(with = "duration_ms")]
    pub ownership_backoff: Duration,

    /// Back-off ceiling
    #[serde(with = "duration_ms")]
    pub max_ownership_backoff: Duration,

    /// Initial delay before a failed victim read is resubmitted
    #[serde(with = "duration_ms")]
    pub read_retry_backoff: Duration,

    /// Victim read back-off ceiling
    #[serde(with = "duration_ms")]
    pub max_read_retry_backoff: Duration,

    /// Number of GC write buffers shared by all volumes
    pub num_gc_buffers: u32,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            normal_threshold: 20,
            urgent_threshold: 5,
            poll_interval: Duration::from_millis(100),
            ownership_retry_warn_threshold: 1000,
            max_ownership_retries: 10_000,
            ownership_backoff: Duration::from_micros(50),
            max_ownership_backoff: Duration::from_millis(10),
            read_retry_backoff: Duration::from_millis(1),
            max_read_retry_backoff: Duration::from_millis(100),
            num_gc_buffers: 8,
        }
    }
}

impl GcConfig {
    /// Validate configuration
    pub fn validate(&self, geometry: &GeometryConfig) -> Result<()> {
        if self.urgent_threshold >= self.normal_threshold {
            return Err(Error::Config(
                "gc.urgent_threshold must be below gc.normal_threshold".into(),
            ));
        }
        if self.normal_threshold >= geometry.num_segments {
            return Err(Error::Config(
                "gc.normal_threshold must be below the segment count".into(),
            ));
        }
        if self.ownership_retry_warn_threshold == 0 {
            return Err(Error::Config(
                "gc.ownership_retry_warn_threshold must be > 0".into(),
            ));
        }
        if self.max_ownership_retries < self.ownership_retry_warn_threshold {
            return Err(Error::Config(
                "gc.max_ownership_retries must be >= the warn threshold".into(),
            ));
        }
        if self.num_gc_buffers == 0 {
            return Err(Error::Config("gc.num_gc_buffers must be > 0".into()));
        }
        Ok(())
    }
}

// =============================================================================
// Flow Control
// =============================================================================

/// How tokens are split between user and GC traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistributionStrategy {
    /// User share shrinks linearly between the normal and urgent thresholds
    Linear,
    /// Fixed split per GC mode
    State,
}

/// Admission control between user writes and GC writes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowControlConfig {
    /// Enable flow control
    pub enable: bool,

    /// Token split strategy
    pub strategy: DistributionStrategy,

    /// Tokens per refill cycle, in stripes
    pub total_token_in_stripe: u32,

    /// Force a refill when one bucket has been empty this long
    #[serde(with = "duration_ms")]
    pub refill_timeout: Duration,
}

impl Default for FlowControlConfig {
    fn default() -> Self {
        Self {
            enable: true,
            strategy: DistributionStrategy::Linear,
            total_token_in_stripe: 16,
            refill_timeout: Duration::from_millis(1000),
        }
    }
}

impl FlowControlConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.enable && self.total_token_in_stripe == 0 {
            return Err(Error::Config(
                "flow_control.total_token_in_stripe must be > 0".into(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Scheduler
// =============================================================================

/// Worker pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Worker threads executing events
    pub workers: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { workers: 4 }
    }
}

// =============================================================================
// Engine
// =============================================================================

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub geometry: GeometryConfig,
    pub gc: GcConfig,
    pub flow_control: FlowControlConfig,
    pub scheduler: SchedulerConfig,

    /// Publish new stripes as user-area resident instead of write buffer
    pub write_through: bool,
}

impl EngineConfig {
    /// Parse a YAML document.
    pub fn from_yaml(text: &str) -> Result<Self> {
        let config: EngineConfig = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml(&text)
    }

    /// Validate every section.
    pub fn validate(&self) -> Result<()> {
        self.geometry.validate()?;
        self.gc.validate(&self.geometry)?;
        self.flow_control.validate()?;
        if self.scheduler.workers == 0 {
            return Err(Error::Config("scheduler.workers must be > 0".into()));
        }
        Ok(())
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.geometry.blks_per_stripe, 64);
        assert!(config.flow_control.enable);
        assert!(!config.write_through);
    }

    #[test]
    fn test_geometry_validation() {
        let mut geometry = GeometryConfig::default();
        assert!(geometry.validate().is_ok());

        geometry.blks_per_stripe = 0;
        assert!(geometry.validate().is_err());
        geometry.blks_per_stripe = 16;

        geometry.block_size = 3000;
        assert!(geometry.validate().is_err());
        geometry.block_size = 512;

        geometry.num_segments = 1;
        assert!(geometry.validate().is_err());
    }

    #[test]
    fn test_gc_threshold_ordering() {
        let geometry = GeometryConfig::default();
        let mut gc = GcConfig::default();
        assert!(gc.validate(&geometry).is_ok());

        gc.urgent_threshold = gc.normal_threshold;
        assert!(gc.validate(&geometry).is_err());

        gc.urgent_threshold = 1;
        gc.normal_threshold = geometry.num_segments;
        assert!(gc.validate(&geometry).is_err());
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let yaml = r#"
geometry:
  blks_per_stripe: 16
  stripes_per_segment: 4
  num_segments: 32
gc:
  normal_threshold: 8
  urgent_threshold: 2
  poll_interval: 250
flow_control:
  strategy: state
"#;
        let config = EngineConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.geometry.blks_per_stripe, 16);
        assert_eq!(config.geometry.block_size, DEFAULT_BLOCK_SIZE);
        assert_eq!(config.gc.poll_interval, Duration::from_millis(250));
        assert_eq!(config.flow_control.strategy, DistributionStrategy::State);
        assert_eq!(config.scheduler.workers, 4);
    }

    #[test]
    fn test_invalid_yaml_rejected() {
        let yaml = "gc:\n  normal_threshold: 2\n  urgent_threshold: 4\n";
        assert!(EngineConfig::from_yaml(yaml).is_err());
    }
}
