//! Credit controller and stage configuration.
//!
//! [`CreditConfig`] sizes credit grants; [`StageConfig`] adds the stage-level
//! switches. Both follow the usual pattern: a plain struct with sensible
//! defaults plus a builder that clamps values in `build()`.
//!
//! A `CreditConfig` can also be loaded from TOML. Durations are written as
//! integer micro- or nanoseconds:
//!
//! ```toml
//! credit_round_interval_us = 10000
//! target_horizon_us = 20000
//! default_time_per_unit_ns = 1000
//! min_credit = 1
//! max_credit = 256
//! max_batch_size = 32
//!
//! [time_per_unit_ns]
//! i64 = 1000
//! string = 4000
//! ```
//!
//! A `StageConfig` document puts the stage switches at the top level and the
//! credit settings under `[credit]`:
//!
//! ```toml
//! continuous = false
//! dispatch_policy = "round_robin"
//!
//! [credit]
//! max_credit = 64
//! ```

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

use crate::error::StreamError;
use crate::payload::TypeTag;

/// Default interval between credit rounds.
pub const DEFAULT_CREDIT_ROUND_INTERVAL: Duration = Duration::from_millis(10);

/// Default buffering horizon a grant should cover.
pub const DEFAULT_TARGET_HORIZON: Duration = Duration::from_millis(20);

/// Default processing cost assumed per element.
pub const DEFAULT_TIME_PER_UNIT: Duration = Duration::from_micros(1);

/// Default lower bound of a computed credit target.
pub const DEFAULT_MIN_CREDIT: u32 = 1;

/// Default upper bound of a computed credit target.
pub const DEFAULT_MAX_CREDIT: u32 = 256;

/// Default maximum number of elements per batch.
pub const DEFAULT_MAX_BATCH_SIZE: usize = 32;

/// Default smoothing factor for measured processing times.
pub const DEFAULT_EWMA_ALPHA: f64 = 0.2;

/// How a scatterer spreads elements over its outbound paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchPolicy {
    /// Every path receives every element.
    #[default]
    Broadcast,
    /// Each element goes to exactly one path, rotating over paths with credit.
    RoundRobin,
}

/// Configuration of the credit controller.
#[derive(Debug, Clone, PartialEq)]
pub struct CreditConfig {
    /// How often `recompute_round` runs.
    pub credit_round_interval: Duration,
    /// Amount of work a grant should cover (the leaky bucket's depth).
    pub target_horizon: Duration,
    /// Assumed processing cost per element, keyed by type tag name.
    pub time_per_unit: HashMap<String, Duration>,
    /// Cost assumed for types without an entry in `time_per_unit`.
    pub default_time_per_unit: Duration,
    /// Lower bound of a computed target.
    pub min_credit: u32,
    /// Upper bound of a computed target.
    pub max_credit: u32,
    /// Maximum elements per emitted batch.
    pub max_batch_size: usize,
    /// Weight of a new processing-time sample (0.0, 1.0].
    pub ewma_alpha: f64,
}

impl Default for CreditConfig {
    fn default() -> Self {
        Self {
            credit_round_interval: DEFAULT_CREDIT_ROUND_INTERVAL,
            target_horizon: DEFAULT_TARGET_HORIZON,
            time_per_unit: HashMap::new(),
            default_time_per_unit: DEFAULT_TIME_PER_UNIT,
            min_credit: DEFAULT_MIN_CREDIT,
            max_credit: DEFAULT_MAX_CREDIT,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            ewma_alpha: DEFAULT_EWMA_ALPHA,
        }
    }
}

impl CreditConfig {
    /// Creates a builder for custom configuration.
    #[must_use]
    pub fn builder() -> CreditConfigBuilder {
        CreditConfigBuilder::default()
    }

    /// Configured processing cost for `tag`, falling back to the default.
    #[must_use]
    pub fn time_per_unit(&self, tag: TypeTag) -> Duration {
        self.time_per_unit
            .get(tag.name())
            .copied()
            .unwrap_or(self.default_time_per_unit)
    }

    /// Checks the configuration for values the controller cannot work with.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::InvalidConfig`] describing the first problem.
    pub fn validate(&self) -> Result<(), StreamError> {
        if self.credit_round_interval.is_zero() {
            return Err(StreamError::InvalidConfig(
                "credit_round_interval must be positive".to_string(),
            ));
        }
        if self.target_horizon.is_zero() {
            return Err(StreamError::InvalidConfig(
                "target_horizon must be positive".to_string(),
            ));
        }
        if self.max_credit == 0 {
            return Err(StreamError::InvalidConfig(
                "max_credit must be positive".to_string(),
            ));
        }
        if self.min_credit > self.max_credit {
            return Err(StreamError::InvalidConfig(format!(
                "min_credit {} exceeds max_credit {}",
                self.min_credit, self.max_credit
            )));
        }
        if self.max_batch_size == 0 {
            return Err(StreamError::InvalidConfig(
                "max_batch_size must be positive".to_string(),
            ));
        }
        if !(self.ewma_alpha > 0.0 && self.ewma_alpha <= 1.0) {
            return Err(StreamError::InvalidConfig(format!(
                "ewma_alpha {} outside (0, 1]",
                self.ewma_alpha
            )));
        }
        Ok(())
    }

    /// Parses and validates a TOML document.
    ///
    /// Missing keys take their default values.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::InvalidConfig`] if the document does not parse
    /// or fails [`validate`](Self::validate).
    pub fn from_toml_str(input: &str) -> Result<Self, StreamError> {
        let raw: RawCreditConfig =
            toml::from_str(input).map_err(|e| StreamError::InvalidConfig(e.to_string()))?;
        let config = Self::from(raw);
        config.validate()?;
        Ok(config)
    }
}

/// On-disk shape of [`CreditConfig`].
#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawCreditConfig {
    credit_round_interval_us: u64,
    target_horizon_us: u64,
    default_time_per_unit_ns: u64,
    time_per_unit_ns: HashMap<String, u64>,
    min_credit: u32,
    max_credit: u32,
    max_batch_size: usize,
    ewma_alpha: f64,
}

impl Default for RawCreditConfig {
    fn default() -> Self {
        let defaults = CreditConfig::default();
        Self {
            credit_round_interval_us: duration_to_micros(defaults.credit_round_interval),
            target_horizon_us: duration_to_micros(defaults.target_horizon),
            default_time_per_unit_ns: duration_to_nanos(defaults.default_time_per_unit),
            time_per_unit_ns: HashMap::new(),
            min_credit: defaults.min_credit,
            max_credit: defaults.max_credit,
            max_batch_size: defaults.max_batch_size,
            ewma_alpha: defaults.ewma_alpha,
        }
    }
}

impl From<RawCreditConfig> for CreditConfig {
    fn from(raw: RawCreditConfig) -> Self {
        Self {
            credit_round_interval: Duration::from_micros(raw.credit_round_interval_us),
            target_horizon: Duration::from_micros(raw.target_horizon_us),
            time_per_unit: raw
                .time_per_unit_ns
                .into_iter()
                .map(|(tag, ns)| (tag, Duration::from_nanos(ns)))
                .collect(),
            default_time_per_unit: Duration::from_nanos(raw.default_time_per_unit_ns),
            min_credit: raw.min_credit,
            max_credit: raw.max_credit,
            max_batch_size: raw.max_batch_size,
            ewma_alpha: raw.ewma_alpha,
        }
    }
}

fn duration_to_micros(d: Duration) -> u64 {
    u64::try_from(d.as_micros()).unwrap_or(u64::MAX)
}

fn duration_to_nanos(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

/// Builder for [`CreditConfig`].
#[derive(Debug, Default)]
pub struct CreditConfigBuilder {
    credit_round_interval: Option<Duration>,
    target_horizon: Option<Duration>,
    time_per_unit: HashMap<String, Duration>,
    default_time_per_unit: Option<Duration>,
    min_credit: Option<u32>,
    max_credit: Option<u32>,
    max_batch_size: Option<usize>,
    ewma_alpha: Option<f64>,
}

impl CreditConfigBuilder {
    /// Sets the credit round interval.
    #[must_use]
    pub fn credit_round_interval(mut self, interval: Duration) -> Self {
        self.credit_round_interval = Some(interval);
        self
    }

    /// Sets the buffering horizon a grant should cover.
    #[must_use]
    pub fn target_horizon(mut self, horizon: Duration) -> Self {
        self.target_horizon = Some(horizon);
        self
    }

    /// Sets the assumed processing cost per element of `tag`.
    #[must_use]
    pub fn time_per_unit(mut self, tag: TypeTag, cost: Duration) -> Self {
        self.time_per_unit.insert(tag.name().to_string(), cost);
        self
    }

    /// Sets the cost assumed for types without an explicit entry.
    #[must_use]
    pub fn default_time_per_unit(mut self, cost: Duration) -> Self {
        self.default_time_per_unit = Some(cost);
        self
    }

    /// Sets the lower bound of a computed target.
    #[must_use]
    pub fn min_credit(mut self, credit: u32) -> Self {
        self.min_credit = Some(credit);
        self
    }

    /// Sets the upper bound of a computed target.
    #[must_use]
    pub fn max_credit(mut self, credit: u32) -> Self {
        self.max_credit = Some(credit);
        self
    }

    /// Sets the maximum number of elements per batch.
    #[must_use]
    pub fn max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = Some(size);
        self
    }

    /// Sets the smoothing factor for measured processing times.
    #[must_use]
    pub fn ewma_alpha(mut self, alpha: f64) -> Self {
        self.ewma_alpha = Some(alpha);
        self
    }

    /// Builds the configuration.
    ///
    /// Zero durations and sizes are raised to the smallest usable value and
    /// `min_credit` is capped at `max_credit`.
    #[must_use]
    pub fn build(self) -> CreditConfig {
        let max_credit = self.max_credit.unwrap_or(DEFAULT_MAX_CREDIT).max(1);
        CreditConfig {
            credit_round_interval: self
                .credit_round_interval
                .unwrap_or(DEFAULT_CREDIT_ROUND_INTERVAL)
                .max(Duration::from_micros(1)),
            target_horizon: self
                .target_horizon
                .unwrap_or(DEFAULT_TARGET_HORIZON)
                .max(Duration::from_micros(1)),
            time_per_unit: self.time_per_unit,
            default_time_per_unit: self
                .default_time_per_unit
                .unwrap_or(DEFAULT_TIME_PER_UNIT)
                .max(Duration::from_nanos(1)),
            min_credit: self.min_credit.unwrap_or(DEFAULT_MIN_CREDIT).min(max_credit),
            max_credit,
            max_batch_size: self.max_batch_size.unwrap_or(DEFAULT_MAX_BATCH_SIZE).max(1),
            ewma_alpha: self
                .ewma_alpha
                .unwrap_or(DEFAULT_EWMA_ALPHA)
                .clamp(f64::EPSILON, 1.0),
        }
    }
}

/// Configuration of a stage.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageConfig {
    /// Credit controller settings.
    pub credit: CreditConfig,
    /// Keep the stage alive without inbound demand.
    pub continuous: bool,
    /// Dispatch policy for every outbound scatterer.
    pub dispatch_policy: DispatchPolicy,
}

impl StageConfig {
    /// Creates a stage configuration around `credit`.
    #[must_use]
    pub fn new(credit: CreditConfig) -> Self {
        Self {
            credit,
            ..Default::default()
        }
    }

    /// Sets the `continuous` flag.
    #[must_use]
    pub fn continuous(mut self, continuous: bool) -> Self {
        self.continuous = continuous;
        self
    }

    /// Sets the dispatch policy.
    #[must_use]
    pub fn dispatch_policy(mut self, policy: DispatchPolicy) -> Self {
        self.dispatch_policy = policy;
        self
    }

    /// Parses and validates a TOML document.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::InvalidConfig`] if the document does not parse
    /// or the credit settings fail [`CreditConfig::validate`].
    pub fn from_toml_str(input: &str) -> Result<Self, StreamError> {
        let raw: RawStageConfig =
            toml::from_str(input).map_err(|e| StreamError::InvalidConfig(e.to_string()))?;
        let credit = CreditConfig::from(raw.credit);
        credit.validate()?;
        Ok(Self {
            credit,
            continuous: raw.continuous,
            dispatch_policy: raw.dispatch_policy,
        })
    }
}

/// On-disk shape of [`StageConfig`].
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawStageConfig {
    continuous: bool,
    dispatch_policy: DispatchPolicy,
    credit: RawCreditConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = CreditConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.credit_round_interval, Duration::from_millis(10));
        assert_eq!(config.time_per_unit(TypeTag::new("i64")), DEFAULT_TIME_PER_UNIT);
    }

    #[test]
    fn test_builder_clamps() {
        let config = CreditConfig::builder()
            .credit_round_interval(Duration::ZERO)
            .min_credit(50)
            .max_credit(10)
            .max_batch_size(0)
            .ewma_alpha(3.0)
            .time_per_unit(TypeTag::new("string"), Duration::from_micros(4))
            .build();

        assert!(config.validate().is_ok());
        assert_eq!(config.min_credit, 10);
        assert_eq!(config.max_credit, 10);
        assert_eq!(config.max_batch_size, 1);
        assert!((config.ewma_alpha - 1.0).abs() < f64::EPSILON);
        assert_eq!(
            config.time_per_unit(TypeTag::new("string")),
            Duration::from_micros(4)
        );
    }

    #[test]
    fn test_validate_rejects_inverted_bounds() {
        let config = CreditConfig {
            min_credit: 8,
            max_credit: 4,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(StreamError::InvalidConfig(msg)) if msg.contains("min_credit")
        ));
    }

    #[test]
    fn test_from_toml() {
        let config = CreditConfig::from_toml_str(
            r#"
            credit_round_interval_us = 5000
            max_credit = 64

            [time_per_unit_ns]
            i64 = 250
            "#,
        )
        .unwrap();

        assert_eq!(config.credit_round_interval, Duration::from_millis(5));
        assert_eq!(config.max_credit, 64);
        assert_eq!(config.min_credit, DEFAULT_MIN_CREDIT);
        assert_eq!(
            config.time_per_unit(TypeTag::new("i64")),
            Duration::from_nanos(250)
        );
    }

    #[test]
    fn test_from_toml_rejects_unknown_and_invalid() {
        assert!(CreditConfig::from_toml_str("credit_round_interval = 5").is_err());
        assert!(CreditConfig::from_toml_str("max_batch_size = 0").is_err());
    }

    #[test]
    fn test_stage_config_from_toml() {
        let config = StageConfig::from_toml_str(
            r#"
            continuous = true
            dispatch_policy = "round_robin"

            [credit]
            max_credit = 64
            "#,
        )
        .unwrap();
        assert!(config.continuous);
        assert_eq!(config.dispatch_policy, DispatchPolicy::RoundRobin);
        assert_eq!(config.credit.max_credit, 64);

        let defaults = StageConfig::from_toml_str("").unwrap();
        assert_eq!(defaults, StageConfig::default());

        assert!(StageConfig::from_toml_str(r#"dispatch_policy = "anycast""#).is_err());
        assert!(StageConfig::from_toml_str("[credit]\nmax_batch_size = 0").is_err());
    }

    #[test]
    fn test_stage_config_builder() {
        let config = StageConfig::default()
            .continuous(true)
            .dispatch_policy(DispatchPolicy::RoundRobin);
        assert!(config.continuous);
        assert_eq!(config.dispatch_policy, DispatchPolicy::RoundRobin);
    }
}
