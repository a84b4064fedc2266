//! Shared tracing setup for the PIM host workspace
//!
//! Host programs and integration tests install their subscriber through
//! [`init_global_tracing`] or [`init_from_env`], so every binary emits the
//! same fields in the same format. Installing also applies
//! the performance settings read by [`performance::PerformanceSpan`].
//!
//! | variable | effect |
//! |---|---|
//! | `PIM_TRACING_PROFILE` | preset: `local`, `ci` or `performance` |
//! | `PIM_TRACING_DIRECTIVES` | filter directives, over `RUST_LOG` |
//! | `PIM_TRACING_FORMAT` | `compact`, `pretty` or `json` |
//! | `PIM_PERF_TRACING` | `1`/`true`/`yes`/`on` enables performance spans |
//! | `PIM_PERF_THRESHOLD_US` | default threshold of performance spans |

pub mod performance;

#[macro_use]
pub mod macros;

use std::env;
use std::str::FromStr;

use tracing::Subscriber;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt as tracing_fmt, EnvFilter, Registry};

// Used by the exported macros so callers need no direct `tracing` dependency.
#[doc(hidden)]
pub use tracing as __tracing;

pub const ENV_PROFILE: &str = "PIM_TRACING_PROFILE";
pub const ENV_DIRECTIVES: &str = "PIM_TRACING_DIRECTIVES";
pub const ENV_FORMAT: &str = "PIM_TRACING_FORMAT";
pub const ENV_PERF_TRACING: &str = "PIM_PERF_TRACING";
pub const ENV_PERF_THRESHOLD_US: &str = "PIM_PERF_THRESHOLD_US";

const DEFAULT_DIRECTIVE: &str = "info";

/// Named starting points for a [`TracingConfig`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TracingProfile {
    /// Pretty, coloured output
    #[default]
    Local,
    /// JSON lines for log collectors
    Ci,
    /// JSON with span timings and debug output of the PIM crates
    Performance,
}

impl FromStr for TracingProfile {
    type Err = TracingSetupError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "local" | "dev" => Ok(Self::Local),
            "ci" => Ok(Self::Ci),
            "performance" | "perf" => Ok(Self::Performance),
            other => Err(TracingSetupError::UnknownProfile(other.to_string())),
        }
    }
}

/// Formatter used by the output layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TracingOutput {
    Compact,
    Pretty,
    Json,
}

impl FromStr for TracingOutput {
    type Err = TracingSetupError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(TracingSetupError::UnknownFormat(other.to_string())),
        }
    }
}

/// How the shared subscriber behaves
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Filter directives, e.g. `pim_host=debug,info`. Falls back to
    /// `RUST_LOG`, then to `info`.
    pub directives: Option<String>,
    pub include_targets: bool,
    /// Rank workers are named after their rank, so this makes interleaved
    /// asynchronous output readable.
    pub include_thread_names: bool,
    pub ansi: bool,
    pub span_events: FmtSpan,
    pub output: TracingOutput,
    /// When false, [`performance::PerformanceSpan`]s log nothing.
    pub performance_spans: bool,
    /// Threshold applied to performance spans created without one.
    pub performance_threshold_us: Option<u64>,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self::for_profile(TracingProfile::Local)
    }
}

impl TracingConfig {
    pub fn for_profile(profile: TracingProfile) -> Self {
        let local = Self {
            directives: None,
            include_targets: true,
            include_thread_names: false,
            ansi: true,
            span_events: FmtSpan::NONE,
            output: TracingOutput::Pretty,
            performance_spans: cfg!(debug_assertions),
            performance_threshold_us: None,
        };

        match profile {
            TracingProfile::Local => local,
            TracingProfile::Ci => Self {
                include_thread_names: true,
                ansi: false,
                output: TracingOutput::Json,
                performance_spans: false,
                ..local
            },
            TracingProfile::Performance => Self {
                directives: Some("pim_host=debug,pim_driver=debug".to_string()),
                include_thread_names: true,
                ansi: false,
                span_events: FmtSpan::CLOSE,
                output: TracingOutput::Json,
                performance_spans: true,
                ..local
            },
        }
    }

    pub fn for_local() -> Self {
        Self::for_profile(TracingProfile::Local)
    }

    pub fn for_ci() -> Self {
        Self::for_profile(TracingProfile::Ci)
    }

    pub fn for_performance() -> Self {
        Self::for_profile(TracingProfile::Performance)
    }

    /// Configuration described by the `PIM_TRACING_*` and `PIM_PERF_*`
    /// variables. Unparseable values are ignored.
    pub fn from_env() -> Self {
        let profile = env_value(ENV_PROFILE)
            .and_then(|value| value.parse().ok())
            .unwrap_or_default();
        let mut config = Self::for_profile(profile);

        if let Some(directives) = env_value(ENV_DIRECTIVES) {
            config.directives = Some(directives);
        }
        if let Some(output) = env_value(ENV_FORMAT).and_then(|value| value.parse().ok()) {
            config.output = output;
            config.ansi &= output != TracingOutput::Json;
        }
        if let Some(flag) = env_value(ENV_PERF_TRACING) {
            config.performance_spans = matches!(flag.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on");
        }
        if let Some(threshold) = env_value(ENV_PERF_THRESHOLD_US).and_then(|value| value.parse().ok()) {
            config.performance_threshold_us = Some(threshold);
        }

        config
    }

    fn filter(&self) -> Result<EnvFilter, TracingSetupError> {
        match &self.directives {
            Some(directives) => {
                EnvFilter::try_new(directives).map_err(|err| TracingSetupError::InvalidFilter(err.to_string()))
            }
            None => Ok(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE))),
        }
    }
}

/// Trimmed value of `key`, `None` when unset or blank.
fn env_value(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Tracing setup failures
#[derive(Debug, thiserror::Error)]
pub enum TracingSetupError {
    #[error("invalid tracing directive: {0}")]
    InvalidFilter(String),

    #[error("unknown tracing profile: {0}")]
    UnknownProfile(String),

    #[error("unknown tracing format: {0}")]
    UnknownFormat(String),

    /// Usually another subscriber is already installed
    #[error("failed to install global tracing subscriber: {0}")]
    SubscriberInit(#[from] tracing_subscriber::util::TryInitError),
}

/// Subscriber for `config`, not installed.
pub fn build_subscriber(config: &TracingConfig) -> Result<impl Subscriber + Send + Sync, TracingSetupError> {
    let (filter, layer) = subscriber_layers(config)?;
    Ok(Registry::default().with(layer).with(filter))
}

/// Filter and formatter layers, for callers composing their own registry.
pub fn subscriber_layers(
    config: &TracingConfig,
) -> Result<(EnvFilter, Box<dyn Layer<Registry> + Send + Sync>), TracingSetupError> {
    let filter = config.filter()?;
    let base = tracing_fmt::layer()
        .with_target(config.include_targets)
        .with_thread_names(config.include_thread_names)
        .with_span_events(config.span_events.clone());

    let layer: Box<dyn Layer<Registry> + Send + Sync> = match config.output {
        TracingOutput::Compact => Box::new(base.compact().with_ansi(config.ansi)),
        TracingOutput::Pretty => Box::new(base.pretty().with_ansi(config.ansi)),
        TracingOutput::Json => Box::new(base.json().with_ansi(false)),
    };
    Ok((filter, layer))
}

/// Install the subscriber for `config` process-wide and apply its
/// performance settings.
pub fn init_global_tracing(config: &TracingConfig) -> Result<(), TracingSetupError> {
    build_subscriber(config)?.try_init()?;
    performance::configure(config.performance_spans, config.performance_threshold_us);
    Ok(())
}

/// [`init_global_tracing`] with [`TracingConfig::from_env`]. A subscriber
/// that is already installed is left in place.
pub fn init_from_env() {
    match init_global_tracing(&TracingConfig::from_env()) {
        Ok(()) | Err(TracingSetupError::SubscriberInit(_)) => {}
        Err(err) => eprintln!("pim-tracing: {err}"),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const KEYS: &[&str] = &[
        ENV_PROFILE,
        ENV_DIRECTIVES,
        ENV_FORMAT,
        ENV_PERF_TRACING,
        ENV_PERF_THRESHOLD_US,
        "RUST_LOG",
    ];

    fn clear_env() {
        for key in KEYS {
            env::remove_var(key);
        }
    }

    #[test]
    #[serial]
    fn invalid_directive_is_rejected() {
        clear_env();
        let config = TracingConfig {
            directives: Some("=::invalid".to_string()),
            ..TracingConfig::default()
        };
        assert!(matches!(build_subscriber(&config), Err(TracingSetupError::InvalidFilter(_))));
    }

    #[test]
    #[serial]
    fn every_output_format_builds() {
        clear_env();
        for output in [TracingOutput::Compact, TracingOutput::Pretty, TracingOutput::Json] {
            let config = TracingConfig {
                output,
                ..TracingConfig::default()
            };
            assert!(build_subscriber(&config).is_ok(), "{output:?}");
        }
    }

    #[test]
    fn profiles_parse_case_insensitively() {
        assert_eq!("CI".parse::<TracingProfile>().unwrap(), TracingProfile::Ci);
        assert_eq!(" perf ".parse::<TracingProfile>().unwrap(), TracingProfile::Performance);
        assert!(matches!(
            "verbose".parse::<TracingProfile>(),
            Err(TracingSetupError::UnknownProfile(name)) if name == "verbose"
        ));
        assert!(matches!("xml".parse::<TracingOutput>(), Err(TracingSetupError::UnknownFormat(_))));
    }

    #[test]
    #[serial]
    fn environment_overrides_the_profile() {
        clear_env();
        env::set_var(ENV_PROFILE, "ci");
        env::set_var(ENV_FORMAT, "compact");
        env::set_var(ENV_DIRECTIVES, "pim_driver=trace");
        let config = TracingConfig::from_env();
        clear_env();

        assert_eq!(config.directives.as_deref(), Some("pim_driver=trace"));
        assert_eq!(config.output, TracingOutput::Compact);
        assert!(!config.ansi);
        assert!(config.include_thread_names);
    }

    #[test]
    #[serial]
    fn environment_sets_performance_options() {
        clear_env();
        env::set_var(ENV_PERF_TRACING, "yes");
        env::set_var(ENV_PERF_THRESHOLD_US, " 250 ");
        let config = TracingConfig::from_env();
        clear_env();

        assert!(config.performance_spans);
        assert_eq!(config.performance_threshold_us, Some(250));
    }

    #[test]
    #[serial]
    fn json_from_environment_disables_ansi() {
        clear_env();
        env::set_var(ENV_FORMAT, "JSON");
        let config = TracingConfig::from_env();
        clear_env();

        assert_eq!(config.output, TracingOutput::Json);
        assert!(!config.ansi);
    }

    #[test]
    #[serial]
    fn unknown_values_fall_back_to_local() {
        clear_env();
        env::set_var(ENV_PROFILE, "nonsense");
        env::set_var(ENV_PERF_THRESHOLD_US, "soon");
        let config = TracingConfig::from_env();
        clear_env();

        assert_eq!(config.output, TracingOutput::Pretty);
        assert_eq!(config.performance_threshold_us, None);
    }

    #[test]
    fn performance_profile_targets_pim_crates() {
        let config = TracingConfig::for_performance();
        assert!(config.performance_spans);
        assert_eq!(config.span_events, FmtSpan::CLOSE);
        let directives = config.directives.unwrap_or_default();
        assert!(directives.contains("pim_host") && directives.contains("pim_driver"));
    }
}
