use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::ConfigError;
use crate::state::Timings;
use crate::trigger::{
    AnyPolicy, IntervalPolicy, ManualPolicy, RotatingSelector, SourceSelector, StaticSelector,
    SwapTrigger,
};

pub const DEFAULT_SOURCE: &str = "rtsp://127.0.0.1:8555/test";
pub const DEFAULT_NEXT_SOURCE: &str = "rtsp://127.0.0.1:8555/new_source";
pub const DEFAULT_SINK_LOCATION: &str = "rtsp://127.0.0.1:8555/live";
pub const DEFAULT_SINK_HOST: &str = "127.0.0.1";
pub const DEFAULT_SINK_PORT: u16 = 1234;

const SOURCE_SCHEMES: &[&str] = &[
    "rtsp", "rtsps", "rtspt", "srt", "udp", "file", "http", "https",
];
const SINK_SCHEMES: &[&str] = &["rtsp", "rtsps", "rtspt"];

/// Where the relay publishes its output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    /// Publish to an RTSP server (rtspclientsink)
    #[default]
    Rtsp,
    /// Send MPEG-TS over UDP (mpegtsmux ! udpsink)
    Udp,
}

impl fmt::Display for SinkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rtsp => f.write_str("rtsp"),
            Self::Udp => f.write_str("udp"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct SinkConfig {
    pub kind: SinkKind,
    /// Publish location, for `rtsp`.
    pub location: String,
    /// Destination, for `udp`.
    pub host: String,
    pub port: u16,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            kind: SinkKind::Rtsp,
            location: DEFAULT_SINK_LOCATION.to_string(),
            host: DEFAULT_SINK_HOST.to_string(),
            port: DEFAULT_SINK_PORT,
        }
    }
}

/// Trigger interval and protocol deadlines.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct SwapConfig {
    pub interval_secs: u64,
    pub drain_timeout_ms: u64,
    pub relink_timeout_ms: u64,
    pub retry_backoff_ms: u64,
    pub max_relink_attempts: u32,
}

impl Default for SwapConfig {
    fn default() -> Self {
        let timings = Timings::default();
        Self {
            interval_secs: 30,
            drain_timeout_ms: millis(timings.drain_timeout),
            relink_timeout_ms: millis(timings.relink_timeout),
            retry_backoff_ms: millis(timings.retry_backoff),
            max_relink_attempts: timings.max_relink_attempts,
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl SwapConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timings(&self) -> Timings {
        Timings {
            drain_timeout: Duration::from_millis(self.drain_timeout_ms),
            relink_timeout: Duration::from_millis(self.relink_timeout_ms),
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
            max_relink_attempts: self.max_relink_attempts,
        }
    }
}

/**
    Everything the relay needs at startup.

    Compiled-in defaults reproduce the stock setup: pull
    `rtsp://127.0.0.1:8555/test`, swap to `.../new_source` every 30 seconds,
    publish to `rtsp://127.0.0.1:8555/live`. A YAML file may override any
    field; command-line flags override the file.
*/
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct RelayConfig {
    pub source: String,
    /// Replacement locators, used in rotation.
    pub next_sources: Vec<String>,
    /// Jitter buffer of source nodes, in milliseconds.
    pub source_latency: u32,
    pub sink: SinkConfig,
    pub swap: SwapConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            source: DEFAULT_SOURCE.to_string(),
            next_sources: vec![DEFAULT_NEXT_SOURCE.to_string()],
            source_latency: 0,
            sink: SinkConfig::default(),
            swap: SwapConfig::default(),
        }
    }
}

impl RelayConfig {
    /// Defaults, overlaid with `path` when given.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::from_yaml(&std::fs::read_to_string(path)?),
            None => Ok(Self::default()),
        }
    }

    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_locator(&self.source, SOURCE_SCHEMES)?;
        if self.next_sources.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one next source is required".to_string(),
            ));
        }
        for uri in &self.next_sources {
            validate_locator(uri, SOURCE_SCHEMES)?;
        }
        match self.sink.kind {
            SinkKind::Rtsp => {
                validate_locator(&self.sink.location, SINK_SCHEMES)?;
            }
            SinkKind::Udp => {
                if self.sink.host.trim().is_empty() {
                    return Err(ConfigError::Invalid("sink host is empty".to_string()));
                }
                if self.sink.port == 0 {
                    return Err(ConfigError::Invalid("sink port must be non-zero".to_string()));
                }
            }
        }
        if self.swap.interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "swap interval must be at least one second".to_string(),
            ));
        }
        if self.swap.max_relink_attempts == 0 {
            return Err(ConfigError::Invalid(
                "max_relink_attempts must be at least 1".to_string(),
            ));
        }
        if self.swap.drain_timeout_ms == 0 || self.swap.relink_timeout_ms == 0 {
            return Err(ConfigError::Invalid("timeouts must be non-zero".to_string()));
        }
        Ok(())
    }

    /**
        Interval policy, plus swaps on demand through `requests`, with a
        static or rotating selector.
    */
    pub fn trigger(&self, requests: Arc<ManualPolicy>) -> SwapTrigger {
        let selector: Arc<dyn SourceSelector> = match self.next_sources.as_slice() {
            [only] => Arc::new(StaticSelector::new(only.clone())),
            _ => match RotatingSelector::new(self.next_sources.clone()) {
                Some(rotating) => Arc::new(rotating),
                None => Arc::new(StaticSelector::new(self.source.clone())),
            },
        };
        let policy = AnyPolicy::new(vec![
            Arc::new(IntervalPolicy::new(self.swap.interval())),
            requests,
        ]);
        SwapTrigger::new(Arc::new(policy), selector)
    }
}

/// Parse `uri` and check its scheme against `schemes`.
pub fn validate_locator(uri: &str, schemes: &[&str]) -> Result<Url, ConfigError> {
    let url = Url::parse(uri).map_err(|e| ConfigError::Locator {
        uri: uri.to_string(),
        reason: e.to_string(),
    })?;
    if !schemes.contains(&url.scheme()) {
        return Err(ConfigError::Locator {
            uri: uri.to_string(),
            reason: format!("scheme '{}' is not one of {}", url.scheme(), schemes.join(", ")),
        });
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::state::SwapPhase;
    use crate::trigger::TriggerContext;

    #[test]
    fn defaults_are_valid() {
        let config = RelayConfig::default();
        config.validate().unwrap();
        assert_eq!(config.swap.interval(), Duration::from_secs(30));
        assert_eq!(config.swap.timings(), Timings::default());
    }

    #[test]
    fn file_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "source: rtsp://cam1/stream\n\
             sink:\n  kind: udp\n  port: 5000\n\
             swap:\n  interval_secs: 10\n"
        )
        .unwrap();

        let config = RelayConfig::load(Some(file.path())).unwrap();
        config.validate().unwrap();
        assert_eq!(config.source, "rtsp://cam1/stream");
        assert_eq!(config.sink.kind, SinkKind::Udp);
        assert_eq!(config.sink.port, 5000);
        assert_eq!(config.sink.host, DEFAULT_SINK_HOST);
        assert_eq!(config.swap.interval_secs, 10);
        assert_eq!(config.swap.drain_timeout_ms, 5000);
        assert_eq!(config.next_sources, vec![DEFAULT_NEXT_SOURCE.to_string()]);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(matches!(
            RelayConfig::from_yaml("sorce: rtsp://x/y\n"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.yaml");
        assert!(matches!(
            RelayConfig::load(Some(&missing)),
            Err(ConfigError::Io(_))
        ));
    }

    #[test]
    fn bad_locators_fail_validation() {
        let mut config = RelayConfig::default();
        config.source = "not a url".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::Locator { .. })));

        let mut config = RelayConfig::default();
        config.next_sources = vec!["gopher://old/net".to_string()];
        assert!(matches!(config.validate(), Err(ConfigError::Locator { .. })));

        let mut config = RelayConfig::default();
        config.sink.location = "udp://127.0.0.1:1234".to_string();
        assert!(config.validate().is_err());

        let mut config = RelayConfig::default();
        config.next_sources.clear();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn yaml_round_trip_keeps_values() {
        let mut config = RelayConfig::default();
        config.sink.kind = SinkKind::Udp;
        config.swap.max_relink_attempts = 5;
        let text = config.to_yaml().unwrap();
        assert_eq!(RelayConfig::from_yaml(&text).unwrap(), config);
    }

    #[test]
    fn several_next_sources_rotate() {
        let mut config = RelayConfig::default();
        config.next_sources = vec!["rtsp://b/x".into(), "rtsp://c/x".into()];
        let trigger = config.trigger(Arc::new(ManualPolicy::new()));
        let ctx = TriggerContext {
            elapsed: Duration::from_secs(31),
            phase: SwapPhase::Steady,
            pending_swap: false,
            current_source: "rtsp://b/x",
            swaps_completed: 1,
        };
        assert_eq!(trigger.evaluate(&ctx).as_deref(), Some("rtsp://c/x"));
    }

    #[test]
    fn requested_swap_fires_before_interval() {
        let config = RelayConfig::default();
        let requests = Arc::new(ManualPolicy::new());
        let trigger = config.trigger(Arc::clone(&requests));
        let ctx = TriggerContext {
            elapsed: Duration::from_secs(1),
            phase: SwapPhase::Steady,
            pending_swap: false,
            current_source: DEFAULT_SOURCE,
            swaps_completed: 0,
        };
        assert_eq!(trigger.evaluate(&ctx), None);
        requests.request();
        assert_eq!(trigger.evaluate(&ctx).as_deref(), Some(DEFAULT_NEXT_SOURCE));
        assert_eq!(trigger.evaluate(&ctx), None);
    }
}
