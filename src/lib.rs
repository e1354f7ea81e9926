pub mod capture;
pub mod overlay;
pub mod pipeline;
pub mod supervisor;
pub mod utils;

use std::fmt;
use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub use capture::{Frame, Geometry};

/// Prefix for environment overrides, e.g. `AIRPLAY_MATRIX_MODEL_NAME`
pub const ENV_PREFIX: &str = "AIRPLAY_MATRIX";

pub const MIN_FPS: u32 = 5;
pub const MAX_FPS: u32 = 60;

/// Run configuration, immutable once loaded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    pub enabled: bool,
    pub airplay_name: String,
    pub model_name: String,
    pub fps: u32,
    pub flip_x: bool,
    pub flip_y: bool,
    pub uxplay_extra_args: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enabled: true,
            airplay_name: "FPP AirPlay Matrix".into(),
            model_name: "Matrix".into(),
            fps: 20,
            flip_x: false,
            flip_y: false,
            uxplay_extra_args: String::new(),
        }
    }
}

impl Config {
    /// Load the plugin's JSON settings, layered under environment overrides.
    ///
    /// Never fails: a missing or unreadable file yields the defaults, and any
    /// field that is absent or of the wrong type keeps its default.
    pub fn load(path: &Path) -> Self {
        if !path.exists() {
            info!("Config not found at {}, using defaults", path.display());
        }

        let source = config::Config::builder()
            .add_source(
                config::File::from(path)
                    .format(config::FileFormat::Json)
                    .required(false),
            )
            .add_source(config::Environment::with_prefix(ENV_PREFIX))
            .build();

        match source {
            Ok(source) => Self::from_source(&source),
            Err(e) => {
                warn!("Failed reading config {}: {}; using defaults", path.display(), e);
                Self::default()
            }
        }
    }

    /// Pick each field out of `source`, falling back per field.
    pub fn from_source(source: &config::Config) -> Self {
        let defaults = Self::default();

        let fps = lenient(source.get_int("fps"), "fps")
            .map(|fps| fps.clamp(i64::from(MIN_FPS), i64::from(MAX_FPS)) as u32)
            .unwrap_or(defaults.fps);

        Self {
            enabled: lenient(source.get_bool("enabled"), "enabled").unwrap_or(defaults.enabled),
            airplay_name: lenient(source.get_string("airplay_name"), "airplay_name")
                .unwrap_or(defaults.airplay_name),
            model_name: lenient(source.get_string("model_name"), "model_name")
                .unwrap_or(defaults.model_name),
            fps,
            flip_x: lenient(source.get_bool("flip_x"), "flip_x").unwrap_or(defaults.flip_x),
            flip_y: lenient(source.get_bool("flip_y"), "flip_y").unwrap_or(defaults.flip_y),
            uxplay_extra_args: lenient(source.get_string("uxplay_extra_args"), "uxplay_extra_args")
                .unwrap_or(defaults.uxplay_extra_args),
        }
    }
}

fn lenient<T>(value: Result<T, config::ConfigError>, key: &str) -> Option<T> {
    match value {
        Ok(v) => Some(v),
        Err(config::ConfigError::NotFound(_)) => None,
        Err(e) => {
            debug!("Ignoring config field {}: {}", key, e);
            None
        }
    }
}

/// Process-wide cooperative cancellation flag.
///
/// Cloned into the signal task, which sets it; every retry loop and the
/// supervisor's main loop poll it.
#[derive(Debug, Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Bounded fixed-delay retry budget
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    /// Control API preparation: 30 tries, one second apart
    pub const NEGOTIATION: Self = Self {
        attempts: 30,
        delay: Duration::from_secs(1),
    };

    /// Overlay buffer mapping: 40 tries, 250ms apart
    pub const BUFFER_OPEN: Self = Self {
        attempts: 40,
        delay: Duration::from_millis(250),
    };
}

#[derive(Debug)]
pub enum RetryError<E> {
    /// The stop flag was raised before the budget ran out
    Interrupted,
    Exhausted { attempts: u32, last: E },
}

/// Run `attempt` until it succeeds, the budget is spent, or `stop` is raised.
///
/// The stop flag is checked before every attempt; `policy.delay` separates
/// consecutive attempts. A zero-attempt policy still makes one attempt, so
/// running out of budget always reports the error that caused it.
pub async fn retry<T, E, F, Fut>(
    policy: RetryPolicy,
    stop: &StopFlag,
    mut attempt: F,
) -> Result<T, RetryError<E>>
where
    E: fmt::Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let attempts = policy.attempts.max(1);
    let mut n = 1;
    loop {
        if stop.is_set() {
            return Err(RetryError::Interrupted);
        }

        match attempt(n).await {
            Ok(value) => return Ok(value),
            Err(last) if n >= attempts => {
                debug!("Attempt {}/{} failed: {}", n, attempts, last);
                return Err(RetryError::Exhausted { attempts, last });
            }
            Err(e) => debug!("Attempt {}/{} failed: {}", n, attempts, e),
        }

        n += 1;
        tokio::time::sleep(policy.delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::io::Write;

    fn load_json(json: &str) -> Config {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        file.write_all(json.as_bytes()).unwrap();
        Config::load(file.path())
    }

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config::load(&dir.path().join("nope.json"));
        assert_eq!(cfg, Config::default());
    }

    #[test]
    fn fields_are_read_from_json() {
        let cfg = load_json(
            r#"{"enabled": false, "airplay_name": "Porch", "model_name": "Tree/Top",
                "fps": 30, "flip_x": true, "flip_y": false, "uxplay_extra_args": "-fps 30"}"#,
        );
        assert!(!cfg.enabled);
        assert_eq!(cfg.airplay_name, "Porch");
        assert_eq!(cfg.model_name, "Tree/Top");
        assert_eq!(cfg.fps, 30);
        assert!(cfg.flip_x);
        assert!(!cfg.flip_y);
        assert_eq!(cfg.uxplay_extra_args, "-fps 30");
    }

    #[test]
    fn fps_is_clamped() {
        assert_eq!(load_json(r#"{"fps": 1}"#).fps, MIN_FPS);
        assert_eq!(load_json(r#"{"fps": 240}"#).fps, MAX_FPS);
    }

    #[test]
    fn malformed_field_falls_back_to_default() {
        let cfg = load_json(r#"{"fps": "fast", "model_name": "Grid"}"#);
        assert_eq!(cfg.fps, 20);
        assert_eq!(cfg.model_name, "Grid");
    }

    #[test]
    fn unparsable_file_gives_defaults() {
        assert_eq!(load_json("{not json"), Config::default());
    }

    #[tokio::test(start_paused = true)]
    async fn retry_stops_at_first_success() {
        let calls = Cell::new(0);
        let out = retry(RetryPolicy::BUFFER_OPEN, &StopFlag::new(), |n| {
            calls.set(calls.get() + 1);
            async move {
                if n < 3 {
                    Err("not yet")
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert!(matches!(out, Ok(3)));
        assert_eq!(calls.get(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_exhausts_budget_with_last_error() {
        let start = tokio::time::Instant::now();
        let out: Result<(), _> = retry(RetryPolicy::NEGOTIATION, &StopFlag::new(), |n| async move {
            Err(format!("failure {}", n))
        })
        .await;
        match out {
            Err(RetryError::Exhausted { attempts, last }) => {
                assert_eq!(attempts, 30);
                assert_eq!(last, "failure 30");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(start.elapsed() >= Duration::from_secs(29));
        assert!(start.elapsed() < Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_aborts_when_stopped() {
        let stop = StopFlag::new();
        let calls = Cell::new(0);
        let out: Result<(), _> = retry(RetryPolicy::NEGOTIATION, &stop, |_| {
            calls.set(calls.get() + 1);
            stop.set();
            async { Err("down") }
        })
        .await;
        assert!(matches!(out, Err(RetryError::Interrupted)));
        assert_eq!(calls.get(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_attempt_policy_still_tries_once() {
        let calls = Cell::new(0);
        let policy = RetryPolicy {
            attempts: 0,
            delay: Duration::from_secs(1),
        };
        let out: Result<(), _> = retry(policy, &StopFlag::new(), |_| {
            calls.set(calls.get() + 1);
            async { Err("down") }
        })
        .await;
        assert!(matches!(out, Err(RetryError::Exhausted { attempts: 1, last: "down" })));
        assert_eq!(calls.get(), 1);
    }
}
