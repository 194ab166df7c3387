//! Worker configuration loaded from environment variables.
//!
//! All parsing goes through [`WorkerConfig::from_lookup`] so tests can
//! supply a map instead of mutating the process environment.
//!
//! | Env Var                          | Required        | Default                  |
//! |----------------------------------|-----------------|--------------------------|
//! | `PORTAL_USERNAME`                | yes             | --                       |
//! | `PORTAL_PASSWORD`                | yes             | --                       |
//! | `PORTAL_BASE_URL`                | no              | `https://portal.cfx.re`  |
//! | `BASE_ASSET_NAME`                | no              | `Asset`                  |
//! | `WEBDRIVER_URL`                  | no              | `http://localhost:4444`  |
//! | `BROWSER_HEADLESS`               | no              | `true`                   |
//! | `PROXY_SERVER`                   | no              | --                       |
//! | `PROXY_USERNAME`/`PROXY_PASSWORD`| no              | --                       |
//! | `INPUT_PREFIX`                   | no              | `unprocessed/`           |
//! | `OUTPUT_PREFIX`                  | no              | `processed/`             |
//! | `OUTPUT_BUCKET`                  | no              | source bucket            |
//! | `WORKER_MODE`                    | no              | `queue`                  |
//! | `QUEUE_URL`                      | queue mode      | --                       |
//! | `EVENT_FILE`                     | once mode       | --                       |
//! | `QUEUE_WAIT_SECS`                | no              | `20`                     |
//! | `QUEUE_BATCH_SIZE`               | no              | `10`                     |
//! | `QUEUE_VISIBILITY_TIMEOUT_SECS`  | no              | `900`                    |
//! | `MAX_CONCURRENT_JOBS`            | no              | `1`                      |
//! | `RETRY_DELAYS_SECS`              | no              | `0,1,2,4`                |
//! | `SESSION_RESTART_THRESHOLD`      | no              | `25`                     |
//! | `SESSION_PROBE_TIMEOUT_SECS`     | no              | `5`                      |
//! | `CAPTURE_FAILURE_ARTIFACTS`      | no              | `true`                   |
//! | `DIAGNOSTICS_BUCKET`             | no              | output bucket            |
//! | `DIAGNOSTICS_PREFIX`             | no              | `debug/`                 |
//! | `NOTIFY_WEBHOOK_URL`             | no              | --                       |
//! | `WORK_DIR`                       | no              | OS temp dir              |

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::CoreError;
use crate::retry::{RetryPolicy, DEFAULT_RETRY_DELAYS_SECS};
use crate::routing::{RoutingRules, DEFAULT_INPUT_PREFIX, DEFAULT_OUTPUT_PREFIX};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Largest batch a single SQS receive may return.
pub const QUEUE_MAX_BATCH: u32 = 10;

/// Longest long-poll wait SQS accepts.
pub const QUEUE_MAX_WAIT_SECS: u64 = 20;

pub const DEFAULT_VISIBILITY_TIMEOUT_SECS: u64 = 900;
pub const DEFAULT_RESTART_THRESHOLD: u64 = 25;
pub const DEFAULT_PROBE_TIMEOUT_SECS: u64 = 5;
pub const DEFAULT_PORTAL_BASE_URL: &str = "https://portal.cfx.re";
pub const DEFAULT_WEBDRIVER_URL: &str = "http://localhost:4444";
pub const DEFAULT_BASE_ASSET_NAME: &str = "Asset";
pub const DEFAULT_DIAGNOSTICS_PREFIX: &str = "debug/";

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerMode {
    /// Long-poll a queue until shut down.
    Queue,
    /// Dispatch a single event file and exit.
    Once,
}

/// Credentials and naming for the remote asset portal.
#[derive(Clone)]
pub struct PortalConfig {
    pub base_url: String,
    pub username: String,
    pub password: String,
    pub base_asset_name: String,
}

impl std::fmt::Debug for PortalConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortalConfig")
            .field("base_url", &self.base_url)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("base_asset_name", &self.base_asset_name)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    pub server: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// How to reach and launch the automation browser.
#[derive(Debug, Clone)]
pub struct BrowserConfig {
    pub webdriver_url: String,
    pub headless: bool,
    pub proxy: Option<ProxyConfig>,
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub queue_url: String,
    /// Long-poll wait (W).
    pub wait: Duration,
    pub batch_size: u32,
    /// Visibility timeout (V). Must exceed worst-case job latency.
    pub visibility_timeout: Duration,
}

/// Failure screenshot/page capture settings.
#[derive(Debug, Clone)]
pub struct DiagnosticsConfig {
    pub enabled: bool,
    /// `None` means "the job's output bucket".
    pub bucket: Option<String>,
    pub prefix: String,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bucket: None,
            prefix: DEFAULT_DIAGNOSTICS_PREFIX.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// WorkerConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub mode: WorkerMode,
    pub portal: PortalConfig,
    pub browser: BrowserConfig,
    pub routing: RoutingRules,
    /// Present iff `mode` is [`WorkerMode::Queue`].
    pub queue: Option<QueueConfig>,
    /// Present iff `mode` is [`WorkerMode::Once`].
    pub event_file: Option<PathBuf>,
    pub max_concurrent_jobs: usize,
    pub retry: RetryPolicy,
    pub restart_threshold: u64,
    pub probe_timeout: Duration,
    pub diagnostics: DiagnosticsConfig,
    pub notify_webhook_url: Option<String>,
    pub work_dir: PathBuf,
}

impl WorkerConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, CoreError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration from an arbitrary variable lookup.
    ///
    /// Empty values are treated as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, CoreError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let portal = PortalConfig {
            base_url: get("PORTAL_BASE_URL")
                .unwrap_or_else(|| DEFAULT_PORTAL_BASE_URL.into())
                .trim_end_matches('/')
                .to_string(),
            username: required(&get, "PORTAL_USERNAME")?,
            password: required(&get, "PORTAL_PASSWORD")?,
            base_asset_name: get("BASE_ASSET_NAME")
                .unwrap_or_else(|| DEFAULT_BASE_ASSET_NAME.into()),
        };

        let proxy = get("PROXY_SERVER").map(|server| ProxyConfig {
            server,
            username: get("PROXY_USERNAME"),
            password: get("PROXY_PASSWORD"),
        });

        let browser = BrowserConfig {
            webdriver_url: get("WEBDRIVER_URL")
                .unwrap_or_else(|| DEFAULT_WEBDRIVER_URL.into())
                .trim_end_matches('/')
                .to_string(),
            headless: parse_bool(&get, "BROWSER_HEADLESS", true)?,
            proxy,
        };

        let routing = RoutingRules {
            input_prefix: lookup("INPUT_PREFIX").unwrap_or_else(|| DEFAULT_INPUT_PREFIX.into()),
            output_prefix: lookup("OUTPUT_PREFIX")
                .unwrap_or_else(|| DEFAULT_OUTPUT_PREFIX.into()),
            output_bucket: get("OUTPUT_BUCKET"),
        };

        let mode = match get("WORKER_MODE").as_deref() {
            None | Some("queue") => WorkerMode::Queue,
            Some("once") => WorkerMode::Once,
            Some(other) => {
                return Err(CoreError::Configuration(format!(
                    "WORKER_MODE must be 'queue' or 'once', got '{other}'"
                )))
            }
        };

        let (queue, event_file) = match mode {
            WorkerMode::Queue => {
                let wait_secs: u64 = parse_or(&get, "QUEUE_WAIT_SECS", QUEUE_MAX_WAIT_SECS)?;
                let batch_size: u32 = parse_or(&get, "QUEUE_BATCH_SIZE", QUEUE_MAX_BATCH)?;
                let visibility_secs: u64 = parse_or(
                    &get,
                    "QUEUE_VISIBILITY_TIMEOUT_SECS",
                    DEFAULT_VISIBILITY_TIMEOUT_SECS,
                )?;
                let queue = QueueConfig {
                    queue_url: required(&get, "QUEUE_URL")?,
                    wait: Duration::from_secs(wait_secs.min(QUEUE_MAX_WAIT_SECS)),
                    batch_size: batch_size.clamp(1, QUEUE_MAX_BATCH),
                    visibility_timeout: Duration::from_secs(visibility_secs),
                };
                (Some(queue), None)
            }
            WorkerMode::Once => (None, Some(PathBuf::from(required(&get, "EVENT_FILE")?))),
        };

        let max_concurrent_jobs: usize = parse_or(&get, "MAX_CONCURRENT_JOBS", 1)?;
        if max_concurrent_jobs == 0 {
            return Err(CoreError::Configuration(
                "MAX_CONCURRENT_JOBS must be at least 1".into(),
            ));
        }

        let retry = match get("RETRY_DELAYS_SECS") {
            Some(raw) => RetryPolicy::from_secs(&parse_delay_list(&raw)?),
            None => RetryPolicy::from_secs(&DEFAULT_RETRY_DELAYS_SECS),
        };

        let diagnostics = DiagnosticsConfig {
            enabled: parse_bool(&get, "CAPTURE_FAILURE_ARTIFACTS", true)?,
            bucket: get("DIAGNOSTICS_BUCKET"),
            prefix: lookup("DIAGNOSTICS_PREFIX")
                .unwrap_or_else(|| DEFAULT_DIAGNOSTICS_PREFIX.into()),
        };

        Ok(Self {
            mode,
            portal,
            browser,
            routing,
            queue,
            event_file,
            max_concurrent_jobs,
            retry,
            restart_threshold: parse_or(&get, "SESSION_RESTART_THRESHOLD", DEFAULT_RESTART_THRESHOLD)?,
            probe_timeout: Duration::from_secs(parse_or(
                &get,
                "SESSION_PROBE_TIMEOUT_SECS",
                DEFAULT_PROBE_TIMEOUT_SECS,
            )?),
            diagnostics,
            notify_webhook_url: get("NOTIFY_WEBHOOK_URL"),
            work_dir: get("WORK_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(std::env::temp_dir),
        })
    }
}

// ---- private helpers ----

fn required<G>(get: &G, name: &str) -> Result<String, CoreError>
where
    G: Fn(&str) -> Option<String>,
{
    get(name).ok_or_else(|| CoreError::Configuration(format!("{name} must be set")))
}

fn parse_or<G, T>(get: &G, name: &str, default: T) -> Result<T, CoreError>
where
    G: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match get(name) {
        Some(raw) => raw.trim().parse().map_err(|_| {
            CoreError::Configuration(format!("{name} has an invalid value: '{raw}'"))
        }),
        None => Ok(default),
    }
}

fn parse_bool<G>(get: &G, name: &str, default: bool) -> Result<bool, CoreError>
where
    G: Fn(&str) -> Option<String>,
{
    match get(name).map(|v| v.trim().to_ascii_lowercase()).as_deref() {
        None => Ok(default),
        Some("1" | "true" | "yes" | "on") => Ok(true),
        Some("0" | "false" | "no" | "off") => Ok(false),
        Some(other) => Err(CoreError::Configuration(format!(
            "{name} must be a boolean, got '{other}'"
        ))),
    }
}

/// Parse a comma-separated list of whole seconds, e.g. `0,1,2,4`.
fn parse_delay_list(raw: &str) -> Result<Vec<u64>, CoreError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<u64>().map_err(|_| {
                CoreError::Configuration(format!("RETRY_DELAYS_SECS has an invalid entry: '{s}'"))
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use assert_matches::assert_matches;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> Result<WorkerConfig, CoreError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        WorkerConfig::from_lookup(|name| map.get(name).cloned())
    }

    const BASE: &[(&str, &str)] = &[
        ("PORTAL_USERNAME", "user"),
        ("PORTAL_PASSWORD", "secret"),
        ("QUEUE_URL", "https://sqs.eu-west-1.amazonaws.com/123/jobs"),
    ];

    #[test]
    fn defaults_apply_in_queue_mode() {
        let config = load(BASE).expect("config should load");
        assert_eq!(config.mode, WorkerMode::Queue);
        assert_eq!(config.max_concurrent_jobs, 1);
        assert_eq!(config.retry, RetryPolicy::default());
        assert_eq!(config.restart_threshold, DEFAULT_RESTART_THRESHOLD);
        assert_eq!(config.probe_timeout, Duration::from_secs(5));
        assert_eq!(config.routing.input_prefix, "unprocessed/");
        assert_eq!(config.routing.output_prefix, "processed/");
        assert!(config.diagnostics.enabled);

        let queue = config.queue.expect("queue config in queue mode");
        assert_eq!(queue.wait, Duration::from_secs(20));
        assert_eq!(queue.batch_size, 10);
        assert_eq!(queue.visibility_timeout, Duration::from_secs(900));
    }

    #[test]
    fn missing_queue_url_is_a_configuration_error() {
        let result = load(&[("PORTAL_USERNAME", "u"), ("PORTAL_PASSWORD", "p")]);
        assert_matches!(result, Err(CoreError::Configuration(msg)) if msg.contains("QUEUE_URL"));
    }

    #[test]
    fn missing_credentials_are_a_configuration_error() {
        let result = load(&[("QUEUE_URL", "q"), ("PORTAL_USERNAME", "u")]);
        assert_matches!(result, Err(CoreError::Configuration(msg)) if msg.contains("PORTAL_PASSWORD"));
    }

    #[test]
    fn once_mode_requires_event_file_not_queue() {
        let config = load(&[
            ("PORTAL_USERNAME", "u"),
            ("PORTAL_PASSWORD", "p"),
            ("WORKER_MODE", "once"),
            ("EVENT_FILE", "/tmp/event.json"),
        ])
        .expect("config should load");
        assert_eq!(config.mode, WorkerMode::Once);
        assert!(config.queue.is_none());
        assert_eq!(config.event_file, Some(PathBuf::from("/tmp/event.json")));
    }

    #[test]
    fn queue_settings_are_clamped_to_transport_limits() {
        let mut vars = BASE.to_vec();
        vars.push(("QUEUE_WAIT_SECS", "60"));
        vars.push(("QUEUE_BATCH_SIZE", "50"));
        let queue = load(&vars).unwrap().queue.unwrap();
        assert_eq!(queue.wait, Duration::from_secs(QUEUE_MAX_WAIT_SECS));
        assert_eq!(queue.batch_size, QUEUE_MAX_BATCH);
    }

    #[test]
    fn custom_retry_schedule_is_parsed() {
        let mut vars = BASE.to_vec();
        vars.push(("RETRY_DELAYS_SECS", "0, 5, 10"));
        let config = load(&vars).unwrap();
        assert_eq!(config.retry, RetryPolicy::from_secs(&[0, 5, 10]));
    }

    #[test]
    fn invalid_number_is_rejected() {
        let mut vars = BASE.to_vec();
        vars.push(("SESSION_RESTART_THRESHOLD", "lots"));
        assert_matches!(load(&vars), Err(CoreError::Configuration(_)));
    }

    #[test]
    fn zero_gate_width_is_rejected() {
        let mut vars = BASE.to_vec();
        vars.push(("MAX_CONCURRENT_JOBS", "0"));
        assert_matches!(load(&vars), Err(CoreError::Configuration(_)));
    }

    #[test]
    fn empty_input_prefix_is_preserved() {
        let mut vars = BASE.to_vec();
        vars.push(("INPUT_PREFIX", ""));
        assert_eq!(load(&vars).unwrap().routing.input_prefix, "");
    }

    #[test]
    fn proxy_credentials_are_optional() {
        let mut vars = BASE.to_vec();
        vars.push(("PROXY_SERVER", "http://proxy:8080"));
        let proxy = load(&vars).unwrap().browser.proxy.unwrap();
        assert_eq!(proxy.server, "http://proxy:8080");
        assert!(proxy.username.is_none());
    }

    #[test]
    fn password_is_redacted_in_debug_output() {
        let config = load(BASE).unwrap();
        assert!(!format!("{:?}", config.portal).contains("secret"));
    }
}
