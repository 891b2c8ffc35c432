use std::path::PathBuf;
use std::time::Duration;

use crate::backwalk::BackwalkPolicy;
use crate::dispatch::ProbeDispatcher;

pub const DEFAULT_MAX_IN_FLIGHT: usize = 100;
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_MAX_SERVERS: usize = 400;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub log_filter: String,
    pub max_in_flight: usize,
    pub request_timeout_ms: u64,
    /// Per-probe budget for the dispatcher; `None` uses `request_timeout_ms`.
    pub probe_timeout_ms: Option<u64>,
    pub max_servers: usize,
    pub snapshot_interval_ms: u64,
    pub backoff_threshold_ms: u64,
    pub max_page_retries: u32,
    pub retry_base_ms: u64,
    pub max_backoff_ms: u64,
    pub homeserver_url: Option<String>,
    pub access_token: Option<String>,
    /// Server name the signed federation requests claim to come from.
    pub origin_server: Option<String>,
    /// Synapse-format ed25519 key of `origin_server`.
    pub signing_key_path: Option<PathBuf>,
    pub metrics_dump: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_filter: "warn,fedprobe=info,fedprobe_core=info".into(),
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            probe_timeout_ms: None,
            max_servers: DEFAULT_MAX_SERVERS,
            snapshot_interval_ms: 5_000,
            backoff_threshold_ms: 1_000,
            max_page_retries: 5,
            retry_base_ms: 500,
            max_backoff_ms: 30_000,
            homeserver_url: None,
            access_token: None,
            origin_server: None,
            signing_key_path: None,
            metrics_dump: false,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

impl AppConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let log_filter = std::env::var("RUST_LOG").unwrap_or(defaults.log_filter);
        let max_in_flight = env_parse("FEDPROBE_MAX_IN_FLIGHT")
            .filter(|v: &usize| *v > 0)
            .unwrap_or(defaults.max_in_flight);
        let request_timeout_ms = env_parse("FEDPROBE_REQUEST_TIMEOUT_MS")
            .filter(|v: &u64| *v > 0)
            .unwrap_or(defaults.request_timeout_ms);
        let probe_timeout_ms =
            env_parse("FEDPROBE_PROBE_TIMEOUT_MS").filter(|v: &u64| *v > 0);
        let max_servers = env_parse("FEDPROBE_MAX_SERVERS").unwrap_or(defaults.max_servers);
        let snapshot_interval_ms = env_parse("FEDPROBE_SNAPSHOT_INTERVAL_MS")
            .filter(|v: &u64| *v > 0)
            .unwrap_or(defaults.snapshot_interval_ms);
        let backoff_threshold_ms =
            env_parse("FEDPROBE_BACKOFF_THRESHOLD_MS").unwrap_or(defaults.backoff_threshold_ms);
        let max_page_retries =
            env_parse("FEDPROBE_MAX_PAGE_RETRIES").unwrap_or(defaults.max_page_retries);
        let retry_base_ms = env_parse("FEDPROBE_RETRY_BASE_MS").unwrap_or(defaults.retry_base_ms);
        let max_backoff_ms =
            env_parse("FEDPROBE_MAX_BACKOFF_MS").unwrap_or(defaults.max_backoff_ms);
        let homeserver_url = std::env::var("FEDPROBE_HOMESERVER_URL")
            .ok()
            .filter(|v| !v.trim().is_empty());
        let access_token = std::env::var("FEDPROBE_ACCESS_TOKEN")
            .ok()
            .filter(|v| !v.trim().is_empty());
        let origin_server = std::env::var("FEDPROBE_ORIGIN_SERVER")
            .ok()
            .filter(|v| !v.trim().is_empty());
        let signing_key_path = std::env::var_os("FEDPROBE_SIGNING_KEY_PATH")
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);
        let metrics_dump = std::env::var("FEDPROBE_METRICS_DUMP")
            .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "yes" | "on"))
            .unwrap_or(false);
        Self {
            log_filter,
            max_in_flight,
            request_timeout_ms,
            probe_timeout_ms,
            max_servers,
            snapshot_interval_ms,
            backoff_threshold_ms,
            max_page_retries,
            retry_base_ms,
            max_backoff_ms,
            homeserver_url,
            access_token,
            origin_server,
            signing_key_path,
            metrics_dump,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Budget for one dispatched probe, delegation included. A probe that
    /// overruns it is reported as a timeout failure.
    pub fn probe_timeout(&self) -> Duration {
        self.probe_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.request_timeout())
    }

    pub fn dispatcher(&self, label: &'static str) -> ProbeDispatcher {
        ProbeDispatcher::new(self.max_in_flight, self.probe_timeout()).with_label(label)
    }

    pub fn backwalk_policy(&self, per_iteration: u32) -> BackwalkPolicy {
        BackwalkPolicy {
            per_iteration,
            snapshot_interval: Duration::from_millis(self.snapshot_interval_ms),
            backoff_threshold: Duration::from_millis(self.backoff_threshold_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            max_retries: self.max_page_retries,
            retry_base: Duration::from_millis(self.retry_base_ms),
            ..BackwalkPolicy::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::{LazyLock, Mutex};

    static ENV_MUTEX: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

    const KEYS: [&str; 7] = [
        "FEDPROBE_MAX_IN_FLIGHT",
        "FEDPROBE_REQUEST_TIMEOUT_MS",
        "FEDPROBE_PROBE_TIMEOUT_MS",
        "FEDPROBE_MAX_SERVERS",
        "FEDPROBE_HOMESERVER_URL",
        "FEDPROBE_ORIGIN_SERVER",
        "FEDPROBE_SIGNING_KEY_PATH",
    ];

    fn clear() {
        unsafe {
            for key in KEYS {
                env::remove_var(key);
            }
        }
    }

    #[test]
    fn defaults_match_documented_limits() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear();
        let cfg = AppConfig::from_env();
        assert_eq!(cfg.max_in_flight, 100);
        assert_eq!(cfg.request_timeout(), Duration::from_secs(10));
        assert_eq!(cfg.max_servers, 400);
        assert!(cfg.homeserver_url.is_none());
    }

    #[test]
    fn env_overrides_and_ignores_garbage() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear();
        unsafe {
            env::set_var("FEDPROBE_MAX_IN_FLIGHT", "8");
            env::set_var("FEDPROBE_REQUEST_TIMEOUT_MS", "not-a-number");
            env::set_var("FEDPROBE_MAX_SERVERS", "12");
            env::set_var("FEDPROBE_HOMESERVER_URL", "https://hs.example.org");
        }
        let cfg = AppConfig::from_env();
        clear();

        assert_eq!(cfg.max_in_flight, 8);
        assert_eq!(cfg.request_timeout_ms, DEFAULT_REQUEST_TIMEOUT_MS);
        assert_eq!(cfg.max_servers, 12);
        assert_eq!(cfg.homeserver_url.as_deref(), Some("https://hs.example.org"));
    }

    #[test]
    fn dispatcher_times_out_at_the_configured_request_timeout() {
        let cfg = AppConfig {
            request_timeout_ms: 10_000,
            max_in_flight: 7,
            ..AppConfig::default()
        };
        let dispatcher = cfg.dispatcher("version");
        assert_eq!(dispatcher.per_request_timeout(), Duration::from_secs(10));
        assert_eq!(dispatcher.max_in_flight(), 7);

        let widened = AppConfig {
            probe_timeout_ms: Some(25_000),
            ..cfg
        };
        assert_eq!(
            widened.dispatcher("version").per_request_timeout(),
            Duration::from_secs(25)
        );
    }

    #[test]
    fn per_host_timeout_reads_its_own_variable() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear();
        unsafe {
            env::set_var("FEDPROBE_REQUEST_TIMEOUT_MS", "4000");
        }
        let cfg = AppConfig::from_env();
        assert_eq!(cfg.probe_timeout(), Duration::from_secs(4));

        unsafe {
            env::set_var("FEDPROBE_PROBE_TIMEOUT_MS", "9000");
        }
        let cfg = AppConfig::from_env();
        clear();
        assert_eq!(cfg.request_timeout(), Duration::from_secs(4));
        assert_eq!(cfg.probe_timeout(), Duration::from_secs(9));
    }

    #[test]
    fn signing_settings_come_from_env() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear();
        assert!(AppConfig::from_env().signing_key_path.is_none());
        unsafe {
            env::set_var("FEDPROBE_ORIGIN_SERVER", "origin.example");
            env::set_var("FEDPROBE_SIGNING_KEY_PATH", "/etc/synapse/origin.signing.key");
        }
        let cfg = AppConfig::from_env();
        clear();
        assert_eq!(cfg.origin_server.as_deref(), Some("origin.example"));
        assert_eq!(
            cfg.signing_key_path,
            Some(PathBuf::from("/etc/synapse/origin.signing.key"))
        );
    }

    #[test]
    fn backwalk_policy_carries_limits() {
        let cfg = AppConfig {
            max_page_retries: 2,
            max_backoff_ms: 4_000,
            ..AppConfig::default()
        };
        let policy = cfg.backwalk_policy(250);
        assert_eq!(policy.per_iteration, 250);
        assert_eq!(policy.max_retries, 2);
        assert_eq!(policy.max_backoff, Duration::from_secs(4));
        assert_eq!(policy.backoff_threshold, Duration::from_secs(1));
    }
}
