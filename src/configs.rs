use crate::error::ConfigError;
use color_eyre::eyre::WrapErr;
use color_eyre::Result;
use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct CustosConfig {
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub programs: Vec<ProgramConfig>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    #[serde(default)]
    pub auth: Option<AuthConfig>,
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// Upper bound on how long shutdown waits for programs to stop before
    /// force killing whatever is left.
    #[serde(with = "humantime_serde", default = "default_shutdown_timeout")]
    pub shutdown_timeout: Duration,
    #[serde(default)]
    pub distributed: DistributedConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct AuthConfig {
    pub user: String,
    pub password: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct DistributedConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
    #[serde(with = "humantime_serde", default = "default_publish_interval")]
    pub publish_interval: Duration,
    /// Peer views older than this are reported as stale.
    #[serde(with = "humantime_serde", default = "default_stale_after")]
    pub stale_after: Duration,
    #[serde(with = "humantime_serde", default = "default_request_timeout")]
    pub request_timeout: Duration,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct PeerConfig {
    pub id: String,
    /// Base url of the peer's control api, e.g. `http://10.0.0.2:11313`.
    pub url: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct ProgramConfig {
    pub name: String,
    /// Command line, split with shell quoting rules.
    pub command: String,
    #[serde(default)]
    pub directory: Option<PathBuf>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    /// Account to run the program as (unix only).
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub autostart: bool,
    #[serde(default)]
    pub autorestart: RestartPolicy,
    /// Number of failed attempts after which the program goes fatal.
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default)]
    pub backoff: BackoffConfig,
    /// How long a process has to stay up to count as started.
    #[serde(with = "humantime_serde", default = "default_start_dwell")]
    pub start_dwell: Duration,
    #[serde(default = "default_stop_signal")]
    pub stop_signal: String,
    /// Grace period between the stop signal and the forced kill.
    #[serde(with = "humantime_serde", default = "default_stop_timeout")]
    pub stop_timeout: Duration,
    #[serde(default)]
    pub log_file: Option<PathBuf>,
    /// Size in bytes of the in-memory output buffer used for log tails.
    #[serde(default = "default_log_buffer")]
    pub log_buffer: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    Never,
    Always,
    #[default]
    #[serde(alias = "on-unexpected-exit")]
    OnFailure,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct BackoffConfig {
    #[serde(with = "humantime_serde", default = "default_backoff_first")]
    pub first: Duration,
    #[serde(with = "humantime_serde", default = "default_backoff_max")]
    pub max: Duration,
    #[serde(default = "default_backoff_factor")]
    pub factor: f64,
    /// A run at least this long clears the failure counter.
    #[serde(with = "humantime_serde", default = "default_backoff_reset")]
    pub reset_after: Duration,
}

impl CustosConfig {
    pub fn from_path(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .wrap_err_with(|| format!("Failed to open config {}", path.display()))?;
        serde_yaml::from_reader(file).wrap_err("Failed to read config!")
    }

    /// Splits the configured programs into the ones that can be supervised
    /// and the reasons the others were rejected.
    pub fn validated_programs(&self) -> (Vec<ProgramConfig>, Vec<ConfigError>) {
        let mut seen = HashSet::new();
        let mut accepted = Vec::new();
        let mut rejected = Vec::new();
        for program in &self.programs {
            if let Err(err) = program.validate() {
                rejected.push(err);
                continue;
            }
            if !seen.insert(program.name.clone()) {
                rejected.push(ConfigError::Duplicate(program.name.clone()));
                continue;
            }
            accepted.push(program.clone());
        }
        (accepted, rejected)
    }
}

impl ProgramConfig {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            directory: None,
            environment: BTreeMap::new(),
            user: None,
            autostart: false,
            autorestart: RestartPolicy::default(),
            retries: default_retries(),
            backoff: BackoffConfig::default(),
            start_dwell: default_start_dwell(),
            stop_signal: default_stop_signal(),
            stop_timeout: default_stop_timeout(),
            log_file: None,
            log_buffer: default_log_buffer(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: String| ConfigError::Invalid {
            program: self.name.clone(),
            reason,
        };
        if self.name.is_empty() {
            return Err(invalid("name is empty".into()));
        }
        if !is_valid_name(&self.name) {
            return Err(invalid(format!("illegal characters in name {:?}", self.name)));
        }
        self.argv().map_err(|err| invalid(err.to_string()))?;
        self.signal().map_err(|_| invalid(format!("unknown stop signal {}", self.stop_signal)))?;
        if self.backoff.factor < 1.0 || !self.backoff.factor.is_finite() {
            return Err(invalid("backoff factor must be >= 1.0".into()));
        }
        if self.backoff.first > self.backoff.max {
            return Err(invalid("backoff first delay exceeds max".into()));
        }
        if self.log_buffer == 0 {
            return Err(invalid("log buffer must not be empty".into()));
        }
        Ok(())
    }

    pub fn argv(&self) -> Result<Vec<String>, ConfigError> {
        let words = shell_words::split(&self.command).map_err(|err| ConfigError::Invalid {
            program: self.name.clone(),
            reason: format!("invalid command: {err}"),
        })?;
        if words.is_empty() {
            return Err(ConfigError::Invalid {
                program: self.name.clone(),
                reason: "command is empty".into(),
            });
        }
        Ok(words)
    }

    /// Accepts both `SIGTERM` and `TERM`.
    pub fn signal(&self) -> Result<Signal, nix::Error> {
        let name = self.stop_signal.to_ascii_uppercase();
        if name.starts_with("SIG") {
            Signal::from_str(&name)
        } else {
            Signal::from_str(&format!("SIG{name}"))
        }
    }

    pub fn log_path(&self, log_dir: &Path) -> PathBuf {
        match &self.log_file {
            Some(path) if path.is_absolute() => path.clone(),
            Some(path) => log_dir.join(path),
            None => log_dir.join(format!("{}.log", self.name)),
        }
    }
}

/// Program names are path segments in the control api, so they are kept to
/// `[A-Za-z0-9._-]`.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

fn default_log_filter() -> String {
    "info".into()
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 11313))
}

fn default_log_dir() -> PathBuf {
    "logs".into()
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_node_id() -> String {
    "local".into()
}

fn default_publish_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_stale_after() -> Duration {
    Duration::from_secs(30)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_retries() -> u32 {
    3
}

fn default_start_dwell() -> Duration {
    Duration::from_secs(1)
}

fn default_stop_signal() -> String {
    "SIGTERM".into()
}

fn default_stop_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_log_buffer() -> usize {
    64 * 1024
}

fn default_backoff_first() -> Duration {
    Duration::from_secs(1)
}

fn default_backoff_max() -> Duration {
    Duration::from_secs(30)
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_backoff_reset() -> Duration {
    Duration::from_secs(60)
}

impl Default for CustosConfig {
    fn default() -> Self {
        Self {
            log_filter: default_log_filter(),
            server: Default::default(),
            programs: Default::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            auth: None,
            log_dir: default_log_dir(),
            shutdown_timeout: default_shutdown_timeout(),
            distributed: Default::default(),
        }
    }
}

impl Default for DistributedConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            peers: Default::default(),
            publish_interval: default_publish_interval(),
            stale_after: default_stale_after(),
            request_timeout: default_request_timeout(),
        }
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            first: default_backoff_first(),
            max: default_backoff_max(),
            factor: default_backoff_factor(),
            reset_after: default_backoff_reset(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
log-filter: debug
server:
  listen: 127.0.0.1:9000
  auth:
    user: admin
    password: secret
  shutdown-timeout: 3s
  distributed:
    node-id: alpha
    peers:
      - id: beta
        url: http://10.0.0.2:11313
programs:
  - name: web
    command: "python -m http.server 8080"
    autostart: true
    autorestart: on-unexpected-exit
    environment:
      PORT: "8080"
    backoff:
      first: 200ms
      factor: 1.5
    stop-signal: INT
    stop-timeout: 2s
  - name: bad name
    command: "true"
  - name: web
    command: "echo twice"
  - name: empty
    command: ""
"#;

    #[test]
    fn parses_with_defaults() {
        let config: CustosConfig = serde_yaml::from_str(SAMPLE).unwrap();
        assert_eq!(config.log_filter, "debug");
        assert_eq!(config.server.listen, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(config.server.shutdown_timeout, Duration::from_secs(3));
        assert_eq!(config.server.log_dir, PathBuf::from("logs"));
        assert_eq!(config.server.distributed.node_id, "alpha");
        assert_eq!(config.server.distributed.stale_after, Duration::from_secs(30));

        let web = &config.programs[0];
        assert_eq!(web.autorestart, RestartPolicy::OnFailure);
        assert_eq!(web.retries, 3);
        assert_eq!(web.backoff.first, Duration::from_millis(200));
        assert_eq!(web.backoff.max, Duration::from_secs(30));
        assert_eq!(web.backoff.factor, 1.5);
        assert_eq!(web.start_dwell, Duration::from_secs(1));
        assert_eq!(web.signal().unwrap(), Signal::SIGINT);
        assert_eq!(web.argv().unwrap(), vec!["python", "-m", "http.server", "8080"]);
        assert_eq!(web.environment.get("PORT").map(String::as_str), Some("8080"));
    }

    #[test]
    fn invalid_programs_are_omitted() {
        let config: CustosConfig = serde_yaml::from_str(SAMPLE).unwrap();
        let (accepted, rejected) = config.validated_programs();
        assert_eq!(accepted.len(), 1);
        assert_eq!(accepted[0].name, "web");
        assert_eq!(rejected.len(), 3);
        assert!(rejected
            .iter()
            .any(|err| matches!(err, ConfigError::Duplicate(name) if name == "web")));
    }

    #[test]
    fn rejects_unknown_signal_and_bad_backoff() {
        let mut program = ProgramConfig::new("x", "sleep 1");
        assert!(program.validate().is_ok());

        program.stop_signal = "SIGNOPE".into();
        assert!(program.validate().is_err());

        program.stop_signal = "term".into();
        program.backoff.factor = 0.5;
        assert!(program.validate().is_err());

        program.backoff.factor = 2.0;
        program.backoff.first = Duration::from_secs(60);
        assert!(program.validate().is_err());
    }

    #[test]
    fn json_documents_are_accepted() {
        let config: CustosConfig =
            serde_yaml::from_str(r#"{"programs": [{"name": "a", "command": "true", "autorestart": "always"}]}"#)
                .unwrap();
        assert_eq!(config.programs[0].autorestart, RestartPolicy::Always);
    }

    #[test]
    fn log_path_defaults_to_log_dir() {
        let dir = Path::new("/var/log/custos");
        let mut program = ProgramConfig::new("api", "true");
        assert_eq!(program.log_path(dir), dir.join("api.log"));
        program.log_file = Some("api/out.log".into());
        assert_eq!(program.log_path(dir), dir.join("api/out.log"));
        program.log_file = Some("/tmp/api.log".into());
        assert_eq!(program.log_path(dir), PathBuf::from("/tmp/api.log"));
    }
}
