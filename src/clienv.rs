use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvVar {
    BrokerConfig,
    BrokerLog,
    RustLog,
}

impl EnvVar {
    pub fn as_str(self) -> &'static str {
        match self {
            EnvVar::BrokerConfig => "OSQUERY_BROKER_CONFIG",
            EnvVar::BrokerLog => "OSQUERY_BROKER_LOG",
            EnvVar::RustLog => "RUST_LOG",
        }
    }
}

const FALLBACK_CONFIG_DIR: &str = "~/.config";
const BROKER_SUBDIR: &str = "osquery-broker";
const CONFIG_FILE: &str = "broker.toml";
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Non-empty value of an environment variable.
pub fn env_opt(var: EnvVar) -> Option<String> {
    std::env::var(var.as_str())
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Broker config file ($OSQUERY_BROKER_CONFIG or ~/.config/osquery-broker/broker.toml)
pub fn config_path() -> PathBuf {
    let path = env_opt(EnvVar::BrokerConfig)
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            dirs::config_dir()
                .unwrap_or_else(|| PathBuf::from(FALLBACK_CONFIG_DIR))
                .join(BROKER_SUBDIR)
                .join(CONFIG_FILE)
        });
    tracing::trace!(path = %path.display(), "Resolved config path");
    path
}

/// Tracing filter directive: $RUST_LOG, then $OSQUERY_BROKER_LOG, then "info".
pub fn log_filter() -> String {
    env_opt(EnvVar::RustLog)
        .or_else(|| env_opt(EnvVar::BrokerLog))
        .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string())
}
