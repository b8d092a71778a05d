use std::env;

use tracing::warn;

pub(crate) const DEFAULT_HOST: &str = "0.0.0.0";
pub(crate) const DEFAULT_PORT: u16 = 6380;
pub(crate) const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 10;
pub(crate) const DEFAULT_MAX_LINE_LEN: usize = 64 * 1024;
pub(crate) const DEFAULT_MAX_ARGS: usize = 128;
pub(crate) const DEFAULT_METRICS_HOST: &str = "0.0.0.0";
pub(crate) const DEFAULT_METRICS_PORT: u16 = 9090;

/// Runtime configuration, read once at startup from `KVLITE_*` environment
/// variables. An unset or unparsable variable falls back to its default.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Config {
    pub host: String,
    pub port: u16,
    pub sweep_interval_secs: u64,
    pub max_line_len: usize,
    pub max_args: usize,
    pub metrics_host: String,
    pub metrics_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
            max_line_len: DEFAULT_MAX_LINE_LEN,
            max_args: DEFAULT_MAX_ARGS,
            metrics_host: DEFAULT_METRICS_HOST.to_string(),
            metrics_port: DEFAULT_METRICS_PORT,
        }
    }
}

impl Config {
    pub(crate) fn from_env() -> Self {
        Self::from_vars(|name| env::var(name).ok())
    }

    /// Build a config from an arbitrary variable source, so tests never have
    /// to mutate the process environment.
    pub(crate) fn from_vars<F>(var: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Config::default();
        Self {
            host: var("KVLITE_HOST").unwrap_or(defaults.host),
            port: parse_var(&var, "KVLITE_PORT", defaults.port),
            sweep_interval_secs: parse_var(
                &var,
                "KVLITE_SWEEP_INTERVAL",
                defaults.sweep_interval_secs,
            ),
            max_line_len: parse_var(&var, "KVLITE_MAX_LINE_LEN", defaults.max_line_len),
            max_args: parse_var(&var, "KVLITE_MAX_ARGS", defaults.max_args),
            metrics_host: var("KVLITE_METRICS_HOST").unwrap_or(defaults.metrics_host),
            metrics_port: parse_var(&var, "KVLITE_METRICS_PORT", defaults.metrics_port),
        }
    }

    pub(crate) fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub(crate) fn metrics_listen_addr(&self) -> String {
        format!("{}:{}", self.metrics_host, self.metrics_port)
    }
}

fn parse_var<F, T>(var: &F, name: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr + Copy,
{
    match var(name) {
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            warn!(%name, %raw, "invalid value, using default");
            default
        }),
        None => default,
    }
}
