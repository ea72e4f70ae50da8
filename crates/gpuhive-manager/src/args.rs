use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use gpuhive_common::telemetry::LogFormat;
use gpuhive_manager::ManagerConfig;

#[derive(Debug, Parser)]
#[command(name = "gpuhive-manager", about = "GPU cluster manager for Jupyter kernel gateways")]
pub struct Args {
    #[arg(long, env = "GPUHIVE_LISTEN_ADDR", default_value = "0.0.0.0:8090")]
    pub listen_addr: String,

    /// JSON file holding the node registry.
    #[arg(long, env = "GPUHIVE_REGISTRY_PATH", default_value = "cluster_config.json")]
    pub registry_path: PathBuf,

    /// Keep the registry in memory only.
    #[arg(long, default_value_t = false)]
    pub ephemeral: bool,

    #[arg(long, env = "GPUHIVE_POLL_INTERVAL_SECS", default_value_t = 30)]
    pub poll_interval_secs: u64,

    #[arg(long, env = "GPUHIVE_PROBE_TIMEOUT_SECS", default_value_t = 5)]
    pub probe_timeout_secs: u64,

    #[arg(long, env = "GPUHIVE_KERNEL_TIMEOUT_SECS", default_value_t = 60)]
    pub kernel_timeout_secs: u64,

    #[arg(long, env = "GPUHIVE_PROBE_CONCURRENCY", default_value_t = 8)]
    pub probe_concurrency: usize,

    #[arg(long, env = "GPUHIVE_DEFAULT_MAX_KERNELS", default_value_t = 10)]
    pub default_max_kernels: u32,

    /// pretty, compact or json
    #[arg(long, env = "GPUHIVE_LOG_FORMAT", default_value = "pretty")]
    pub log_format: LogFormat,

    /// OTLP/HTTP base URL for trace export.
    #[arg(long, env = "OTLP_ENDPOINT")]
    pub otlp_endpoint: Option<String>,

    #[arg(long, env = "OTLP_TOKEN")]
    pub otlp_token: Option<String>,
}

impl Args {
    pub fn manager_config(&self) -> anyhow::Result<ManagerConfig> {
        if self.poll_interval_secs == 0 {
            anyhow::bail!("--poll-interval-secs must be at least 1");
        }
        if self.probe_timeout_secs == 0 || self.kernel_timeout_secs == 0 {
            anyhow::bail!("timeouts must be at least 1 second");
        }
        if self.default_max_kernels == 0 {
            anyhow::bail!("--default-max-kernels must be at least 1");
        }
        Ok(ManagerConfig {
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            probe_timeout: Duration::from_secs(self.probe_timeout_secs),
            kernel_timeout: Duration::from_secs(self.kernel_timeout_secs),
            probe_concurrency: self.probe_concurrency.max(1),
            default_max_kernels: self.default_max_kernels,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_manager_defaults() {
        let args = Args::parse_from(["gpuhive-manager", "--ephemeral"]);
        let config = args.manager_config().unwrap();
        let defaults = ManagerConfig::default();
        assert_eq!(config.poll_interval, defaults.poll_interval);
        assert_eq!(config.probe_timeout, defaults.probe_timeout);
        assert_eq!(config.kernel_timeout, defaults.kernel_timeout);
        assert_eq!(config.default_max_kernels, defaults.default_max_kernels);
        assert_eq!(args.log_format, LogFormat::Pretty);
    }

    #[test]
    fn zero_interval_is_rejected() {
        let args = Args::parse_from(["gpuhive-manager", "--poll-interval-secs", "0"]);
        assert!(args.manager_config().is_err());
    }
}
