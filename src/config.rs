//! Command line and environment configuration.

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug, Clone, PartialEq)]
#[command(name = "rustuya-gateway")]
#[command(about = "Local HTTP gateway for Tuya devices", version)]
pub struct GatewayConfig {
    /// HTTP API port
    #[arg(long, env = "APIPORT", default_value_t = 8888)]
    pub port: u16,

    /// Address the HTTP server and UDP listeners bind to
    #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0")]
    pub bind: String,

    /// Device credential file (TinyTuya wizard format)
    #[arg(long, env = "DEVICEFILE", default_value = "devices.json")]
    pub devices_file: PathBuf,

    /// Cloud account file
    #[arg(long, env = "CONFIGFILE", default_value = "tinytuya.json")]
    pub config_file: PathBuf,

    /// Directory served for non-API paths
    #[arg(long, env = "WEBROOT", default_value = "web")]
    pub web_root: PathBuf,

    /// UDP discovery ports
    #[arg(long, env = "UDPPORTS", value_delimiter = ',', default_values_t = [6666u16, 6667, 7000])]
    pub udp_ports: Vec<u16>,

    /// Seconds between scheduled credential retries
    #[arg(long, env = "RETRYTIME", default_value_t = 30)]
    pub retry_time: u64,

    /// Scheduled retries per unresolved device
    #[arg(long, env = "RETRYCOUNT", default_value_t = 5)]
    pub retry_count: u32,

    /// Never write the credential or cloud files
    #[arg(long, env = "NOSAVE")]
    pub no_save: bool,

    /// Seconds to wait on device sockets
    #[arg(long, env = "TCPTIMEOUT", default_value_t = 5)]
    pub device_timeout: u64,

    /// Verbose logging
    #[arg(short, long, env = "DEBUG")]
    pub debug: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: 8888,
            bind: "0.0.0.0".into(),
            devices_file: "devices.json".into(),
            config_file: "tinytuya.json".into(),
            web_root: "web".into(),
            udp_ports: crate::scanner::DEFAULT_PORTS.to_vec(),
            retry_time: 30,
            retry_count: 5,
            no_save: false,
            device_timeout: 5,
            debug: false,
        }
    }
}

impl GatewayConfig {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_time)
    }

    pub fn device_timeout(&self) -> Duration {
        Duration::from_secs(self.device_timeout)
    }

    pub fn persist(&self) -> bool {
        !self.no_save
    }

    pub fn log_filter(&self) -> &'static str {
        if self.debug { "debug" } else { "info" }
    }
}
