//! # Rustuya Gateway
//!
//! Always-on local gateway for Tuya-compatible devices. Devices are found by
//! their UDP broadcasts, matched against stored credentials (optionally
//! refreshed from the Tuya cloud) and controlled through a small JSON-over-HTTP
//! API.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use rustuya_gateway::config::GatewayConfig;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn start() -> rustuya_gateway::error::Result<()> {
//! let token = CancellationToken::new();
//! rustuya_gateway::runtime::run(GatewayConfig::default(), None, token).await?;
//! # Ok(())
//! # }
//! ```
//!
#[macro_use]
pub mod macros;
pub mod cloud;
pub mod config;
pub mod crypto;
pub mod error;
pub mod gateway;
pub mod http;
pub mod protocol;
pub mod registry;
pub mod resolver;
pub mod runtime;
pub mod scanner;
pub mod scheduler;
pub mod session;
pub mod stats;
pub mod store;

pub use error::TuyaError;
pub use gateway::Gateway;
pub use protocol::{CommandType, Version};
pub use registry::Registry;

pub const VERSION: &str = stats::VERSION;

pub fn version() -> &'static str {
    VERSION
}
