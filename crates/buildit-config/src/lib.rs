//! KDL configuration parsing for BuildIt.
//!
//! This crate handles parsing of the fleet configuration (`buildit.kdl`):
//! store endpoint, lease timings, targets, worker identity, build
//! environment, notifiers and API settings.

pub mod error;
mod nodes;
pub mod system;

pub use error::{ConfigError, ConfigResult};
pub use system::{
    ApiConfig, BuildConfig, EnvironmentConfig, LeaseConfig, NotifyConfig, SystemConfig,
    WebhookConfig, WorkerConfig, load_system_config, parse_system_config,
};
