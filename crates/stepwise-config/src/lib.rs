//! KDL configuration parsing for Stepwise.
//!
//! This crate handles parsing of:
//! - Runner configuration (stepwise.kdl)
//! - Pipeline definitions submitted as files

pub mod error;
mod nodes;
pub mod pipeline;
pub mod system;

pub use error::{ConfigError, ConfigResult};
pub use pipeline::{PipelineDefinition, parse_pipeline};
pub use system::{
    JobDefaults, SystemConfig, default_worker_id, load_system_config, parse_system_config,
};
