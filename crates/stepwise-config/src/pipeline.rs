//! Pipeline definition parsing.
//!
//! A pipeline file describes one submission:
//!
//! ```kdl
//! repository "octo/demo"
//! branch "feature-x"
//! credential-env "GITHUB_TOKEN"
//! env {
//!     RUST_LOG "debug"
//! }
//! step "cargo build"
//! step "cargo test"
//! ```
//!
//! Secrets never live in the file; `credential-env` names the environment
//! variable the submitter reads the credential from.

use crate::nodes::{get_first_string_arg, require_string};
use crate::{ConfigError, ConfigResult};
use kdl::{KdlDocument, KdlNode};
use std::collections::BTreeMap;
use stepwise_core::JobPayload;
use tracing::warn;

/// A parsed pipeline file.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineDefinition {
    /// Payload without a credential.
    pub payload: JobPayload,
    /// Environment variable holding the repository credential, if any.
    pub credential_env: Option<String>,
}

/// Parse a pipeline definition from KDL text.
pub fn parse_pipeline(kdl: &str) -> ConfigResult<PipelineDefinition> {
    let doc: KdlDocument = kdl.parse()?;

    let mut payload = JobPayload::new();
    let mut credential_env = None;
    let mut seen_repository = false;
    let mut seen_branch = false;

    for node in doc.nodes() {
        match node.name().value() {
            "repository" => {
                if seen_repository {
                    return Err(ConfigError::Duplicate("repository".to_string()));
                }
                seen_repository = true;
                payload.repository = Some(non_blank(node)?);
            }
            "branch" => {
                if seen_branch {
                    return Err(ConfigError::Duplicate("branch".to_string()));
                }
                seen_branch = true;
                payload.branch = non_blank(node)?;
            }
            "credential-env" => {
                credential_env = Some(non_blank(node)?);
            }
            "step" => {
                payload.steps.push(non_blank(node)?);
            }
            "env" => {
                payload.env = parse_env(node)?;
            }
            other => warn!(node = %other, "Ignoring unknown pipeline node"),
        }
    }

    Ok(PipelineDefinition {
        payload,
        credential_env,
    })
}

fn parse_env(node: &KdlNode) -> ConfigResult<BTreeMap<String, String>> {
    let mut env = BTreeMap::new();

    if let Some(children) = node.children() {
        for child in children.nodes() {
            let key = child.name().value().to_string();
            let value = get_first_string_arg(child).ok_or_else(|| ConfigError::InvalidValue {
                field: format!("env.{}", key),
                message: "expected a string value".to_string(),
            })?;
            if env.insert(key.clone(), value).is_some() {
                return Err(ConfigError::Duplicate(format!("env.{}", key)));
            }
        }
    }

    Ok(env)
}

fn non_blank(node: &KdlNode) -> ConfigResult<String> {
    let value = require_string(node)?;
    if value.trim().is_empty() {
        return Err(ConfigError::InvalidValue {
            field: node.name().value().to_string(),
            message: "cannot be empty".to_string(),
        });
    }
    Ok(value)
}
