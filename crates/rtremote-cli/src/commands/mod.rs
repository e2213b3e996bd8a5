//! CLI command implementations

pub mod call;
pub mod serve;

use anyhow::Context;
use rtremote::RemoteConfig;
use std::path::Path;

/// Load the configuration file if one was given, defaults otherwise.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<RemoteConfig> {
    match path {
        Some(path) => RemoteConfig::from_file(path)
            .with_context(|| format!("loading config from {}", path.display())),
        None => Ok(RemoteConfig::default()),
    }
}
