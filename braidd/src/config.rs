use anyhow::{Context as _, Result};
use braid_net::{Endpoint, Side};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// both halves of the mirrored link
///
/// the same file is deployed on both hosts; the command line argument
/// selects which half this process runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub left: SideConfig,
    pub right: SideConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SideConfig {
    /// the port the listener binds, on every interface
    pub listen_port: u16,

    /// the outbound paths: every logical connection opens one socket
    /// per entry
    pub endpoints: Vec<Endpoint>,
}

impl Config {
    pub const EXAMPLE: &'static str = include_str!("config.yaml");

    pub fn from_file<P>(path: P) -> Result<Self>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        let file = std::fs::File::open(path)
            .with_context(|| format!("Cannot open file: {}", path.display()))?;
        serde_yaml::from_reader(file)
            .with_context(|| format!("Invalid config file: {}", path.display()))
    }

    pub fn side(&self, side: Side) -> &SideConfig {
        match side {
            Side::Left => &self.left,
            Side::Right => &self.right,
        }
    }
}
