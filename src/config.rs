use serde::{Deserialize, Deserializer, Serialize};
use std::path::PathBuf;

use crate::errors::GatewayError;

/// Settings of the git transfer gateway.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct GatewayConfig {
    /// Directory repositories are resolved against.
    pub project_root: PathBuf,
    pub git_bin_path: PathBuf,
    #[serde(deserialize_with = "string_or_bool")]
    pub upload_pack: bool,
    #[serde(deserialize_with = "string_or_bool")]
    pub receive_pack: bool,
    /// Also require the repository's own `http.uploadpack` / `http.receivepack` to allow the RPC.
    #[serde(deserialize_with = "string_or_bool")]
    pub respect_repository_config: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            project_root: PathBuf::from("/srv/git"),
            git_bin_path: PathBuf::from("/usr/bin/git"),
            upload_pack: true,
            receive_pack: false,
            respect_repository_config: false,
        }
    }
}

impl GatewayConfig {
    /// Serves `root` with both RPC services enabled.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            project_root: root.into(),
            receive_pack: true,
            ..Self::default()
        }
    }

    /// Defaults overlaid with `GIT_PROJECT_ROOT`, `GIT_BIN_PATH`, `GIT_UPLOAD_PACK`,
    /// `GIT_RECEIVE_PACK` and `GIT_RESPECT_REPO_CONFIG`.
    pub fn from_env() -> Result<Self, GatewayError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, GatewayError> {
        let mut config = Self::default();
        if let Some(root) = lookup("GIT_PROJECT_ROOT") {
            config.project_root = PathBuf::from(root);
        }
        if let Some(bin) = lookup("GIT_BIN_PATH") {
            config.git_bin_path = PathBuf::from(bin);
        }
        let flags = [
            ("GIT_UPLOAD_PACK", &mut config.upload_pack),
            ("GIT_RECEIVE_PACK", &mut config.receive_pack),
            ("GIT_RESPECT_REPO_CONFIG", &mut config.respect_repository_config),
        ];
        for (key, flag) in flags {
            if let Some(value) = lookup(key) {
                *flag = parse_bool(&value).ok_or_else(|| {
                    let msg = format!("{key}: expected a boolean, got {value:?}");
                    GatewayError::InvalidRequest(msg)
                })?;
            }
        }
        Ok(config)
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

fn string_or_bool<'deserialize, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'deserialize>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrBool {
        String(String),
        Bool(bool),
    }

    match StringOrBool::deserialize(deserializer)? {
        StringOrBool::Bool(v) => Ok(v),
        StringOrBool::String(v) => parse_bool(&v)
            .ok_or_else(|| serde::de::Error::custom(format!("expected a boolean, got {v:?}"))),
    }
}
