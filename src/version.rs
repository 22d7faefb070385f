//! Build metadata served by `GET /version` and logged at startup.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionInfo {
    #[serde(rename = "buildDate")]
    pub build_date: String,
    #[serde(rename = "buildVersion")]
    pub build_version: String,
    #[serde(rename = "buildHash")]
    pub build_hash: String,
    #[serde(rename = "runtimeVersion")]
    pub runtime_version: String,
}

impl VersionInfo {
    pub fn current() -> Self {
        Self {
            build_date: env!("BUILD_DATE").to_string(),
            build_version: env!("CARGO_PKG_VERSION").to_string(),
            build_hash: env!("BUILD_HASH").to_string(),
            runtime_version: env!("RUSTC_VERSION").to_string(),
        }
    }
}
