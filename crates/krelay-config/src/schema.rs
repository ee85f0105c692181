//! The on-disk YAML shape (spec §6), deserialized as-is before validation
//! and conversion into `krelay-router`'s route types.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const API_VERSION: &str = "krelay/v1";

fn default_true() -> Option<bool> {
    Some(true)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawConfig {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    #[serde(default)]
    pub verbose: bool,
    #[serde(default = "default_true", rename = "auto_reload_config")]
    pub auto_reload_config: Option<bool>,
    #[serde(default)]
    pub exec_path: Vec<String>,
    pub http: RawHttp,
    #[serde(default)]
    pub tcp: Option<RawTcp>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawHttp {
    pub listen: String,
    #[serde(with = "duration_str")]
    pub idle_timeout: Duration,
    #[serde(default)]
    pub k8s: Option<RawHttpK8s>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawHttpK8s {
    #[serde(default)]
    pub kubeconfig: Option<String>,
    #[serde(default)]
    pub dynamic_host: Option<String>,
    #[serde(default)]
    pub routes: BTreeMap<String, RawHttpRoute>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawHttpRoute {
    pub context: String,
    pub namespace: String,
    #[serde(default)]
    pub service: Option<String>,
    #[serde(default)]
    pub pod: Option<String>,
    pub port: u16,
    #[serde(default)]
    pub scheme: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawTcp {
    #[serde(default = "zero_duration", with = "duration_str")]
    pub idle_timeout: Duration,
    #[serde(default)]
    pub k8s: Option<RawTcpK8s>,
}

fn zero_duration() -> Duration {
    Duration::ZERO
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawTcpK8s {
    #[serde(default)]
    pub routes: BTreeMap<u16, RawTcpRoute>,
    #[serde(default)]
    pub jump: BTreeMap<u16, RawJumpRoute>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawTcpRoute {
    pub context: String,
    pub namespace: String,
    #[serde(default)]
    pub service: Option<String>,
    #[serde(default)]
    pub pod: Option<String>,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawJumpRoute {
    pub context: String,
    pub namespace: String,
    pub via: RawJumpVia,
    pub target: RawJumpTarget,
    #[serde(default)]
    pub method: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawJumpVia {
    #[serde(default)]
    pub pod: Option<String>,
    #[serde(default)]
    pub service: Option<String>,
    #[serde(default)]
    pub container: Option<String>,
    #[serde(default)]
    pub create: Option<RawCreatePodSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawCreatePodSpec {
    pub image: String,
    #[serde(default)]
    pub command: Option<Vec<String>>,
    #[serde(default, with = "duration_str_opt")]
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawJumpTarget {
    pub host: String,
    pub port: u16,
}

/// `serde(with = ...)` support for a required `humantime`-formatted duration
/// field (e.g. `30s`, `5m`). No `humantime-serde` crate is available, so the
/// round-trip through `String` is hand-rolled here.
mod duration_str {
    use super::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(de)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

mod duration_str_opt {
    use super::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, ser: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => ser.serialize_str(&humantime::format_duration(*d).to_string()),
            None => ser.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Option<Duration>, D::Error> {
        let raw = Option::<String>::deserialize(de)?;
        raw.map(|s| humantime::parse_duration(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}
