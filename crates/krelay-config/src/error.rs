use std::path::PathBuf;

use thiserror::Error;

/// `ConfigInvalid` from spec §7, broken out by the check that failed.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write config file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("unsupported apiVersion {0:?}, expected {1:?}")]
    UnsupportedApiVersion(String, &'static str),
    #[error("http.listen is not a valid host:port address: {0:?}")]
    InvalidListenAddress(String),
    #[error("http.idle_timeout must be greater than 0")]
    InvalidIdleTimeout,
    #[error("route {0:?} must set exactly one of service or pod")]
    AmbiguousTarget(String),
    #[error("route {0:?} port {1} is out of range 1..=65535")]
    PortOutOfRange(String, u32),
    #[error("tcp local port {0} is used by more than one route or jump entry")]
    DuplicateTcpPort(u16),
    #[error("tcp local port {0} collides with the http listen port")]
    TcpPortCollidesWithHttpListen(u16),
    #[error("jump route {0:?} target.host {1:?} is not a valid hostname or IP literal")]
    InvalidTargetHost(String, String),
    #[error("jump route {0:?} via.create.image {1:?} is not a valid image reference")]
    InvalidImageName(String, String),
    #[error("could not determine the home directory to resolve the default config path")]
    NoHomeDirectory,
}
