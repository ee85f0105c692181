//! Reads, parses, and validates the YAML config file; resolves the default
//! path and renders the starter template written there when it's missing
//! (spec §6).

use std::path::{Path, PathBuf};

use crate::error::ConfigError;
use crate::schema::{RawConfig, API_VERSION};
use crate::validate::{validate, Config};

const DEFAULT_FILE_NAME: &str = ".krelay.yaml";

pub struct ConfigLoader;

impl ConfigLoader {
    /// Resolves `--config <path>` if given, otherwise `~/.krelay.yaml`.
    pub fn discover_path(explicit: Option<&Path>) -> Result<PathBuf, ConfigError> {
        if let Some(path) = explicit {
            return Ok(path.to_path_buf());
        }
        let home = dirs::home_dir().ok_or(ConfigError::NoHomeDirectory)?;
        Ok(home.join(DEFAULT_FILE_NAME))
    }

    /// Reads, parses, and validates the file at `path`.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(path, &text)
    }

    fn parse(path: &Path, text: &str) -> Result<Config, ConfigError> {
        let raw: RawConfig = serde_yaml::from_str(text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        validate(raw)
    }

    /// A commented starter document, written to `path` when no config file
    /// exists yet; the process then exits normally (spec §6).
    pub fn default_template() -> String {
        format!(
            r#"apiVersion: {API_VERSION}

# Logs at debug level; can also be toggled with --verbose or RUST_LOG.
verbose: false

# Re-read this file on change (null/omitted means true).
auto_reload_config: true

# Extra PATH entries searched for cluster auth helpers (e.g. cloud CLI
# kubectl credential plugins).
exec_path: []

http:
  # Address the HTTP/TLS demultiplexing listener binds.
  listen: "127.0.0.1:8443"
  # Tunnels idle for longer than this are torn down.
  idle_timeout: 30m
  k8s:
    # Colon-joined kubeconfig path list; omit to use the default search.
    # kubeconfig: "~/.kube/config"

    # Requests to "<svc>-<port>.svc.<namespace>.ns.<context>.cx.k8s.localhost"
    # are routed dynamically when this is set.
    # dynamic_host: "k8s.localhost"

    routes: {{}}
      # app.local:
      #   context: kind-dev
      #   namespace: default
      #   service: app
      #   port: 80
      #   scheme: http

tcp:
  # 0 (or omitted) inherits http.idle_timeout.
  idle_timeout: 0s
  k8s:
    routes: {{}}
      # 5432:
      #   context: kind-dev
      #   namespace: default
      #   service: postgres
      #   port: 5432
    jump: {{}}
      # 6379:
      #   context: kind-dev
      #   namespace: default
      #   via:
      #     pod: krelay-jump
      #     create:
      #       image: alpine/socat:latest
      #   target:
      #     host: redis.internal
      #     port: 6379
"#
        )
    }

    /// Writes the default template to `path`, creating parent directories
    /// as needed.
    pub fn write_default_template(path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::Write {
                path: path.to_path_buf(),
                source,
            })?;
        }
        std::fs::write(path, Self::default_template()).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_template_parses_and_validates() {
        let text = ConfigLoader::default_template();
        let cfg = ConfigLoader::parse(Path::new("<template>"), &text).unwrap();
        assert_eq!(cfg.http_listen, "127.0.0.1:8443");
        assert!(cfg.http_routes.is_empty());
        assert!(cfg.tcp_routes.is_empty());
    }

    #[test]
    fn write_default_template_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("krelay.yaml");
        ConfigLoader::write_default_template(&path).unwrap();
        let cfg = ConfigLoader::load(&path).unwrap();
        assert_eq!(cfg.http_listen, "127.0.0.1:8443");
    }

    #[test]
    fn discover_path_prefers_explicit_over_default() {
        let explicit = PathBuf::from("/tmp/explicit.yaml");
        let resolved = ConfigLoader::discover_path(Some(&explicit)).unwrap();
        assert_eq!(resolved, explicit);
    }
}
