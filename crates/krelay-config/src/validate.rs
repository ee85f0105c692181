//! Validation and conversion from the raw YAML shape (spec §6) into the
//! route types `krelay-tunnel`/`krelay-router` operate on. Pure function of
//! the parsed document, so validation is idempotent (spec §8).

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::time::Duration;

use regex_lite::Regex;

use krelay_router::{CreatePodSpec, HttpRoute, JumpMethod, JumpRoute, JumpVia, PodOrService, Scheme, TcpDirectRoute, TcpRoute};

use crate::error::ConfigError;
use crate::schema::{RawConfig, RawHttpRoute, RawJumpRoute, RawTcpRoute, API_VERSION};

/// A fully validated configuration, ready to be folded into a
/// `krelay-tunnel::RouteSnapshot` by the binary.
#[derive(Debug, Clone)]
pub struct Config {
    pub verbose: bool,
    pub auto_reload_config: bool,
    pub exec_path: Vec<String>,
    pub http_listen: String,
    pub http_idle_timeout: Duration,
    pub kubeconfig: Option<String>,
    pub dynamic_host_suffix: Option<String>,
    pub http_routes: HashMap<String, HttpRoute>,
    /// `None` means "inherit `http_idle_timeout`" (spec §9: a literal `0`
    /// and an absent field are folded together).
    pub tcp_idle_timeout: Option<Duration>,
    pub tcp_routes: HashMap<u16, TcpRoute>,
}

pub fn validate(raw: RawConfig) -> Result<Config, ConfigError> {
    if raw.api_version != API_VERSION {
        return Err(ConfigError::UnsupportedApiVersion(raw.api_version, API_VERSION));
    }

    validate_listen_address(&raw.http.listen)?;
    if raw.http.idle_timeout.is_zero() {
        return Err(ConfigError::InvalidIdleTimeout);
    }

    let mut http_routes = HashMap::new();
    let mut used_tcp_ports: HashSet<u16> = HashSet::new();

    if let Some(k8s) = &raw.http.k8s {
        for (hostname, route) in &k8s.routes {
            http_routes.insert(hostname.clone(), convert_http_route(hostname, route)?);
        }
    }

    let mut tcp_routes = HashMap::new();
    let http_listen_port = listen_port(&raw.http.listen);

    if let Some(tcp) = &raw.tcp {
        if let Some(k8s) = &tcp.k8s {
            for (port, route) in &k8s.routes {
                check_tcp_port(*port, http_listen_port, &mut used_tcp_ports)?;
                tcp_routes.insert(*port, TcpRoute::Direct(convert_tcp_route(*port, route)?));
            }
            for (port, route) in &k8s.jump {
                check_tcp_port(*port, http_listen_port, &mut used_tcp_ports)?;
                tcp_routes.insert(*port, TcpRoute::Jump(convert_jump_route(*port, route)?));
            }
        }
    }

    let tcp_idle_timeout = raw.tcp.as_ref().and_then(|t| {
        if t.idle_timeout.is_zero() {
            None
        } else {
            Some(t.idle_timeout)
        }
    });

    Ok(Config {
        verbose: raw.verbose,
        auto_reload_config: raw.auto_reload_config.unwrap_or(true),
        exec_path: raw.exec_path,
        http_listen: raw.http.listen,
        http_idle_timeout: raw.http.idle_timeout,
        kubeconfig: raw.http.k8s.as_ref().and_then(|k8s| k8s.kubeconfig.clone()),
        dynamic_host_suffix: raw.http.k8s.as_ref().and_then(|k8s| k8s.dynamic_host.clone()),
        http_routes,
        tcp_idle_timeout,
        tcp_routes,
    })
}

fn listen_port(listen: &str) -> Option<u16> {
    listen.rsplit_once(':').and_then(|(_, p)| p.parse().ok())
}

fn validate_listen_address(listen: &str) -> Result<(), ConfigError> {
    let Some((host, port)) = listen.rsplit_once(':') else {
        return Err(ConfigError::InvalidListenAddress(listen.to_string()));
    };
    if host.is_empty() {
        return Err(ConfigError::InvalidListenAddress(listen.to_string()));
    }
    match port.parse::<u16>() {
        Ok(0) | Err(_) => Err(ConfigError::InvalidListenAddress(listen.to_string())),
        Ok(_) => Ok(()),
    }
}

fn check_tcp_port(port: u16, http_listen_port: Option<u16>, seen: &mut HashSet<u16>) -> Result<(), ConfigError> {
    if port == 0 {
        return Err(ConfigError::PortOutOfRange(port.to_string(), port as u32));
    }
    if http_listen_port == Some(port) {
        return Err(ConfigError::TcpPortCollidesWithHttpListen(port));
    }
    if !seen.insert(port) {
        return Err(ConfigError::DuplicateTcpPort(port));
    }
    Ok(())
}

fn convert_http_route(hostname: &str, route: &RawHttpRoute) -> Result<HttpRoute, ConfigError> {
    let target = pod_or_service(hostname, route.service.as_deref(), route.pod.as_deref())?;
    validate_port(hostname, route.port)?;
    let scheme = match route.scheme.as_deref() {
        None | Some("http") => Scheme::Http,
        Some("https") => Scheme::Https,
        Some(other) => {
            return Err(ConfigError::InvalidListenAddress(format!(
                "route {hostname:?} has unsupported scheme {other:?}"
            )))
        }
    };
    Ok(HttpRoute {
        context: route.context.clone(),
        namespace: route.namespace.clone(),
        target,
        port: route.port,
        scheme,
    })
}

fn convert_tcp_route(port: u16, route: &RawTcpRoute) -> Result<TcpDirectRoute, ConfigError> {
    let key = port.to_string();
    let target = pod_or_service(&key, route.service.as_deref(), route.pod.as_deref())?;
    validate_port(&key, route.port)?;
    Ok(TcpDirectRoute {
        context: route.context.clone(),
        namespace: route.namespace.clone(),
        target,
        port: route.port,
    })
}

fn convert_jump_route(port: u16, route: &RawJumpRoute) -> Result<JumpRoute, ConfigError> {
    let key = port.to_string();
    let target = pod_or_service(&key, route.via.service.as_deref(), route.via.pod.as_deref())?;

    let create_spec = route
        .via
        .create
        .as_ref()
        .map(|c| {
            validate_image_name(&key, &c.image)?;
            Ok(CreatePodSpec {
                image: c.image.clone(),
                command: c.command.clone(),
                timeout: c.timeout,
            })
        })
        .transpose()?;

    let via = JumpVia {
        target,
        container: route.via.container.clone(),
        create_spec,
    };

    validate_target_host(&key, &route.target.host)?;
    validate_port(&key, route.target.port)?;

    let method = match route.method.as_deref() {
        None | Some("socat") => JumpMethod::Socat,
        Some(other) => {
            return Err(ConfigError::InvalidListenAddress(format!(
                "jump route {key:?} has unsupported method {other:?}"
            )))
        }
    };

    Ok(JumpRoute {
        context: route.context.clone(),
        namespace: route.namespace.clone(),
        via,
        target_host: route.target.host.clone(),
        target_port: route.target.port,
        method,
    })
}

fn pod_or_service(key: &str, service: Option<&str>, pod: Option<&str>) -> Result<PodOrService, ConfigError> {
    match (service, pod) {
        (Some(svc), None) => Ok(PodOrService::Service(svc.to_string())),
        (None, Some(pod)) => Ok(PodOrService::Pod(pod.to_string())),
        _ => Err(ConfigError::AmbiguousTarget(key.to_string())),
    }
}

fn validate_port(key: &str, port: u16) -> Result<(), ConfigError> {
    if port == 0 {
        return Err(ConfigError::PortOutOfRange(key.to_string(), port as u32));
    }
    Ok(())
}

/// RFC-1123 hostname or IP literal (IPv4/IPv6, optionally bracketed), ≤253
/// bytes (spec §6).
fn validate_target_host(key: &str, host: &str) -> Result<(), ConfigError> {
    if host.len() > 253 {
        return Err(ConfigError::InvalidTargetHost(key.to_string(), host.to_string()));
    }
    let stripped = host.strip_prefix('[').and_then(|h| h.strip_suffix(']')).unwrap_or(host);
    if stripped.parse::<IpAddr>().is_ok() {
        return Ok(());
    }
    let hostname_re = Regex::new(r"^[A-Za-z0-9]([A-Za-z0-9\-]{0,61}[A-Za-z0-9])?(\.[A-Za-z0-9]([A-Za-z0-9\-]{0,61}[A-Za-z0-9])?)*$").unwrap();
    if hostname_re.is_match(host) {
        Ok(())
    } else {
        Err(ConfigError::InvalidTargetHost(key.to_string(), host.to_string()))
    }
}

/// `^[A-Za-z0-9][A-Za-z0-9._\-/:@]*$`, ≤256 bytes, no shell metacharacters
/// (spec §6).
fn validate_image_name(key: &str, image: &str) -> Result<(), ConfigError> {
    if image.is_empty() || image.len() > 256 {
        return Err(ConfigError::InvalidImageName(key.to_string(), image.to_string()));
    }
    let image_re = Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._\-/:@]*$").unwrap();
    if image_re.is_match(image) {
        Ok(())
    } else {
        Err(ConfigError::InvalidImageName(key.to_string(), image.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{RawHttp, RawHttpK8s, RawTcp, RawTcpK8s};

    fn base_raw() -> RawConfig {
        RawConfig {
            api_version: API_VERSION.to_string(),
            verbose: false,
            auto_reload_config: None,
            exec_path: Vec::new(),
            http: RawHttp {
                listen: "127.0.0.1:8443".to_string(),
                idle_timeout: Duration::from_secs(1800),
                k8s: Some(RawHttpK8s {
                    kubeconfig: None,
                    dynamic_host: None,
                    routes: [(
                        "app.local".to_string(),
                        RawHttpRoute {
                            context: "kind".to_string(),
                            namespace: "default".to_string(),
                            service: Some("app".to_string()),
                            pod: None,
                            port: 80,
                            scheme: None,
                        },
                    )]
                    .into_iter()
                    .collect(),
                }),
            },
            tcp: None,
        }
    }

    #[test]
    fn rejects_wrong_api_version() {
        let mut raw = base_raw();
        raw.api_version = "other/v1".to_string();
        assert!(matches!(validate(raw), Err(ConfigError::UnsupportedApiVersion(_, _))));
    }

    #[test]
    fn rejects_zero_http_idle_timeout() {
        let mut raw = base_raw();
        raw.http.idle_timeout = Duration::ZERO;
        assert!(matches!(validate(raw), Err(ConfigError::InvalidIdleTimeout)));
    }

    #[test]
    fn accepts_a_minimal_valid_document() {
        let cfg = validate(base_raw()).unwrap();
        assert_eq!(cfg.http_routes.len(), 1);
        assert!(cfg.http_routes.contains_key("app.local"));
    }

    #[test]
    fn rejects_route_specifying_both_service_and_pod() {
        let mut raw = base_raw();
        if let Some(k8s) = raw.http.k8s.as_mut() {
            k8s.routes.get_mut("app.local").unwrap().pod = Some("app-0".to_string());
        }
        assert!(matches!(validate(raw), Err(ConfigError::AmbiguousTarget(_))));
    }

    #[test]
    fn rejects_duplicate_tcp_ports_across_routes_and_jump() {
        let mut raw = base_raw();
        raw.tcp = Some(RawTcp {
            idle_timeout: Duration::ZERO,
            k8s: Some(RawTcpK8s {
                routes: [(
                    5432,
                    RawTcpRoute {
                        context: "kind".to_string(),
                        namespace: "default".to_string(),
                        service: Some("db".to_string()),
                        pod: None,
                        port: 5432,
                    },
                )]
                .into_iter()
                .collect(),
                jump: [(
                    5432,
                    RawJumpRoute {
                        context: "kind".to_string(),
                        namespace: "default".to_string(),
                        via: crate::schema::RawJumpVia {
                            pod: Some("jump".to_string()),
                            service: None,
                            container: None,
                            create: None,
                        },
                        target: crate::schema::RawJumpTarget {
                            host: "db.internal".to_string(),
                            port: 5432,
                        },
                        method: None,
                    },
                )]
                .into_iter()
                .collect(),
            }),
        });
        assert!(matches!(validate(raw), Err(ConfigError::DuplicateTcpPort(5432))));
    }

    #[test]
    fn rejects_image_name_with_shell_metacharacters() {
        assert!(validate_image_name("k", "alpine;rm -rf /").is_err());
    }

    #[test]
    fn accepts_a_well_formed_image_reference() {
        assert!(validate_image_name("k", "ghcr.io/org/app:1.2.3").is_ok());
    }

    #[test]
    fn rejects_target_host_exceeding_253_bytes() {
        let long = "a".repeat(254);
        assert!(validate_target_host("k", &long).is_err());
    }

    #[test]
    fn accepts_ipv6_bracketed_target_host() {
        assert!(validate_target_host("k", "[::1]").is_ok());
    }

    #[test]
    fn validation_is_idempotent() {
        let once = validate(base_raw()).unwrap();
        let raw_again = base_raw();
        let twice = validate(raw_again).unwrap();
        assert_eq!(once.http_routes.len(), twice.http_routes.len());
        assert_eq!(once.http_listen, twice.http_listen);
    }
}
