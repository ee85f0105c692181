//! Dynamic hostname parsing (spec §4.5.1).
//!
//! When a requested HTTP hostname has no matching route in the config
//! snapshot, `TunnelManager::get_or_open` falls back to trying to parse it
//! as a dynamic hostname of the form:
//!
//! ```text
//! {name}-{port}.svc.{namespace}.ns.{context}.cx.{dyn}
//! {name}-{port}.pod.{namespace}.ns.{context}.cx.{dyn}
//! ```
//!
//! where `{dyn}` is the configured suffix (`http.k8s.dynamic_host`).

use thiserror::Error;

use crate::types::PodOrService;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DynamicHostnameError {
    #[error("hostname does not end in the configured dynamic suffix")]
    SuffixMismatch,
    #[error("hostname has no `.ns.` segment separating context from the rest")]
    MissingNamespaceSeparator,
    #[error("hostname has neither a `.svc.` nor a `.pod.` segment")]
    MissingKindSeparator,
    #[error("`{{name}}-{{port}}` segment has no `-` separator")]
    MissingNamePortSeparator,
    #[error("port segment `{0}` does not parse as an integer in [1, 65535]")]
    InvalidPort(String),
    #[error("name, namespace, or context segment is empty")]
    EmptySegment,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedDynamicHost {
    pub context: String,
    pub namespace: String,
    pub target: PodOrService,
    pub port: u16,
}

/// Parses `host` against the dynamic-hostname grammar, right-anchored on
/// `.cx.{dyn_suffix}`.
pub fn parse_dynamic_hostname(
    host: &str,
    dyn_suffix: &str,
) -> Result<ResolvedDynamicHost, DynamicHostnameError> {
    let cx_suffix = format!(".cx.{dyn_suffix}");
    let prefix = host
        .strip_suffix(&cx_suffix)
        .ok_or(DynamicHostnameError::SuffixMismatch)?;

    let (before_ns, context) = rsplit_on(prefix, ".ns.")
        .ok_or(DynamicHostnameError::MissingNamespaceSeparator)?;

    let (name_port, namespace, target_of) = if let Some((left, namespace)) =
        rsplit_on(before_ns, ".svc.")
    {
        (left, namespace, PodOrService::Service as fn(String) -> PodOrService)
    } else if let Some((left, namespace)) = rsplit_on(before_ns, ".pod.") {
        (left, namespace, PodOrService::Pod as fn(String) -> PodOrService)
    } else {
        return Err(DynamicHostnameError::MissingKindSeparator);
    };

    let dash = name_port
        .rfind('-')
        .ok_or(DynamicHostnameError::MissingNamePortSeparator)?;
    let (name, port_str) = (&name_port[..dash], &name_port[dash + 1..]);

    let port: u16 = port_str
        .parse()
        .ok()
        .filter(|&p: &u16| p >= 1)
        .ok_or_else(|| DynamicHostnameError::InvalidPort(port_str.to_string()))?;

    if name.is_empty() || namespace.is_empty() || context.is_empty() {
        return Err(DynamicHostnameError::EmptySegment);
    }

    Ok(ResolvedDynamicHost {
        context: context.to_string(),
        namespace: namespace.to_string(),
        target: target_of(name.to_string()),
        port,
    })
}

/// Splits `s` on the rightmost occurrence of `sep`, returning `(before,
/// after)` with `sep` itself excluded from both halves.
fn rsplit_on<'a>(s: &'a str, sep: &str) -> Option<(&'a str, &'a str)> {
    let idx = s.rfind(sep)?;
    Some((&s[..idx], &s[idx + sep.len()..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_service_host() {
        let resolved =
            parse_dynamic_hostname("web-8080.svc.default.ns.prod.cx.k8s.localhost", "k8s.localhost")
                .unwrap();
        assert_eq!(resolved.context, "prod");
        assert_eq!(resolved.namespace, "default");
        assert_eq!(resolved.target, PodOrService::Service("web".into()));
        assert_eq!(resolved.port, 8080);
    }

    #[test]
    fn parses_pod_host() {
        let resolved = parse_dynamic_hostname(
            "debugger-22.pod.tools.ns.staging.cx.k8s.localhost",
            "k8s.localhost",
        )
        .unwrap();
        assert_eq!(resolved.target, PodOrService::Pod("debugger".into()));
        assert_eq!(resolved.port, 22);
    }

    #[test]
    fn name_with_internal_dash_uses_rightmost_split() {
        let resolved = parse_dynamic_hostname(
            "my-app-9000.svc.default.ns.prod.cx.k8s.localhost",
            "k8s.localhost",
        )
        .unwrap();
        assert_eq!(resolved.target, PodOrService::Service("my-app".into()));
        assert_eq!(resolved.port, 9000);
    }

    #[test]
    fn wrong_suffix_is_rejected() {
        let err = parse_dynamic_hostname("web-80.svc.default.ns.prod.cx.other", "k8s.localhost")
            .unwrap_err();
        assert_eq!(err, DynamicHostnameError::SuffixMismatch);
    }

    #[test]
    fn invalid_port_is_rejected() {
        let err = parse_dynamic_hostname(
            "web-notaport.svc.default.ns.prod.cx.k8s.localhost",
            "k8s.localhost",
        )
        .unwrap_err();
        assert!(matches!(err, DynamicHostnameError::InvalidPort(_)));
    }

    #[test]
    fn port_zero_is_rejected() {
        let err =
            parse_dynamic_hostname("web-0.svc.default.ns.prod.cx.k8s.localhost", "k8s.localhost")
                .unwrap_err();
        assert!(matches!(err, DynamicHostnameError::InvalidPort(_)));
    }

    #[test]
    fn missing_kind_separator_is_rejected() {
        let err = parse_dynamic_hostname("web-80.default.ns.prod.cx.k8s.localhost", "k8s.localhost")
            .unwrap_err();
        assert_eq!(err, DynamicHostnameError::MissingKindSeparator);
    }
}
