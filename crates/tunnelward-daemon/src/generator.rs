//! Tunnel config validation and client command-line generation.

use tunnelward_core::TunnelConfig;

use crate::error::{Result, TunnelError};

/// Maximum length of a single DNS label.
const MAX_LABEL_LEN: usize = 63;

/// Check a config's structural rules before it reaches the process layer.
pub fn validate(config: &TunnelConfig) -> Result<()> {
    if config.local_host.trim().is_empty() {
        return Err(invalid("local host must not be empty"));
    }
    if config.local_port == 0 {
        return Err(invalid("local port must be positive"));
    }
    if config.server_addr.trim().is_empty() {
        return Err(invalid("server address must not be empty"));
    }
    if config.server_port == 0 {
        return Err(invalid("server port must be positive"));
    }
    if config.proxy_name.trim().is_empty() {
        return Err(invalid("proxy name must not be empty"));
    }
    if config.proxy_name.chars().any(char::is_whitespace) {
        return Err(invalid("proxy name must not contain whitespace"));
    }
    if let Some(subdomain) = &config.subdomain
        && !is_dns_label(subdomain)
    {
        return Err(invalid(&format!("subdomain {subdomain:?} is not a valid DNS label")));
    }
    if let Some(token) = &config.token
        && token.is_empty()
    {
        return Err(invalid("token must not be empty when set"));
    }
    Ok(())
}

pub fn is_valid(config: &TunnelConfig) -> bool {
    validate(config).is_ok()
}

/// Ordered argument list for the client binary.
///
/// The order is fixed so that identical configs always produce identical
/// invocations.
pub fn build_arguments(config: &TunnelConfig) -> Vec<String> {
    let mut args = vec![
        "--server-addr".to_string(),
        config.server_addr.clone(),
        "--server-port".to_string(),
        config.server_port.to_string(),
        "--proxy-name".to_string(),
        config.proxy_name.clone(),
        "--local-ip".to_string(),
        config.local_host.clone(),
        "--local-port".to_string(),
        config.local_port.to_string(),
        "--protocol".to_string(),
        config.protocol.to_string(),
    ];

    if let Some(subdomain) = &config.subdomain {
        args.push("--subdomain".to_string());
        args.push(subdomain.clone());
    }
    if let Some(token) = &config.token {
        args.push("--token".to_string());
        args.push(token.clone());
    }
    if config.use_tls {
        args.push("--tls".to_string());
    }
    if config.use_compression {
        args.push("--compression".to_string());
    }
    if config.use_encryption {
        args.push("--encryption".to_string());
    }

    args.push("--log-level".to_string());
    args.push(config.log_level.to_string());
    args
}

fn is_dns_label(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= MAX_LABEL_LEN
        && !s.starts_with('-')
        && !s.ends_with('-')
        && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
}

fn invalid(reason: &str) -> TunnelError {
    TunnelError::ConfigInvalid(reason.to_string())
}
