//! Configuration validation: catches insecure or inconsistent settings
//! before the process binds a port (§10.3).

use super::Config;
use std::path::Path;

/// Validates security-sensitive configuration. Called unconditionally by
/// [`super::loader::load`] (warn-only) and again by `main` (hard failure) so
/// `--validate-config` and normal startup share one source of truth.
pub fn validate_config_security(config: &Config) -> anyhow::Result<()> {
    let is_prod = is_production_mode();

    if config.security.session_secret.trim().is_empty() {
        if is_prod {
            anyhow::bail!(
                "SESSION_SECRET must be set in production: the admin login cookie is signed \
                 with it and an empty secret lets any client forge a session."
            );
        }
        eprintln!("WARNING: SESSION_SECRET is empty; admin sessions are insecure in this mode.");
    }

    if config.enable_web_server
        && config.security.admin_secret.trim().is_empty()
        && !config.security.admin_name.is_empty()
    {
        eprintln!(
            "WARNING: ADMIN_NAME is set but ADMIN_SECRET is empty; the \
             X-Admin-Secret bypass token cannot be minted for this deployment."
        );
    }

    if config.federation.enabled && config.federation.secret.trim().is_empty() {
        anyhow::bail!(
            "FEDERATION_SECRET must be set when federation is enabled: every federation \
             endpoint authorizes callers against it."
        );
    }

    if config.federation.enabled && config.federation.node_url.trim().is_empty() {
        anyhow::bail!(
            "FEDERATION_NODE_URL must be set when federation is enabled: peers use it to \
             call back into this node."
        );
    }

    if config.auth.token_length == 0 {
        anyhow::bail!("auth.token_length must be greater than zero");
    }

    if config.security.transport.tls.enabled {
        let tls = &config.security.transport.tls;
        let cert_path = tls
            .certificate_path
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .ok_or_else(|| anyhow::anyhow!("security.transport.tls.certificate_path must be set when TLS is enabled"))?;
        if !Path::new(cert_path).exists() {
            anyhow::bail!("TLS certificate file not found at {cert_path}");
        }
        let key_path = tls
            .private_key_path
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .ok_or_else(|| anyhow::anyhow!("security.transport.tls.private_key_path must be set when TLS is enabled"))?;
        if !Path::new(key_path).exists() {
            anyhow::bail!("TLS private key file not found at {key_path}");
        }
    }

    if !config.tcp_enabled && !config.enable_web_server {
        anyhow::bail!("at least one of TCP_ENABLED or ENABLE_WEB_SERVER must be true");
    }

    Ok(())
}

/// Detect if we're running in production mode via a conventional
/// environment flag; used to decide whether missing secrets are fatal.
#[must_use]
pub fn is_production_mode() -> bool {
    use std::env;
    match env::var("ENVIRONMENT") {
        Ok(v) => {
            let v = v.to_ascii_lowercase();
            v == "production" || v == "prod"
        }
        Err(_) => env::var("PRODUCTION").is_ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_session_secret_is_warn_only_outside_production() {
        let cfg = Config::default();
        assert!(validate_config_security(&cfg).is_ok());
    }

    #[test]
    fn federation_enabled_without_secret_is_fatal() {
        let mut cfg = Config::default();
        cfg.federation.enabled = true;
        cfg.federation.node_url = "https://node-a.example".into();
        assert!(validate_config_security(&cfg).is_err());
    }

    #[test]
    fn disabling_both_listeners_is_fatal() {
        let mut cfg = Config::default();
        cfg.tcp_enabled = false;
        cfg.enable_web_server = false;
        assert!(validate_config_security(&cfg).is_err());
    }
}
