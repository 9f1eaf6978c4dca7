/// Security and cryptography utilities.
///
/// - Envelope encryption (AES-256-GCM) for secrets stored at rest.
/// - Admin secret day-tokens (AES-256-CBC) for the web bridge's admin login.
pub mod crypto;

pub use crypto::{
    admin_secret_token, derive_admin_secret_key, verify_admin_secret_token, EnvelopeEncryptor,
};

#[cfg(feature = "tls")]
pub mod tls;

#[cfg(feature = "tls")]
pub use tls::build_rustls_config;
