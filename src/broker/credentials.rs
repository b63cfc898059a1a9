//! Credential collaborator boundary
//!
//! Adapters request credentials by venue name at connect time; the core
//! never stores raw secrets beyond adapter construction.

use crate::error::{Error, Result};

/// API credentials for one venue.
#[derive(Clone)]
pub struct Credentials {
    pub api_key: String,
    pub api_secret: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never leak secrets through Debug output
        f.debug_struct("Credentials")
            .field("api_key", &"***")
            .field("api_secret", &"***")
            .finish()
    }
}

/// Source of venue credentials.
pub trait CredentialSource: Send + Sync {
    fn credentials(&self, venue: &str) -> Result<Credentials>;
}

/// Environment-backed source: `{VENUE}_API_KEY` / `{VENUE}_API_SECRET`
/// (populated from `.env` by `dotenv` in the binary).
pub struct EnvCredentials;

impl CredentialSource for EnvCredentials {
    fn credentials(&self, venue: &str) -> Result<Credentials> {
        let prefix = venue.to_uppercase().replace(['-', '.'], "_");
        let key_var = format!("{}_API_KEY", prefix);
        let secret_var = format!("{}_API_SECRET", prefix);
        let api_key = std::env::var(&key_var)
            .map_err(|_| Error::Config(format!("missing credential env var {}", key_var)))?;
        let api_secret = std::env::var(&secret_var)
            .map_err(|_| Error::Config(format!("missing credential env var {}", secret_var)))?;
        Ok(Credentials {
            api_key,
            api_secret,
        })
    }
}
