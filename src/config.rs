//! Configuration (ambient)
//!
//! `AcmeManagerConfig` is the static configuration the embedding
//! gateway hands to a `Manager` at startup: which directory to use,
//! the account contact, the domain allow-list, and renewal timing.
//!
//! Grounded on `pingclair-core/src/config/loader.rs`'s extension-dispatch
//! loader; the Caddyfile-style `.pingclair` format that crate supports has
//! no counterpart here since this configuration has no routing language.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::acme::{LETSENCRYPT_PRODUCTION, LETSENCRYPT_STAGING};
use crate::error::{Error, Result};

fn default_renewal_days() -> u32 {
    30
}

fn default_directory_url() -> String {
    LETSENCRYPT_PRODUCTION.to_string()
}

/// Static configuration for an ACME certificate manager instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcmeManagerConfig {
    /// Contact email registered with the ACME account, if any.
    #[serde(default)]
    pub contact_email: Option<String>,

    /// ACME directory URL. Defaults to Let's Encrypt production; set to
    /// `staging` as shorthand for Let's Encrypt's staging directory.
    #[serde(default = "default_directory_url")]
    pub directory_url: String,

    /// Host allow-list (exact domains and `*.suffix` wildcards). An
    /// empty list allows every host.
    #[serde(default)]
    pub domains: Vec<String>,

    /// Renew a certificate once fewer than this many days remain
    /// before expiry.
    #[serde(default = "default_renewal_days")]
    pub renewal_days: u32,
}

impl Default for AcmeManagerConfig {
    fn default() -> Self {
        Self {
            contact_email: None,
            directory_url: default_directory_url(),
            domains: Vec::new(),
            renewal_days: default_renewal_days(),
        }
    }
}

impl AcmeManagerConfig {
    /// Resolves `directory_url`, expanding the `staging` shorthand.
    pub fn resolved_directory_url(&self) -> &str {
        match self.directory_url.as_str() {
            "staging" => LETSENCRYPT_STAGING,
            other => other,
        }
    }
}

/// Loads an `AcmeManagerConfig` from a file, dispatching on extension.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Loads configuration from `path`. Supports `.toml` and `.json`;
    /// any other (or missing) extension is an error.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<AcmeManagerConfig> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file: {e}")))?;

        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        match ext {
            "toml" => Self::from_toml(&content),
            "json" => Self::from_json(&content),
            other => Err(Error::Config(format!("unsupported config format: {other}"))),
        }
    }

    /// Parses TOML configuration content.
    pub fn from_toml(content: &str) -> Result<AcmeManagerConfig> {
        toml::from_str(content).map_err(|e| Error::Config(format!("invalid TOML: {e}")))
    }

    /// Parses JSON configuration content.
    pub fn from_json(content: &str) -> Result<AcmeManagerConfig> {
        serde_json::from_str(content).map_err(|e| Error::Config(format!("invalid JSON: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_allow_every_host_against_production() {
        let config = AcmeManagerConfig::default();
        assert!(config.domains.is_empty());
        assert_eq!(config.resolved_directory_url(), LETSENCRYPT_PRODUCTION);
    }

    #[test]
    fn staging_shorthand_resolves() {
        let config = AcmeManagerConfig {
            directory_url: "staging".to_string(),
            ..Default::default()
        };
        assert_eq!(config.resolved_directory_url(), LETSENCRYPT_STAGING);
    }

    #[test]
    fn toml_round_trip() {
        let toml_src = r#"
            contact_email = "ops@example.test"
            domains = ["example.test", "*.example.test"]
            renewal_days = 21
        "#;
        let config = ConfigLoader::from_toml(toml_src).unwrap();
        assert_eq!(config.contact_email.as_deref(), Some("ops@example.test"));
        assert_eq!(config.domains, vec!["example.test", "*.example.test"]);
        assert_eq!(config.renewal_days, 21);
        assert_eq!(config.resolved_directory_url(), LETSENCRYPT_PRODUCTION);
    }

    #[test]
    fn json_round_trip() {
        let json_src = r#"{"domains": ["example.test"], "directory_url": "staging"}"#;
        let config = ConfigLoader::from_json(json_src).unwrap();
        assert_eq!(config.domains, vec!["example.test"]);
        assert_eq!(config.resolved_directory_url(), LETSENCRYPT_STAGING);
    }

    #[test]
    fn unknown_extension_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "domains: []").unwrap();
        let err = ConfigLoader::load(&path).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
