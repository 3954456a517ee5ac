use std::borrow::Cow;

use russh::Preferred;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::config;

/// Security level used for SSH algorithm selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum SecurityLevel {
    /// Modern algorithms only.
    Secure,
    /// Adds SHA-1 and CBC algorithms for old switch firmware (default).
    LegacyCompatible,
}

/// How the server host key is verified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum HostKeyPolicy {
    /// Accept any host key.
    AcceptAny,
    /// Require a matching entry in `~/.ssh/known_hosts`.
    KnownHosts,
}

/// Connection security options for SSH establishment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ConnectionSecurityOptions {
    pub level: SecurityLevel,
    pub host_key: HostKeyPolicy,
}

impl Default for ConnectionSecurityOptions {
    fn default() -> Self {
        Self::legacy_compatible()
    }
}

impl ConnectionSecurityOptions {
    /// Modern algorithms with known-hosts verification.
    pub fn secure_default() -> Self {
        Self {
            level: SecurityLevel::Secure,
            host_key: HostKeyPolicy::KnownHosts,
        }
    }

    /// Broad algorithm support without host key verification.
    pub fn legacy_compatible() -> Self {
        Self {
            level: SecurityLevel::LegacyCompatible,
            host_key: HostKeyPolicy::AcceptAny,
        }
    }

    pub(super) fn preferred(&self) -> Preferred {
        match self.level {
            SecurityLevel::Secure => Preferred {
                kex: Cow::Borrowed(config::SECURE_KEX_ORDER),
                key: Cow::Borrowed(config::SECURE_KEY_TYPES),
                cipher: Cow::Borrowed(config::SECURE_CIPHERS),
                mac: Cow::Borrowed(config::SECURE_MAC_ALGORITHMS),
                compression: Cow::Borrowed(config::DEFAULT_COMPRESSION_ALGORITHMS),
            },
            SecurityLevel::LegacyCompatible => Preferred {
                kex: Cow::Borrowed(config::LEGACY_KEX_ORDER),
                key: Cow::Borrowed(config::LEGACY_KEY_TYPES),
                cipher: Cow::Borrowed(config::LEGACY_CIPHERS),
                mac: Cow::Borrowed(config::LEGACY_MAC_ALGORITHMS),
                compression: Cow::Borrowed(config::DEFAULT_COMPRESSION_ALGORITHMS),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ConnectionSecurityOptions, HostKeyPolicy, SecurityLevel};
    use russh::{cipher, kex, mac};

    #[test]
    fn default_security_options_favour_compatibility() {
        let options = ConnectionSecurityOptions::default();
        assert_eq!(options.level, SecurityLevel::LegacyCompatible);
        assert_eq!(options.host_key, HostKeyPolicy::AcceptAny);
    }

    #[test]
    fn secure_profile_checks_known_hosts() {
        let options = ConnectionSecurityOptions::secure_default();
        assert_eq!(options.level, SecurityLevel::Secure);
        assert_eq!(options.host_key, HostKeyPolicy::KnownHosts);
    }

    #[test]
    fn secure_profile_excludes_weak_algorithms() {
        let preferred = ConnectionSecurityOptions::secure_default().preferred();

        assert!(preferred.kex.iter().all(|alg| *alg != kex::DH_G1_SHA1));
        assert!(preferred.cipher.iter().all(|alg| *alg != cipher::AES_128_CBC));
        assert!(preferred.mac.iter().all(|alg| *alg != mac::HMAC_SHA1));
    }

    #[test]
    fn legacy_profile_keeps_broad_compatibility_algorithms() {
        let preferred = ConnectionSecurityOptions::legacy_compatible().preferred();

        assert!(preferred.kex.contains(&kex::DH_G1_SHA1));
        assert!(preferred.cipher.contains(&cipher::AES_256_CBC));
        assert!(preferred.mac.contains(&mac::HMAC_SHA1));
    }
}
