use russh::client::Handler;
use russh::keys::{HashAlg, PublicKey, PublicKeyBase64};
use tracing::{info, warn};

/// Host key policy for the SSH session.
///
/// With an allow list, the server key must match one entry, given either as an OpenSSH
/// `SHA256:` fingerprint or as the base64 public key. Without one every key is accepted.
pub(crate) struct HostKeyCheck {
    pub allowed: Option<Vec<String>>,
}

impl HostKeyCheck {
    fn accepts(&self, fingerprint: &str, key_b64: &str) -> bool {
        match &self.allowed {
            Some(allowed) => allowed.iter().any(|s| s == fingerprint || s == key_b64),
            None => true,
        }
    }
}

impl Handler for HostKeyCheck {
    type Error = anyhow::Error;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        let fingerprint = server_public_key.fingerprint(HashAlg::Sha256).to_string();
        let key_b64 = server_public_key.public_key_base64();
        let ok = self.accepts(&fingerprint, &key_b64);
        match (&self.allowed, ok) {
            (None, _) => warn!(%fingerprint, "accepting server key without an allow list"),
            (Some(_), true) => info!(%fingerprint, "server key accepted"),
            (Some(_), false) => warn!(%fingerprint, "server key not in allow list"),
        }
        Ok(ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allow_list_matches_fingerprint_or_key() {
        let check = HostKeyCheck {
            allowed: Some(vec!["SHA256:abc".into(), "AAAAkey".into()]),
        };
        assert!(check.accepts("SHA256:abc", "other"));
        assert!(check.accepts("SHA256:zzz", "AAAAkey"));
        assert!(!check.accepts("SHA256:zzz", "other"));
        assert!(HostKeyCheck { allowed: None }.accepts("x", "y"));
    }
}
