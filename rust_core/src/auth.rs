//! Identity-claim verification and session tokens.
//!
//! The upstream identity provider (Telegram login widget) signs attested user
//! claims with HMAC-SHA256 over a shared secret. We verify the claim, then
//! mint our own session token the gateway can re-verify statelessly.

use anyhow::{anyhow, Result};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

/// Claims older than this are rejected outright.
pub const MAX_CLAIM_AGE_SECS: i64 = 86_400;

/// Signed identity claim as posted by the login widget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityClaim {
    pub id: i64,
    pub first_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub photo_url: Option<String>,
    pub auth_date: i64,
    pub hash: String,
}

impl IdentityClaim {
    /// All fields except `hash`, sorted by key, joined "k=v" with newlines.
    fn data_check_string(&self) -> String {
        let mut fields: Vec<(&str, String)> = vec![
            ("auth_date", self.auth_date.to_string()),
            ("first_name", self.first_name.clone()),
            ("id", self.id.to_string()),
        ];
        if let Some(ref v) = self.last_name {
            fields.push(("last_name", v.clone()));
        }
        if let Some(ref v) = self.photo_url {
            fields.push(("photo_url", v.clone()));
        }
        if let Some(ref v) = self.username {
            fields.push(("username", v.clone()));
        }
        fields.sort_by(|a, b| a.0.cmp(b.0));
        fields
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Verifier over the identity provider's shared secret.
#[derive(Clone)]
pub struct AuthVerifier {
    secret: Vec<u8>,
}

impl AuthVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            secret: secret.as_bytes().to_vec(),
        }
    }

    /// Verify the claim signature and freshness.
    ///
    /// The signing key is SHA-256 of the shared secret; the signature is
    /// HMAC-SHA256 over the sorted data-check string, hex-encoded.
    pub fn verify_claim(&self, claim: &IdentityClaim, now_secs: i64) -> Result<()> {
        if now_secs - claim.auth_date > MAX_CLAIM_AGE_SECS {
            return Err(anyhow!("Identity claim expired"));
        }

        let secret_key = Sha256::digest(&self.secret);
        let mut mac = HmacSha256::new_from_slice(&secret_key)
            .map_err(|e| anyhow!("Failed to build HMAC: {}", e))?;
        mac.update(claim.data_check_string().as_bytes());

        let expected = hex::decode(&claim.hash)
            .map_err(|_| anyhow!("Identity claim hash is not valid hex"))?;
        mac.verify_slice(&expected)
            .map_err(|_| anyhow!("Identity claim signature mismatch"))?;

        Ok(())
    }

    /// Session token bound to `(user_id, auth_date)`.
    pub fn session_token(&self, user_id: i64, auth_date: i64) -> String {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .expect("HMAC accepts any key length");
        mac.update(format!("{}:{}", user_id, auth_date).as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Re-verify a token presented over the WebSocket `auth` message.
    pub fn verify_session_token(&self, token: &str, user_id: i64, auth_date: i64) -> bool {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .expect("HMAC accepts any key length");
        mac.update(format!("{}:{}", user_id, auth_date).as_bytes());
        match hex::decode(token) {
            Ok(decoded) => mac.verify_slice(&decoded).is_ok(),
            Err(_) => false,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn sign_claim(secret: &str, claim: &mut IdentityClaim) {
        let secret_key = Sha256::digest(secret.as_bytes());
        let mut mac = HmacSha256::new_from_slice(&secret_key).unwrap();
        mac.update(claim.data_check_string().as_bytes());
        claim.hash = hex::encode(mac.finalize().into_bytes());
    }

    fn test_claim(auth_date: i64) -> IdentityClaim {
        IdentityClaim {
            id: 424242,
            first_name: "Ada".to_string(),
            last_name: None,
            username: Some("ada_l".to_string()),
            photo_url: None,
            auth_date,
            hash: String::new(),
        }
    }

    #[test]
    fn test_data_check_string_sorted_without_hash() {
        let claim = test_claim(1_700_000_000);
        let dcs = claim.data_check_string();
        assert_eq!(
            dcs,
            "auth_date=1700000000\nfirst_name=Ada\nid=424242\nusername=ada_l"
        );
        assert!(!dcs.contains("hash"));
    }

    #[test]
    fn test_verify_valid_claim() {
        let verifier = AuthVerifier::new("top-secret");
        let mut claim = test_claim(1_700_000_000);
        sign_claim("top-secret", &mut claim);
        assert!(verifier.verify_claim(&claim, 1_700_000_100).is_ok());
    }

    #[test]
    fn test_reject_tampered_claim() {
        let verifier = AuthVerifier::new("top-secret");
        let mut claim = test_claim(1_700_000_000);
        sign_claim("top-secret", &mut claim);
        claim.first_name = "Eve".to_string();
        assert!(verifier.verify_claim(&claim, 1_700_000_100).is_err());
    }

    #[test]
    fn test_reject_wrong_secret() {
        let verifier = AuthVerifier::new("top-secret");
        let mut claim = test_claim(1_700_000_000);
        sign_claim("other-secret", &mut claim);
        assert!(verifier.verify_claim(&claim, 1_700_000_100).is_err());
    }

    #[test]
    fn test_reject_stale_claim() {
        let verifier = AuthVerifier::new("top-secret");
        let mut claim = test_claim(1_700_000_000);
        sign_claim("top-secret", &mut claim);
        let later = 1_700_000_000 + MAX_CLAIM_AGE_SECS + 1;
        assert!(verifier.verify_claim(&claim, later).is_err());
    }

    #[test]
    fn test_session_token_round_trip() {
        let verifier = AuthVerifier::new("top-secret");
        let token = verifier.session_token(424242, 1_700_000_000);
        assert!(verifier.verify_session_token(&token, 424242, 1_700_000_000));
        assert!(!verifier.verify_session_token(&token, 424243, 1_700_000_000));
        assert!(!verifier.verify_session_token(&token, 424242, 1_700_000_001));
        assert!(!verifier.verify_session_token("not-hex", 424242, 1_700_000_000));
    }
}
