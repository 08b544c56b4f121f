//! Bearer credentials for the realtime-hub handshake.
//!
//! A token embeds the instance name it grants access to plus an expiry,
//! signed with HMAC-SHA256 over the gateway secret. Shape:
//! `<urlencoded instance>:<unix expiry>:<hex signature>`.

use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::Duration;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("malformed token")]
    Malformed,
    #[error("token expired")]
    Expired,
    #[error("bad signature")]
    BadSignature,
}

#[derive(Clone)]
pub struct TokenKeeper {
    secret: Vec<u8>,
}

impl TokenKeeper {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    fn signature(&self, payload: &str) -> Vec<u8> {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .unwrap_or_else(|_| unreachable!("hmac accepts any key length"));
        mac.update(payload.as_bytes());
        mac.finalize().into_bytes().to_vec()
    }

    /// Mints a token granting hub access to `instance` for `ttl`.
    pub fn mint(&self, instance: &str, ttl: Duration) -> String {
        let expiry = Utc::now().timestamp() + ttl.as_secs() as i64;
        let encoded = urlencoding::encode(instance);
        let payload = format!("{encoded}:{expiry}");
        let signature = hex::encode(self.signature(&payload));
        format!("{payload}:{signature}")
    }

    /// Verifies signature and expiry; returns the embedded instance name.
    pub fn verify(&self, token: &str) -> Result<String, TokenError> {
        let mut parts = token.rsplitn(3, ':');
        let signature = parts.next().ok_or(TokenError::Malformed)?;
        let expiry = parts.next().ok_or(TokenError::Malformed)?;
        let encoded_instance = parts.next().ok_or(TokenError::Malformed)?;

        let payload = format!("{encoded_instance}:{expiry}");
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .unwrap_or_else(|_| unreachable!("hmac accepts any key length"));
        mac.update(payload.as_bytes());
        let raw_signature = hex::decode(signature).map_err(|_| TokenError::BadSignature)?;
        mac.verify_slice(&raw_signature)
            .map_err(|_| TokenError::BadSignature)?;

        let expiry: i64 = expiry.parse().map_err(|_| TokenError::Malformed)?;
        if expiry < Utc::now().timestamp() {
            return Err(TokenError::Expired);
        }

        let instance = urlencoding::decode(encoded_instance)
            .map_err(|_| TokenError::Malformed)?
            .into_owned();
        if instance.is_empty() {
            return Err(TokenError::Malformed);
        }
        Ok(instance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mint_verify_roundtrip() {
        let keeper = TokenKeeper::new("super-secret");
        let token = keeper.mint("shop1", Duration::from_secs(60));
        assert_eq!(keeper.verify(&token).unwrap(), "shop1");
    }

    #[test]
    fn instance_names_with_separators_survive_encoding() {
        let keeper = TokenKeeper::new("super-secret");
        let token = keeper.mint("shop:one", Duration::from_secs(60));
        assert_eq!(keeper.verify(&token).unwrap(), "shop:one");
    }

    #[test]
    fn tampered_tokens_are_rejected() {
        let keeper = TokenKeeper::new("super-secret");
        let token = keeper.mint("shop1", Duration::from_secs(60));

        let mut forged = token.clone();
        forged.replace_range(..5, "shop2");
        assert!(keeper.verify(&forged).is_err());

        let other_keeper = TokenKeeper::new("different-secret");
        assert_eq!(
            other_keeper.verify(&token).unwrap_err(),
            TokenError::BadSignature
        );
    }

    #[test]
    fn expired_tokens_are_rejected() {
        let keeper = TokenKeeper::new("super-secret");
        let token = keeper.mint("shop1", Duration::from_secs(0));
        // Zero TTL: expiry equals "now" at mint time, so step past it.
        std::thread::sleep(std::time::Duration::from_millis(1100));
        assert_eq!(keeper.verify(&token).unwrap_err(), TokenError::Expired);
    }

    #[test]
    fn garbage_is_malformed() {
        let keeper = TokenKeeper::new("super-secret");
        assert_eq!(keeper.verify("").unwrap_err(), TokenError::Malformed);
        assert!(keeper.verify("a:b").is_err());
        assert!(keeper.verify("no separators at all").is_err());
    }
}
