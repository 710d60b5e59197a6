//! Session credentials minted for resolved identities.
//!
//! Token format: `<hex(payload)>.<hex(hmac)>` where payload is
//! `identity_id:expiry_unix_secs`, signed with HMAC-SHA256.

use crate::types::IdentityId;
use chrono::{DateTime, Duration, TimeZone, Utc};
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Default credential lifetime.
pub const DEFAULT_CREDENTIAL_TTL_SECS: i64 = 7 * 24 * 60 * 60;

#[derive(Error, Debug, PartialEq)]
pub enum CredentialError {
    #[error("signing key rejected")]
    InvalidKey,
    #[error("credential lifetime out of range")]
    TtlOutOfRange,
    #[error("malformed credential")]
    Malformed,
    #[error("credential signature mismatch")]
    BadSignature,
    #[error("credential expired at {0}")]
    Expired(DateTime<Utc>),
}

/// Opaque signed token with expiry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Credential {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// Mints a signed session credential for a resolved identity.
pub trait CredentialIssuer: Send + Sync {
    fn issue(&self, identity: &IdentityId) -> Result<Credential, CredentialError>;
}

/// HMAC-SHA256 credential issuer with a symmetric key.
pub struct HmacCredentialIssuer {
    key: [u8; 32],
    ttl: Duration,
}

impl HmacCredentialIssuer {
    pub fn new(key: [u8; 32], ttl: Duration) -> Self {
        Self { key, ttl }
    }

    /// Issuer with a random key. Tokens do not survive a restart.
    pub fn ephemeral(ttl: Duration) -> Self {
        let mut key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        Self::new(key, ttl)
    }

    /// Parse a 64-character hex key.
    pub fn from_hex_key(hex_key: &str, ttl: Duration) -> Result<Self, CredentialError> {
        let bytes = hex::decode(hex_key.trim()).map_err(|_| CredentialError::InvalidKey)?;
        let key: [u8; 32] = bytes.try_into().map_err(|_| CredentialError::InvalidKey)?;
        Ok(Self::new(key, ttl))
    }

    fn sign(&self, payload: &[u8]) -> Result<HmacSha256, CredentialError> {
        let mut mac = HmacSha256::new_from_slice(&self.key).map_err(|_| CredentialError::InvalidKey)?;
        mac.update(payload);
        Ok(mac)
    }

    fn issue_at(&self, identity: &IdentityId, now: DateTime<Utc>) -> Result<Credential, CredentialError> {
        let expires_at = now
            .checked_add_signed(self.ttl)
            .ok_or(CredentialError::TtlOutOfRange)?;
        let payload = format!("{}:{}", identity, expires_at.timestamp());
        let signature = self.sign(payload.as_bytes())?.finalize().into_bytes();
        Ok(Credential {
            token: format!("{}.{}", hex::encode(payload.as_bytes()), hex::encode(signature)),
            expires_at,
        })
    }

    /// Verify a token and return the identity it was minted for.
    pub fn verify(&self, token: &str) -> Result<IdentityId, CredentialError> {
        self.verify_at(token, Utc::now())
    }

    fn verify_at(&self, token: &str, now: DateTime<Utc>) -> Result<IdentityId, CredentialError> {
        let (payload_hex, sig_hex) = token.split_once('.').ok_or(CredentialError::Malformed)?;
        let payload = hex::decode(payload_hex).map_err(|_| CredentialError::Malformed)?;
        let signature = hex::decode(sig_hex).map_err(|_| CredentialError::Malformed)?;

        self.sign(&payload)?
            .verify_slice(&signature)
            .map_err(|_| CredentialError::BadSignature)?;

        let payload = String::from_utf8(payload).map_err(|_| CredentialError::Malformed)?;
        let (id, expiry) = payload.split_once(':').ok_or(CredentialError::Malformed)?;
        let expiry: i64 = expiry.parse().map_err(|_| CredentialError::Malformed)?;
        let expires_at = Utc
            .timestamp_opt(expiry, 0)
            .single()
            .ok_or(CredentialError::Malformed)?;
        if now > expires_at {
            return Err(CredentialError::Expired(expires_at));
        }
        id.parse().map_err(|_| CredentialError::Malformed)
    }
}

impl CredentialIssuer for HmacCredentialIssuer {
    fn issue(&self, identity: &IdentityId) -> Result<Credential, CredentialError> {
        self.issue_at(identity, Utc::now())
    }
}
