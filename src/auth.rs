// SPDX-FileCopyrightText: Copyright (c) 2024-2025 gpupool contributors
// SPDX-License-Identifier: Apache-2.0

//! Capability tokens.
//!
//! A token is `base64url(claims-json) "." base64url(ed25519-signature)`,
//! with the expiry embedded in the claims as Unix milliseconds. Server
//! tokens carry `serverURL` + `fullPermissions` and live about a minute;
//! user tokens carry a username and either full permissions or an endpoint
//! allow-list.

use std::time::Duration;

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const SERVER_TOKEN_TTL: Duration = Duration::from_secs(60);
pub const USER_TOKEN_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing or malformed token")]
    Malformed,
    #[error("invalid signature")]
    Signature,
    #[error("token expired")]
    Expired,
    #[error("insufficient permissions")]
    Forbidden,
    #[error("unknown peer")]
    UnknownPeer,
}

impl AuthError {
    /// 401 for identity failures, 403 for permission failures.
    pub fn status(&self) -> u16 {
        match self {
            AuthError::Forbidden => 403,
            _ => 401,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    #[serde(rename = "serverURL", default, skip_serializing_if = "Option::is_none")]
    pub server_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(rename = "fullPermissions", default)]
    pub full_permissions: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoints: Option<Vec<String>>,
    /// Expiry, Unix milliseconds.
    pub exp: i64,
}

impl Claims {
    pub fn server(server_url: &str) -> Self {
        Self {
            server_url: Some(server_url.to_string()),
            full_permissions: true,
            ..Default::default()
        }
    }

    pub fn user(username: &str) -> Self {
        Self {
            username: Some(username.to_string()),
            ..Default::default()
        }
    }

    pub fn with_full_permissions(mut self) -> Self {
        self.full_permissions = true;
        self
    }

    pub fn with_endpoints(mut self, endpoints: Vec<String>) -> Self {
        self.endpoints = Some(endpoints);
        self
    }

    /// Endpoint capability check. Full permissions open everything;
    /// otherwise the endpoint must be on the allow-list.
    pub fn allows(&self, endpoint: &str) -> bool {
        self.full_permissions
            || self
                .endpoints
                .as_ref()
                .map(|list| list.iter().any(|e| e == endpoint))
                .unwrap_or(false)
    }
}

/// This server's signing identity.
pub struct Keypair {
    signing: SigningKey,
}

impl Keypair {
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::generate(&mut rand::rngs::OsRng),
        }
    }

    pub fn from_base64(private_key: &str) -> crate::Result<Self> {
        let bytes = STANDARD.decode(private_key)?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| crate::error!("private key must be 32 bytes"))?;
        Ok(Self {
            signing: SigningKey::from_bytes(&bytes),
        })
    }

    pub fn public_base64(&self) -> String {
        STANDARD.encode(self.signing.verifying_key().as_bytes())
    }

    pub fn private_base64(&self) -> String {
        STANDARD.encode(self.signing.to_bytes())
    }

    /// Short stable identifier derived from the public key.
    pub fn account_id(&self) -> String {
        let digest = Sha256::digest(self.signing.verifying_key().as_bytes());
        let mut hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
        hex.truncate(16);
        hex
    }

    /// Sign claims with an expiry `ttl` from now.
    pub fn sign_claims(&self, mut claims: Claims, ttl: Duration) -> crate::Result<String> {
        claims.exp = chrono::Utc::now().timestamp_millis() + ttl.as_millis() as i64;
        let body = serde_json::to_vec(&claims)?;
        let signature = self.signing.sign(&body);
        Ok(format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(&body),
            URL_SAFE_NO_PAD.encode(signature.to_bytes())
        ))
    }

    /// Convenience: a fresh full-permission server token.
    pub fn server_token(&self, server_url: &str) -> crate::Result<String> {
        self.sign_claims(Claims::server(server_url), SERVER_TOKEN_TTL)
    }
}

/// A registered user as persisted in the users collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    #[serde(rename = "passwordHash")]
    pub password_hash: String,
    #[serde(rename = "fullPermissions", default)]
    pub full_permissions: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoints: Option<Vec<String>>,
}

impl UserRecord {
    pub fn new(password: &str) -> Self {
        Self {
            password_hash: hash_password(password),
            full_permissions: false,
            endpoints: None,
        }
    }

    pub fn check_password(&self, password: &str) -> bool {
        self.password_hash == hash_password(password)
    }

    /// Claims for this user's login token.
    pub fn claims(&self, username: &str) -> Claims {
        let mut claims = Claims::user(username);
        claims.full_permissions = self.full_permissions;
        claims.endpoints = self.endpoints.clone();
        claims
    }
}

pub fn hash_password(password: &str) -> String {
    Sha256::digest(password.as_bytes())
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Verify a token against a base64 public key. Signature check first, then
/// expiry, then hand the claims back for permission checks.
pub fn verify(token: &str, public_key: &str) -> Result<Claims, AuthError> {
    let (body_b64, sig_b64) = token.split_once('.').ok_or(AuthError::Malformed)?;
    let body = URL_SAFE_NO_PAD
        .decode(body_b64)
        .map_err(|_| AuthError::Malformed)?;
    let sig_bytes: [u8; 64] = URL_SAFE_NO_PAD
        .decode(sig_b64)
        .map_err(|_| AuthError::Malformed)?
        .try_into()
        .map_err(|_| AuthError::Malformed)?;

    let key_bytes: [u8; 32] = STANDARD
        .decode(public_key)
        .map_err(|_| AuthError::Malformed)?
        .try_into()
        .map_err(|_| AuthError::Malformed)?;
    let verifying = VerifyingKey::from_bytes(&key_bytes).map_err(|_| AuthError::Malformed)?;

    verifying
        .verify(&body, &Signature::from_bytes(&sig_bytes))
        .map_err(|_| AuthError::Signature)?;

    let claims: Claims = serde_json::from_slice(&body).map_err(|_| AuthError::Malformed)?;
    if claims.exp < chrono::Utc::now().timestamp_millis() {
        return Err(AuthError::Expired);
    }
    Ok(claims)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_token_round_trip() {
        let keypair = Keypair::generate();
        let token = keypair.server_token("http://local:8080/").unwrap();

        let claims = verify(&token, &keypair.public_base64()).unwrap();
        assert_eq!(claims.server_url.as_deref(), Some("http://local:8080/"));
        assert!(claims.full_permissions);
        assert!(claims.exp > chrono::Utc::now().timestamp_millis());
    }

    #[test]
    fn test_wrong_key_rejects_signature() {
        let keypair = Keypair::generate();
        let other = Keypair::generate();
        let token = keypair.server_token("http://local:8080/").unwrap();

        assert_eq!(
            verify(&token, &other.public_base64()),
            Err(AuthError::Signature)
        );
    }

    #[test]
    fn test_expired_token_rejected() {
        let keypair = Keypair::generate();
        let token = keypair
            .sign_claims(Claims::user("alice"), Duration::ZERO)
            .unwrap();
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(
            verify(&token, &keypair.public_base64()),
            Err(AuthError::Expired)
        );
    }

    #[test]
    fn test_endpoint_allow_list() {
        let claims = Claims::user("alice").with_endpoints(vec!["/pipe".to_string()]);
        assert!(claims.allows("/pipe"));
        assert!(!claims.allows("/state"));
        assert!(Claims::user("root").with_full_permissions().allows("/state"));
    }

    #[test]
    fn test_keypair_base64_round_trip_and_account_id() {
        let keypair = Keypair::generate();
        let restored = Keypair::from_base64(&keypair.private_base64()).unwrap();
        assert_eq!(restored.public_base64(), keypair.public_base64());
        assert_eq!(restored.account_id(), keypair.account_id());
        assert_eq!(keypair.account_id().len(), 16);
    }

    #[test]
    fn test_user_record_password_and_claims() {
        let record = UserRecord {
            endpoints: Some(vec!["/pipe".to_string()]),
            ..UserRecord::new("hunter2")
        };
        assert!(record.check_password("hunter2"));
        assert!(!record.check_password("hunter3"));

        let claims = record.claims("alice");
        assert_eq!(claims.username.as_deref(), Some("alice"));
        assert!(claims.allows("/pipe"));
        assert!(!claims.allows("/state"));
    }

    #[test]
    fn test_garbage_token_is_malformed() {
        let keypair = Keypair::generate();
        assert_eq!(
            verify("not-a-token", &keypair.public_base64()),
            Err(AuthError::Malformed)
        );
    }
}
