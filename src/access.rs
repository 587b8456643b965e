//! Access-token verification
//!
//! Tokens are bearer JWTs signed with a shared secret. Verification is an
//! external concern to the blob pipeline; the core only needs a yes/no
//! (and the distinction between an invalid and an expired token, which map
//! to different status codes).

use jsonwebtoken::{decode, errors::ErrorKind, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use crate::error::{PlayerError, Result};

#[derive(Debug, Serialize, Deserialize)]
struct TokenClaims {
    /// Claim id the token grants access to
    sub: String,
    exp: u64,
}

pub trait TokenVerifier: Send + Sync {
    fn verify(&self, token: &str, claim_id: &str) -> Result<()>;
}

/// HS256 verifier over a shared secret.
pub struct JwtVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }
}

impl TokenVerifier for JwtVerifier {
    fn verify(&self, token: &str, claim_id: &str) -> Result<()> {
        let data = decode::<TokenClaims>(token, &self.key, &self.validation).map_err(|e| {
            match e.kind() {
                ErrorKind::ExpiredSignature => PlayerError::ExpiredToken,
                _ => PlayerError::InvalidToken(e.to_string()),
            }
        })?;
        if data.claims.sub != claim_id {
            return Err(PlayerError::InvalidToken(
                "token subject does not match the claim".into(),
            ));
        }
        Ok(())
    }
}
