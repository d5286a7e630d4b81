//! JWT validation for the admission layer's authentication check (spec §4.8).
//!
//! Grounded on `ipc/auth.rs`'s bearer-token check structurally (parse header,
//! validate, return a context) but the actual verification uses `jsonwebtoken`
//! instead of string equality, since the spec requires signature and claim
//! validation rather than a single shared secret. See `DESIGN.md`.

use std::collections::HashMap;

use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde_json::Value;

use crate::error::TransportError;

/// Signing method a token must be validated against.
#[derive(Clone)]
pub enum SigningMethod {
    Hmac { secret: Vec<u8> },
    Rsa { public_key_pem: Vec<u8> },
}

/// Validated identity and claims extracted from a token (spec §4.8 step 7).
#[derive(Clone, Debug, Default)]
pub struct AuthContext {
    pub user_id: String,
    pub username: String,
    pub roles: Vec<String>,
    pub permissions: Vec<String>,
    pub claims: HashMap<String, Value>,
}

pub struct JwtValidator {
    method: SigningMethod,
    issuer: Option<String>,
    audience: Option<String>,
}

impl JwtValidator {
    pub fn new(method: SigningMethod, issuer: Option<String>, audience: Option<String>) -> Self {
        Self {
            method,
            issuer,
            audience,
        }
    }

    /// Validate `token` per the 7-step sequence in spec §4.8.
    pub fn validate_token(&self, token: &str) -> Result<AuthContext, TransportError> {
        if token.is_empty() {
            return Err(TransportError::EmptyToken);
        }

        let (key, algorithm) = match &self.method {
            SigningMethod::Hmac { secret } => (DecodingKey::from_secret(secret), Algorithm::HS256),
            SigningMethod::Rsa { public_key_pem } => (
                DecodingKey::from_rsa_pem(public_key_pem)
                    .map_err(|e| TransportError::InvalidToken(format!("failed to parse token: {e}")))?,
                Algorithm::RS256,
            ),
        };

        let mut validation = Validation::new(algorithm);
        validation.validate_exp = true;
        validation.validate_nbf = true;
        if let Some(iss) = &self.issuer {
            if !iss.is_empty() {
                validation.set_issuer(&[iss.clone()]);
            }
        }
        if let Some(aud) = &self.audience {
            if !aud.is_empty() {
                validation.set_audience(&[aud.clone()]);
            }
        }

        let data = jsonwebtoken::decode::<HashMap<String, Value>>(token, &key, &validation)?;
        let claims = data.claims;

        let user_id = claims
            .get("sub")
            .or_else(|| claims.get("user_id"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let username = claims
            .get("username")
            .or_else(|| claims.get("email"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let roles = extract_string_list(&claims, "roles");
        let permissions = extract_string_list(&claims, "permissions");

        Ok(AuthContext {
            user_id,
            username,
            roles,
            permissions,
            claims,
        })
    }
}

fn extract_string_list(claims: &HashMap<String, Value>, key: &str) -> Vec<String> {
    match claims.get(key) {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        Some(Value::String(s)) => vec![s.clone()],
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde::Serialize;

    #[derive(Serialize)]
    struct Claims {
        sub: String,
        username: String,
        roles: Vec<String>,
        exp: i64,
        iat: i64,
    }

    fn sign(claims: &Claims, secret: &[u8]) -> String {
        encode(&Header::new(Algorithm::HS256), claims, &EncodingKey::from_secret(secret)).unwrap()
    }

    #[test]
    fn empty_token_is_rejected() {
        let v = JwtValidator::new(SigningMethod::Hmac { secret: b"s".to_vec() }, None, None);
        assert!(matches!(v.validate_token(""), Err(TransportError::EmptyToken)));
    }

    #[test]
    fn valid_hmac_token_produces_auth_context() {
        let now = 1_700_000_000i64;
        let claims = Claims {
            sub: "user-1".into(),
            username: "alice".into(),
            roles: vec!["admin".into()],
            exp: now + 3600,
            iat: now,
        };
        let token = sign(&claims, b"topsecret");
        let v = JwtValidator::new(SigningMethod::Hmac { secret: b"topsecret".to_vec() }, None, None);
        let ctx = v.validate_token(&token).expect("token should validate");
        assert_eq!(ctx.user_id, "user-1");
        assert_eq!(ctx.username, "alice");
        assert_eq!(ctx.roles, vec!["admin"]);
    }

    #[test]
    fn expired_token_is_rejected() {
        let now = 1_700_000_000i64;
        let claims = Claims {
            sub: "user-1".into(),
            username: "alice".into(),
            roles: vec![],
            exp: now - 10,
            iat: now - 3600,
        };
        let token = sign(&claims, b"topsecret");
        let v = JwtValidator::new(SigningMethod::Hmac { secret: b"topsecret".to_vec() }, None, None);
        assert!(matches!(v.validate_token(&token), Err(TransportError::TokenExpired)));
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let now = 1_700_000_000i64;
        let claims = Claims {
            sub: "user-1".into(),
            username: "alice".into(),
            roles: vec![],
            exp: now + 3600,
            iat: now,
        };
        let token = sign(&claims, b"topsecret");
        let v = JwtValidator::new(SigningMethod::Hmac { secret: b"wrongsecret".to_vec() }, None, None);
        assert!(v.validate_token(&token).is_err());
    }
}
