//! HS256 token signing for session data.

use std::time::Duration;

use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode, get_current_timestamp};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::JwtConfig;
use crate::error::Result;

const ISSUER: &str = "flow";

#[derive(Clone, Serialize, Deserialize)]
struct Claims {
    iss: String,
    exp: u64,
    #[serde(flatten)]
    data: Map<String, Value>,
}

/// Signs and verifies tokens with the configured secret and lifetime.
pub struct Jwt {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    lifetime: Duration,
}

impl Jwt {
    pub fn new(config: &JwtConfig) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[ISSUER]);
        Self {
            encoding: EncodingKey::from_secret(config.secret_key.as_bytes()),
            decoding: DecodingKey::from_secret(config.secret_key.as_bytes()),
            validation,
            lifetime: config.timeout(),
        }
    }

    /// A token carrying `data`, expiring one configured lifetime from now.
    pub fn sign(&self, data: Map<String, Value>) -> Result<String> {
        let claims = Claims {
            iss: ISSUER.to_owned(),
            exp: get_current_timestamp() + self.lifetime.as_secs(),
            data,
        };
        Ok(encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)?)
    }

    /// The data a valid, unexpired token was signed with.
    pub fn verify(&self, token: &str) -> Result<Map<String, Value>> {
        let claims = decode::<Claims>(token, &self.decoding, &self.validation)?.claims;
        Ok(claims.data)
    }
}
