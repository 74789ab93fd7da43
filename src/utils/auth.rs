use anyhow::{Result, anyhow};
use chrono::{Duration, Utc};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    pub sub: String, // user_id
    pub exp: usize,
    pub jti: String,
}

pub fn create_jwt(user_id: &str, secret: &str, ttl: Duration) -> Result<String> {
    let expiration = Utc::now()
        .checked_add_signed(ttl)
        .ok_or_else(|| anyhow!("token expiry out of range"))?
        .timestamp();

    let claims = Claims {
        sub: user_id.to_owned(),
        exp: expiration as usize,
        jti: uuid::Uuid::new_v4().to_string(),
    };

    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_ref()),
    )?;

    Ok(token)
}

pub fn validate_jwt(token: &str, secret: &str) -> Result<Claims> {
    let token_data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_ref()),
        &Validation::default(),
    )?;

    if token_data.claims.sub.trim().is_empty() {
        return Err(anyhow!("token has no subject"));
    }

    Ok(token_data.claims)
}
