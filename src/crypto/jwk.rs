//! Minimal JWK encode/decode for Ed25519 session keys (§6 "Session
//! encoding"). Only the OKP/Ed25519 shape is supported — this is not a
//! general-purpose JWK library, just enough to round-trip our own keys.

use ed25519_dalek::{Keypair, PublicKey, SecretKey, SECRET_KEY_LENGTH};
use serde::{Deserialize, Serialize};

use crate::error::{GoatError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Jwk {
    pub kty: String,
    pub crv: String,
    pub x: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub d: Option<String>,
}

fn b64(bytes: &[u8]) -> String {
    base64::encode_config(bytes, base64::URL_SAFE_NO_PAD)
}

fn unb64(s: &str) -> Result<Vec<u8>> {
    base64::decode_config(s, base64::URL_SAFE_NO_PAD)
        .map_err(|e| GoatError::MalformedSession(format!("invalid base64url: {e}")))
}

pub fn encode_public(pk: &PublicKey) -> Jwk {
    Jwk {
        kty: "OKP".into(),
        crv: "Ed25519".into(),
        x: b64(pk.as_bytes()),
        d: None,
    }
}

pub fn encode_private(keypair: &Keypair) -> Jwk {
    Jwk {
        kty: "OKP".into(),
        crv: "Ed25519".into(),
        x: b64(keypair.public.as_bytes()),
        d: Some(b64(keypair.secret.as_bytes())),
    }
}

pub fn decode_public(jwk: &Jwk) -> Result<PublicKey> {
    if jwk.kty != "OKP" || jwk.crv != "Ed25519" {
        return Err(GoatError::MalformedSession(format!(
            "unsupported key type {}/{}",
            jwk.kty, jwk.crv
        )));
    }
    let bytes = unb64(&jwk.x)?;
    PublicKey::from_bytes(&bytes)
        .map_err(|e| GoatError::MalformedSession(format!("invalid public key: {e}")))
}

pub fn decode_keypair(jwk: &Jwk) -> Result<Keypair> {
    let d = jwk
        .d
        .as_ref()
        .ok_or_else(|| GoatError::MalformedSession("jwk has no private component".into()))?;
    let secret_bytes = unb64(d)?;
    if secret_bytes.len() != SECRET_KEY_LENGTH {
        return Err(GoatError::MalformedSession("invalid secret key length".into()));
    }
    let secret = SecretKey::from_bytes(&secret_bytes)
        .map_err(|e| GoatError::MalformedSession(format!("invalid secret key: {e}")))?;
    let public = decode_public(jwk)?;
    Ok(Keypair { secret, public })
}
