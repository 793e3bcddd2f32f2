//! Sessions and commit/request signing, per §3 "Session" and §6's
//! signature header.

pub mod jwk;

use ed25519_dalek::{Keypair, PublicKey as DalekPublicKey, Signature, Signer, Verifier};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use crate::commit::canonical;
use crate::error::{GoatError, Result};

pub type PublicKey = DalekPublicKey;

/// `{id, publicKey, privateKey?, owner?, expiration}` (§3). A session
/// with `private_key` is owned and can sign; without, it's foreign and
/// can only verify.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    #[serde(rename = "publicKey")]
    pub public_key: jwk::Jwk,
    #[serde(rename = "privateKey", skip_serializing_if = "Option::is_none")]
    pub private_key: Option<jwk::Jwk>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    pub expiration: i64,
}

impl Session {
    /// Generates a fresh owned session with a new Ed25519 keypair.
    pub fn generate(id: impl Into<String>, owner: Option<String>, expiration: i64) -> Session {
        let keypair = Keypair::generate(&mut OsRng {});
        Session {
            id: id.into(),
            public_key: jwk::encode_public(&keypair.public),
            private_key: Some(jwk::encode_private(&keypair)),
            owner,
            expiration,
        }
    }

    /// Decodes a session, rejecting entries lacking `publicKey` with
    /// `MalformedSession` before attempting the rest of the shape (§6).
    pub fn decode(bytes: &[u8]) -> Result<Session> {
        let raw: serde_json::Value = serde_json::from_slice(bytes)?;
        if raw.get("publicKey").is_none() {
            return Err(GoatError::MalformedSession("missing publicKey".into()));
        }
        serde_json::from_value(raw).map_err(|e| GoatError::MalformedSession(e.to_string()))
    }

    pub fn is_owned(&self) -> bool {
        self.private_key.is_some()
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        now_ms >= self.expiration
    }

    pub fn public_key(&self) -> Result<DalekPublicKey> {
        jwk::decode_public(&self.public_key)
    }

    fn keypair(&self) -> Result<Keypair> {
        let priv_jwk = self.private_key.as_ref().ok_or_else(|| {
            GoatError::SignatureFailure(format!("session {} has no private key", self.id))
        })?;
        jwk::decode_keypair(priv_jwk)
    }

    /// Signs `body` (already canonical bytes), returning a hex-encoded
    /// detached signature.
    pub fn sign(&self, body: &[u8]) -> Result<String> {
        let keypair = self.keypair()?;
        let signature: Signature = keypair.sign(body);
        Ok(hex::encode(signature.to_bytes()))
    }
}

pub fn verify_signature(public_key: &DalekPublicKey, body: &[u8], signature_hex: &str) -> Result<()> {
    let bytes = hex::decode(signature_hex)?;
    let signature = Signature::from_bytes(&bytes)
        .map_err(|e| GoatError::SignatureFailure(e.to_string()))?;
    public_key
        .verify(body, &signature)
        .map_err(|e| GoatError::SignatureFailure(e.to_string()))
}

/// Detached signature over `{method, path, ts}`, sent as the
/// `X-Session-Signature` request header (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestSignature {
    pub method: String,
    pub path: String,
    pub ts: i64,
    pub signature: String,
}

pub const MAX_REQUEST_DRIFT_MS: i64 = 5 * 60 * 1000;

#[derive(Serialize)]
struct RequestBody<'a> {
    method: &'a str,
    path: &'a str,
    ts: i64,
}

pub fn sign_request(session: &Session, method: &str, path: &str, ts: i64) -> Result<RequestSignature> {
    let body = canonical::to_canonical_bytes(&RequestBody { method, path, ts })?;
    let signature = session.sign(&body)?;
    Ok(RequestSignature {
        method: method.to_string(),
        path: path.to_string(),
        ts,
        signature,
    })
}

/// Verifies a request signature header and rejects drift beyond 5 minutes
/// (§6: "Requests older than 5 minutes are rejected with 401").
pub fn verify_request(
    public_key: &DalekPublicKey,
    req: &RequestSignature,
    now_ms: i64,
) -> Result<()> {
    if (now_ms - req.ts).abs() > MAX_REQUEST_DRIFT_MS {
        return Err(GoatError::SignatureFailure(
            "request timestamp drift exceeds 5 minutes".into(),
        ));
    }
    let body = canonical::to_canonical_bytes(&RequestBody {
        method: &req.method,
        path: &req.path,
        ts: req.ts,
    })?;
    verify_signature(public_key, &body, &req.signature)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_signature_roundtrips() {
        let session = Session::generate("s1", None, i64::MAX);
        let req = sign_request(&session, "POST", "/sync/x", 1_000_000).unwrap();
        let pk = session.public_key().unwrap();
        assert!(verify_request(&pk, &req, 1_000_000 + 1000).is_ok());
    }

    #[test]
    fn stale_request_rejected() {
        let session = Session::generate("s1", None, i64::MAX);
        let req = sign_request(&session, "POST", "/sync/x", 0).unwrap();
        let pk = session.public_key().unwrap();
        let six_minutes = 6 * 60 * 1000;
        assert!(verify_request(&pk, &req, six_minutes).is_err());
    }

    #[test]
    fn decode_rejects_missing_public_key() {
        let bytes = br#"{"id":"s1","expiration":0}"#;
        match Session::decode(bytes) {
            Err(GoatError::MalformedSession(_)) => {}
            other => panic!("expected MalformedSession, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn foreign_session_cannot_sign() {
        let owned = Session::generate("s1", None, i64::MAX);
        let foreign = Session {
            id: owned.id.clone(),
            public_key: owned.public_key.clone(),
            private_key: None,
            owner: None,
            expiration: owned.expiration,
        };
        assert!(!foreign.is_owned());
        assert!(foreign.sign(b"anything").is_err());
    }
}
