//! Signed requests.
//!
//! Every pool operation is authenticated: a node signs the canonical payload
//! `[method, nodeID, nonce, ...args]` (serialized as a JSON array) with its
//! ed25519 key, and its node ID is the hex encoding of the matching public
//! key. The wire params of a signed call are `(sig, nodeID, nonce, ...args)`.

use crate::error::{PoolError, Result};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde_json::Value;

/// Generate a new random node key.
pub fn generate_key() -> SigningKey {
    SigningKey::generate(&mut OsRng)
}

/// The node ID of a key: hex-encoded public key.
pub fn node_id(key: &SigningKey) -> String {
    hex::encode(key.verifying_key().as_bytes())
}

/// Build the bytes that get signed.
pub fn canonical_payload(method: &str, node_id: &str, nonce: i64, args: &[Value]) -> Result<Vec<u8>> {
    let mut payload = Vec::with_capacity(args.len() + 3);
    payload.push(Value::from(method));
    payload.push(Value::from(node_id));
    payload.push(Value::from(nonce));
    payload.extend_from_slice(args);
    Ok(serde_json::to_vec(&payload)?)
}

/// Sign a request, returning the hex signature.
pub fn sign(key: &SigningKey, method: &str, nonce: i64, args: &[Value]) -> Result<String> {
    let payload = canonical_payload(method, &node_id(key), nonce, args)?;
    Ok(hex::encode(key.sign(&payload).to_bytes()))
}

/// Check that `sig` signs `(method, node_id, nonce, args)` under the key
/// named by `node_id`.
pub fn verify(sig: &str, method: &str, node_id: &str, nonce: i64, args: &[Value]) -> Result<()> {
    let failed = |message: String| PoolError::Signature {
        method: method.to_string(),
        message,
    };

    let key_bytes: [u8; 32] = hex::decode(node_id)
        .map_err(|e| failed(format!("malformed node ID: {}", e)))?
        .try_into()
        .map_err(|_| failed("node ID must be a 32-byte public key".to_string()))?;
    let key = VerifyingKey::from_bytes(&key_bytes)
        .map_err(|e| failed(format!("invalid public key: {}", e)))?;

    let sig_bytes: [u8; 64] = hex::decode(sig)
        .map_err(|e| failed(format!("malformed signature: {}", e)))?
        .try_into()
        .map_err(|_| failed("signature must be 64 bytes".to_string()))?;
    let signature = Signature::from_bytes(&sig_bytes);

    let payload = canonical_payload(method, node_id, nonce, args)?;
    key.verify(&payload, &signature)
        .map_err(|_| failed("invalid signature".to_string()))
}

/// A pool request about to be signed.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub method: String,
    pub node_id: String,
    pub nonce: i64,
    pub extra_args: Vec<Value>,
}

impl Request {
    /// Positional wire params: `(sig, nodeID, nonce, ...extra_args)`.
    pub fn signed_args(&self, key: &SigningKey) -> Result<Vec<Value>> {
        let payload = canonical_payload(&self.method, &self.node_id, self.nonce, &self.extra_args)?;
        let sig = hex::encode(key.sign(&payload).to_bytes());

        let mut args = Vec::with_capacity(self.extra_args.len() + 3);
        args.push(Value::from(sig));
        args.push(Value::from(self.node_id.as_str()));
        args.push(Value::from(self.nonce));
        args.extend(self.extra_args.iter().cloned());
        Ok(args)
    }
}
