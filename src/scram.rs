//! SCRAM-SHA-256 authentication implementation.
//!
//! Implements RFC 5802 (SCRAM) and RFC 7677 (SCRAM-SHA-256) for PostgreSQL.
//! The server takes the user name from the startup message, so the SCRAM
//! user name is always sent as `*`.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::error::PgError;

type HmacSha256 = Hmac<Sha256>;

pub const SCRAM_SHA_256: &str = "SCRAM-SHA-256";

/// The client-first-message without its GS2 header.
fn client_first_bare(nonce: &str) -> String {
    format!("n=*,r={}", nonce)
}

/// Values kept between server-first and server-final.
struct Exchange {
    auth_message: String,
    salted_password: [u8; 32],
}

/// SCRAM-SHA-256 client state machine.
pub struct ScramClient {
    /// Password
    password: String,
    /// Client nonce
    client_nonce: String,
    exchange: Option<Exchange>,
}

impl ScramClient {
    /// Create a new SCRAM client with a random nonce.
    pub fn new(password: &str) -> Self {
        // Generate 18 bytes of random data, then base64 encode (24 chars)
        let mut rng = rand::thread_rng();
        let nonce_bytes: [u8; 18] = rng.gen();
        Self::with_nonce(password, BASE64.encode(nonce_bytes))
    }

    /// Create a client with a fixed nonce.
    pub fn with_nonce(password: &str, client_nonce: String) -> Self {
        Self {
            password: password.to_string(),
            client_nonce,
            exchange: None,
        }
    }

    /// Generate the initial client message (client-first-message).
    ///
    /// Format: `n,,n=*,r=<client-nonce>`
    pub fn client_first_message(&self) -> Vec<u8> {
        // GS2 header: n,, (no channel binding, no authzid)
        format!("n,,{}", client_first_bare(&self.client_nonce)).into_bytes()
    }

    /// Process the server's first message and generate the client's final message.
    ///
    /// Server message format: `r=<nonce>,s=<salt>,i=<iterations>`
    /// Returns: client-final-message
    pub fn process_server_first(&mut self, server_msg: &[u8]) -> Result<Vec<u8>, ScramError> {
        let server_str =
            std::str::from_utf8(server_msg).map_err(|_| ScramError::InvalidServerMessage)?;

        let mut nonce = None;
        let mut salt = None;
        let mut iterations = None;

        for part in server_str.split(',') {
            if let Some(value) = part.strip_prefix("r=") {
                nonce = Some(value.to_string());
            } else if let Some(value) = part.strip_prefix("s=") {
                salt = Some(BASE64.decode(value).map_err(|_| ScramError::InvalidSalt)?);
            } else if let Some(value) = part.strip_prefix("i=") {
                iterations = Some(
                    value
                        .parse::<u32>()
                        .map_err(|_| ScramError::InvalidIterations)?,
                );
            }
        }

        let combined_nonce = nonce.ok_or(ScramError::MissingNonce)?;
        let salt = salt.ok_or(ScramError::MissingSalt)?;
        let iterations = iterations.ok_or(ScramError::MissingIterations)?;

        // The server must extend our nonce, not just echo it
        if !combined_nonce.starts_with(&self.client_nonce)
            || combined_nonce.len() <= self.client_nonce.len()
        {
            return Err(ScramError::NonceVerificationFailed);
        }
        if iterations == 0 {
            return Err(ScramError::InvalidIterations);
        }

        let salted_password = hi(&self.password, &salt, iterations)?;

        let client_key = hmac_sha256(&salted_password, b"Client Key")?;
        let stored_key = sha256(&client_key);

        let client_final_without_proof = format!("c=biws,r={}", combined_nonce);
        let auth_message = format!(
            "{},{},{}",
            client_first_bare(&self.client_nonce),
            server_str,
            client_final_without_proof
        );

        let client_signature = hmac_sha256(&stored_key, auth_message.as_bytes())?;
        let client_proof = xor_bytes(&client_key, &client_signature);

        self.exchange = Some(Exchange {
            auth_message,
            salted_password,
        });

        let client_final = format!(
            "{},p={}",
            client_final_without_proof,
            BASE64.encode(client_proof)
        );
        Ok(client_final.into_bytes())
    }

    /// Verify the server's final message (server signature).
    ///
    /// Server message format: `v=<verifier>` or `e=<error>`
    pub fn verify_server_final(&self, server_msg: &[u8]) -> Result<(), ScramError> {
        let server_str =
            std::str::from_utf8(server_msg).map_err(|_| ScramError::InvalidServerMessage)?;

        let mut verifier = None;
        for part in server_str.split(',') {
            if let Some(err) = part.strip_prefix("e=") {
                return Err(ScramError::Server(err.to_string()));
            }
            if let Some(v) = part.strip_prefix("v=") {
                verifier = Some(v);
            }
        }

        let server_signature = BASE64
            .decode(verifier.ok_or(ScramError::InvalidServerSignature)?)
            .map_err(|_| ScramError::InvalidServerSignature)?;

        let exchange = self.exchange.as_ref().ok_or(ScramError::InvalidState)?;
        let server_key = hmac_sha256(&exchange.salted_password, b"Server Key")?;
        let expected = hmac_sha256(&server_key, exchange.auth_message.as_bytes())?;

        if server_signature != expected {
            return Err(ScramError::ServerSignatureVerificationFailed);
        }

        Ok(())
    }
}

/// SCRAM authentication errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScramError {
    #[error("Invalid server message")]
    InvalidServerMessage,
    #[error("Invalid salt encoding")]
    InvalidSalt,
    #[error("Invalid iteration count")]
    InvalidIterations,
    #[error("Missing nonce in server message")]
    MissingNonce,
    #[error("Missing salt in server message")]
    MissingSalt,
    #[error("Missing iterations in server message")]
    MissingIterations,
    #[error("Server nonce verification failed")]
    NonceVerificationFailed,
    #[error("Invalid server signature")]
    InvalidServerSignature,
    #[error("Server signature verification failed")]
    ServerSignatureVerificationFailed,
    #[error("Server reported SCRAM error: {0}")]
    Server(String),
    #[error("Key derivation failed")]
    KeyDerivation,
    #[error("Invalid SCRAM state")]
    InvalidState,
}

impl From<ScramError> for PgError {
    fn from(e: ScramError) -> Self {
        PgError::Auth(format!("SCRAM-SHA-256: {}", e))
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Hi() function - PBKDF2 with HMAC-SHA-256
fn hi(password: &str, salt: &[u8], iterations: u32) -> Result<[u8; 32], ScramError> {
    let mut output = [0u8; 32];
    pbkdf2::pbkdf2::<HmacSha256>(password.as_bytes(), salt, iterations, &mut output)
        .map_err(|_| ScramError::KeyDerivation)?;
    Ok(output)
}

/// HMAC-SHA-256
fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<[u8; 32], ScramError> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|_| ScramError::KeyDerivation)?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().into())
}

/// SHA-256 hash
fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

fn xor_bytes(a: &[u8; 32], b: &[u8; 32]) -> [u8; 32] {
    let mut result = [0u8; 32];
    for (out, (x, y)) in result.iter_mut().zip(a.iter().zip(b.iter())) {
        *out = x ^ y;
    }
    result
}
