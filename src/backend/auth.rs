//! Backend authentication plugins.
//!
//! `mysql_native_password` scramble:
//! `SHA1(password) XOR SHA1(seed + SHA1(SHA1(password)))`
//!
//! `caching_sha2_password` fast path:
//! `XOR(SHA256(password), SHA256(SHA256(SHA256(password)) + seed))`
//!
//! Full authentication for caching_sha2 either sends the cleartext password
//! over a secure channel or RSA-encrypts it with the server's public key.

use rand::rngs::OsRng;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::DecodePublicKey;
use rsa::{Oaep, RsaPublicKey};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const MYSQL_NATIVE_PASSWORD: &str = "mysql_native_password";
pub const CACHING_SHA2_PASSWORD: &str = "caching_sha2_password";

/// caching_sha2_password protocol bytes
mod caching_sha2 {
    /// Client asks for the server's RSA public key
    pub const REQUEST_PUBLIC_KEY: u8 = 0x02;
    /// Fast auth succeeded, an OK packet follows
    pub const FAST_AUTH_SUCCESS: u8 = 0x03;
    /// Full authentication required
    pub const PERFORM_FULL_AUTH: u8 = 0x04;
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("server rejected authentication: {0}")]
    Rejected(String),

    #[error("unsupported authentication plugin '{0}'")]
    UnsupportedPlugin(String),

    #[error("unexpected packet during authentication")]
    UnexpectedPacket,

    #[error("server public key could not be used: {0}")]
    PublicKey(String),
}

/// One step of the authentication exchange
#[derive(Debug, Default)]
pub struct PluginStep {
    /// Bytes to write back to the server, if any
    pub write: Option<Vec<u8>>,
    /// The plugin expects no further packets before the final OK/ERR
    pub done: bool,
}

/// Per-method authentication state machine.
///
/// The backend engine feeds it every non-OK/ERR packet the server sends
/// during authentication and writes whatever the plugin returns.
pub trait AuthPlugin: Send {
    fn name(&self) -> &'static str;

    /// The auth response placed in the handshake response packet
    fn initial_response(&mut self) -> Vec<u8>;

    /// Handle an AuthMoreData payload (leading 0x01 already stripped)
    fn on_server_data(&mut self, data: &[u8]) -> Result<PluginStep, AuthError>;
}

/// Instantiate the plugin for a named scheme
pub fn create_plugin(
    name: &str,
    password: &str,
    seed: &[u8],
    secure_channel: bool,
) -> Result<Box<dyn AuthPlugin>, AuthError> {
    match name {
        MYSQL_NATIVE_PASSWORD => Ok(Box::new(NativePassword {
            password: password.to_string(),
            seed: seed.to_vec(),
        })),
        CACHING_SHA2_PASSWORD => Ok(Box::new(CachingSha2 {
            password: password.to_string(),
            seed: seed.to_vec(),
            secure_channel,
            key_requested: false,
        })),
        other => Err(AuthError::UnsupportedPlugin(other.to_string())),
    }
}

struct NativePassword {
    password: String,
    seed: Vec<u8>,
}

impl AuthPlugin for NativePassword {
    fn name(&self) -> &'static str {
        MYSQL_NATIVE_PASSWORD
    }

    fn initial_response(&mut self) -> Vec<u8> {
        native_password_scramble(&self.password, &self.seed)
    }

    fn on_server_data(&mut self, _data: &[u8]) -> Result<PluginStep, AuthError> {
        // Native password is a single challenge-response exchange
        Err(AuthError::UnexpectedPacket)
    }
}

struct CachingSha2 {
    password: String,
    seed: Vec<u8>,
    secure_channel: bool,
    key_requested: bool,
}

impl AuthPlugin for CachingSha2 {
    fn name(&self) -> &'static str {
        CACHING_SHA2_PASSWORD
    }

    fn initial_response(&mut self) -> Vec<u8> {
        caching_sha2_scramble(&self.password, &self.seed)
    }

    fn on_server_data(&mut self, data: &[u8]) -> Result<PluginStep, AuthError> {
        if self.key_requested {
            // The payload is the server's RSA public key in PEM form
            let encrypted = rsa_encrypt_password(&self.password, &self.seed, data)?;
            return Ok(PluginStep {
                write: Some(encrypted),
                done: true,
            });
        }

        match data.first() {
            Some(&caching_sha2::FAST_AUTH_SUCCESS) => Ok(PluginStep {
                write: None,
                done: true,
            }),
            Some(&caching_sha2::PERFORM_FULL_AUTH) => {
                if self.secure_channel {
                    // Cleartext password, NUL terminated, over TLS
                    let mut pw = self.password.as_bytes().to_vec();
                    pw.push(0);
                    Ok(PluginStep {
                        write: Some(pw),
                        done: true,
                    })
                } else {
                    self.key_requested = true;
                    Ok(PluginStep {
                        write: Some(vec![caching_sha2::REQUEST_PUBLIC_KEY]),
                        done: false,
                    })
                }
            }
            _ => Err(AuthError::UnexpectedPacket),
        }
    }
}

/// Compute the mysql_native_password challenge response
pub fn native_password_scramble(password: &str, seed: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }

    let seed = if seed.len() > 20 { &seed[..20] } else { seed };

    // SHA1(password)
    let mut hasher = Sha1::new();
    hasher.update(password.as_bytes());
    let stage1 = hasher.finalize();

    // SHA1(SHA1(password))
    let mut hasher = Sha1::new();
    hasher.update(stage1);
    let stage2 = hasher.finalize();

    // SHA1(seed + SHA1(SHA1(password)))
    let mut hasher = Sha1::new();
    hasher.update(seed);
    hasher.update(stage2);
    let stage3 = hasher.finalize();

    stage1
        .iter()
        .zip(stage3.iter())
        .map(|(a, b)| a ^ b)
        .collect()
}

/// Compute the caching_sha2_password fast-path response
pub fn caching_sha2_scramble(password: &str, seed: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }

    // The server sends a 20-byte scramble plus a trailing NUL
    let seed = if seed.len() == 21 && seed.last() == Some(&0) {
        &seed[..20]
    } else {
        seed
    };

    let mut hasher = Sha256::new();
    hasher.update(password.as_bytes());
    let hash1 = hasher.finalize();

    let mut hasher = Sha256::new();
    hasher.update(hash1);
    let hash2 = hasher.finalize();

    let mut hasher = Sha256::new();
    hasher.update(hash2);
    hasher.update(seed);
    let scramble = hasher.finalize();

    hash1
        .iter()
        .zip(scramble.iter())
        .map(|(a, b)| a ^ b)
        .collect()
}

/// XOR the NUL-terminated password with the seed and RSA-encrypt it with the
/// server's public key (OAEP, as used by MySQL 8.0.5+)
fn rsa_encrypt_password(password: &str, seed: &[u8], key_pem: &[u8]) -> Result<Vec<u8>, AuthError> {
    if seed.is_empty() {
        return Err(AuthError::PublicKey("empty seed".to_string()));
    }

    let mut pw = password.as_bytes().to_vec();
    pw.push(0);
    for (i, b) in pw.iter_mut().enumerate() {
        *b ^= seed[i % seed.len()];
    }

    let pem = std::str::from_utf8(key_pem)
        .map_err(|e| AuthError::PublicKey(format!("key is not UTF-8 PEM: {e}")))?;

    let key = RsaPublicKey::from_public_key_pem(pem)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
        .map_err(|e| AuthError::PublicKey(format!("failed to parse key: {e}")))?;

    key.encrypt(&mut OsRng, Oaep::new::<Sha1>(), &pw)
        .map_err(|e| AuthError::PublicKey(format!("encryption failed: {e}")))
}
