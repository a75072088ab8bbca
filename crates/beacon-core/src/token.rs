//! Announcement tokens.
//!
//! A token is `base64(SHA-256(secret ‖ host))` over the dotted-quad text of
//! the requester's address — a cheap MAC proving the announcer actually
//! receives traffic at the address it claims, which defeats trivially
//! spoofed announcements. Two secret generations are kept: the current one
//! issues, and announcements signed with the previous one still validate
//! for a single rotation cycle so in-flight tokens survive the shift.

use std::net::Ipv4Addr;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::RngCore;
use sha2::{Digest, Sha256};

/// Size of one secret generation.
pub const SECRET_LEN: usize = 32;

/// How a submitted token relates to the current secret generations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenMatch {
    /// Issued under the current secret.
    Fresh,
    /// Issued under the previous secret, still inside the grace cycle.
    Grace,
    Invalid,
}

/// The two live secret generations.
pub struct SecretRing {
    prev: [u8; SECRET_LEN],
    current: [u8; SECRET_LEN],
}

impl SecretRing {
    pub fn generate() -> Self {
        Self {
            prev: random_secret(),
            current: random_secret(),
        }
    }

    /// Shift generations: the current secret becomes the grace secret and a
    /// fresh one takes its place.
    pub fn rotate(&mut self) {
        self.prev = self.current;
        self.current = random_secret();
    }

    /// Issue a token binding `host` to the current generation.
    pub fn issue(&self, host: Ipv4Addr) -> String {
        keyed_token(&self.current, host)
    }

    pub fn validate(&self, token: &str, host: Ipv4Addr) -> TokenMatch {
        if token == keyed_token(&self.current, host) {
            TokenMatch::Fresh
        } else if token == keyed_token(&self.prev, host) {
            TokenMatch::Grace
        } else {
            TokenMatch::Invalid
        }
    }
}

fn keyed_token(secret: &[u8; SECRET_LEN], host: Ipv4Addr) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret);
    hasher.update(host.to_string().as_bytes());
    BASE64.encode(hasher.finalize())
}

fn random_secret() -> [u8; SECRET_LEN] {
    let mut secret = [0u8; SECRET_LEN];
    rand::thread_rng().fill_bytes(&mut secret);
    secret
}

/// Random per-instance identifier, rendered base64. Used to correlate
/// probes with their responses.
pub fn instance_id() -> String {
    let mut id = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut id);
    BASE64.encode(id)
}
