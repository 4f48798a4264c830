//! Tokens binding announce_peer requests to a get_peers querier's address.

use std::fmt::{self, Debug, Formatter};
use std::net::SocketAddrV4;

use getrandom::getrandom;
use sha1_smol::Sha1;

const SECRET_SIZE: usize = 5;

type Secret = [u8; SECRET_SIZE];

/// The token handed out for `address` under `secret`: the hex form of
/// SHA1(address || secret).
pub fn host_token(address: SocketAddrV4, secret: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(address.to_string().as_bytes());
    hasher.update(secret);
    hasher.digest().to_string()
}

/// A two-element queue of random secrets, rotated on a fixed timer by the
/// engine. A peer must echo a token minted against its own address; tokens
/// minted under either the current or the previous secret are accepted.
#[derive(Clone)]
pub struct Tokens {
    secrets: [Secret; 2],
}

impl Debug for Tokens {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Tokens(_)")
    }
}

impl Tokens {
    pub fn new() -> Tokens {
        Tokens {
            secrets: [random_secret(), random_secret()],
        }
    }

    // === Public Methods ===

    /// Prepend a fresh secret, keeping only the last two.
    pub fn rotate(&mut self) {
        self.secrets = [random_secret(), self.secrets[0]];
    }

    /// Mint a token for a remote address under the current secret.
    pub fn generate(&self, address: SocketAddrV4) -> String {
        host_token(address, &self.secrets[0])
    }

    /// True iff `token` matches `address` under either secret.
    pub fn validate(&self, address: SocketAddrV4, token: &[u8]) -> bool {
        self.secrets
            .iter()
            .any(|secret| host_token(address, secret).as_bytes() == token)
    }
}

impl Default for Tokens {
    fn default() -> Self {
        Self::new()
    }
}

fn random_secret() -> Secret {
    let mut bytes = [0u8; SECRET_SIZE];
    getrandom(&mut bytes).expect("getrandom");
    bytes
}
