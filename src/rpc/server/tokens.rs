//! Issue and verify write tokens for remote requesters.

use std::fmt::{self, Debug, Formatter};
use std::net::SocketAddrV4;
use std::time::{Duration, Instant};

use getrandom::getrandom;
use sha1_smol::Sha1;
use tracing::trace;

use crate::common::Id;

const SECRET_SIZE: usize = 10;
const TOKEN_SIZE: usize = 20;

/// How often the secret rotates. A token stays acceptable for one full
/// rotation after it was issued, since the previous secret is still checked.
pub const TOKEN_ROTATE_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Write-token generator.
///
/// A token binds a (target, requester-IP) pair to a rotating secret:
/// `SHA-1(target || ip || secret)`. Tokens from the current and the
/// previous secret are accepted, so a token is valid for at least
/// [TOKEN_ROTATE_INTERVAL] end to end.
#[derive(Clone)]
pub struct Tokens {
    prev_secret: [u8; SECRET_SIZE],
    curr_secret: [u8; SECRET_SIZE],
    last_rotated: Instant,
}

impl Debug for Tokens {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Tokens(_)")
    }
}

impl Tokens {
    pub fn new() -> Self {
        Tokens {
            prev_secret: random(),
            curr_secret: random(),
            last_rotated: Instant::now(),
        }
    }

    // === Public Methods ===

    /// Returns `true` if the current secret is due for rotation.
    pub fn should_rotate(&self) -> bool {
        self.last_rotated.elapsed() > TOKEN_ROTATE_INTERVAL
    }

    /// Rotate the secret, keeping the previous one acceptable.
    pub fn rotate(&mut self) {
        trace!("Rotating token secret");

        self.prev_secret = self.curr_secret;
        self.curr_secret = random();

        self.last_rotated = Instant::now();
    }

    /// Issue a token for a remote requester wanting to store at `target`.
    pub fn generate(&self, target: &Id, requester: SocketAddrV4) -> [u8; TOKEN_SIZE] {
        hash(target, requester, &self.curr_secret)
    }

    /// Returns `true` if the token was issued for this (target, requester-IP)
    /// pair with the current or the previous secret.
    pub fn validate(&self, target: &Id, requester: SocketAddrV4, token: &[u8]) -> bool {
        token == hash(target, requester, &self.curr_secret)
            || token == hash(target, requester, &self.prev_secret)
    }
}

impl Default for Tokens {
    fn default() -> Self {
        Self::new()
    }
}

fn hash(target: &Id, requester: SocketAddrV4, secret: &[u8; SECRET_SIZE]) -> [u8; TOKEN_SIZE] {
    let mut hasher = Sha1::new();

    hasher.update(target.as_bytes());
    hasher.update(&requester.ip().octets());
    hasher.update(secret);

    hasher.digest().bytes()
}

fn random() -> [u8; SECRET_SIZE] {
    let mut bytes = [0_u8; SECRET_SIZE];
    getrandom(&mut bytes).expect("getrandom");

    bytes
}

#[cfg(test)]
mod test {
    use super::*;

    fn addr(ip: [u8; 4], port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(ip.into(), port)
    }

    #[test]
    fn valid_token() {
        let tokens = Tokens::new();
        let target = Id::random();
        let requester = addr([127, 0, 0, 1], 6881);

        let token = tokens.generate(&target, requester);

        assert!(tokens.validate(&target, requester, &token));
    }

    #[test]
    fn rejects_other_requester_ip() {
        let tokens = Tokens::new();
        let target = Id::random();

        let token = tokens.generate(&target, addr([127, 0, 0, 1], 6881));

        // A different port on the same IP is fine, a different IP is not.
        assert!(tokens.validate(&target, addr([127, 0, 0, 1], 9999), &token));
        assert!(!tokens.validate(&target, addr([127, 0, 0, 2], 6881), &token));
    }

    #[test]
    fn rejects_other_target() {
        let tokens = Tokens::new();
        let requester = addr([127, 0, 0, 1], 6881);

        let token = tokens.generate(&Id::random(), requester);

        assert!(!tokens.validate(&Id::random(), requester, &token));
    }

    #[test]
    fn previous_secret_still_accepted() {
        let mut tokens = Tokens::new();
        let target = Id::random();
        let requester = addr([127, 0, 0, 1], 6881);

        let token = tokens.generate(&target, requester);
        tokens.rotate();

        assert!(tokens.validate(&target, requester, &token));

        tokens.rotate();

        assert!(!tokens.validate(&target, requester, &token));
    }
}
