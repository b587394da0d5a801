//! MD5 challenge-response authentication.

use rand::Rng;

/// Authentication method bits carried in the AUTHMETHODS element.
pub const AUTH_TEXT: u32 = 1;
pub const AUTH_MD5: u32 = 2;
pub const AUTH_RSA: u32 = 4;

const CHALLENGE_LEN: usize = 10;

/// Lowercase 32-hex-digit MD5 of challenge concatenated with password.
pub fn md5_from_challenge(challenge: &str, password: &str) -> String {
    format!("{:x}", md5::compute(format!("{}{}", challenge, password)))
}

/// Check a received MD5_RESULT against the challenge we issued.
pub fn challenge_ok(received: &str, challenge: &str, password: &str) -> bool {
    received == md5_from_challenge(challenge, password)
}

/// Random numeric challenge for an outgoing AUTHREQ/REGAUTH.
pub fn make_challenge() -> String {
    let mut rng = rand::rng();
    (0..CHALLENGE_LEN).map(|_| char::from(b'0' + rng.random_range(0..10u8))).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_md5_from_challenge() {
        // md5("12345secret")
        assert_eq!(md5_from_challenge("12345", "secret"), "d6bf7523a8407696bb9448d0d0fecca8");
        assert!(challenge_ok(&md5_from_challenge("12345", "secret"), "12345", "secret"));
        assert!(!challenge_ok(&md5_from_challenge("12345", "secret"), "12345", "other"));
    }

    #[test]
    fn test_make_challenge() {
        let c = make_challenge();
        assert_eq!(c.len(), 10);
        assert!(c.bytes().all(|b| b.is_ascii_digit()));
    }
}
