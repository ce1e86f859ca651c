//! P-192 Challenge/Response
//!
//! Keys and challenges are points on NIST P-192. Points travel as a sign
//! character followed by the hex x coordinate: `+` when y is even, `-` when
//! it is odd. Private keys are plain hex scalars.
//!
//! ```text
//!   server                                   client (private k, public K = k·G)
//!   secret s, challenge C = s·G  ──── C ───▶
//!   solution = x(s·K)            ◀── x(k·C) ─ answer
//! ```
//!
//! Both sides arrive at x(s·k·G), so the answer matches the solution.

use p192::elliptic_curve::group::Curve;
use p192::elliptic_curve::sec1::ToEncodedPoint;
use p192::{FieldBytes, NistP192};
use rand::rngs::OsRng;
use thiserror::Error;

/// P-192 public key.
pub type PublicKey = p192::elliptic_curve::PublicKey<NistP192>;

/// P-192 private key.
pub type SecretKey = p192::elliptic_curve::SecretKey<NistP192>;

/// Byte length of a P-192 scalar or coordinate.
const FIELD_LEN: usize = 24;

/// Key and point errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Not valid hex or too long.
    #[error("invalid hex: {0}")]
    InvalidHex(String),

    /// Not a usable private key.
    #[error("invalid private key")]
    InvalidPrivateKey,

    /// Missing sign or not on the curve.
    #[error("invalid point: {0}")]
    InvalidPoint(String),
}

/// A private key and its public key, both encoded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyPair {
    /// Hex scalar.
    pub private: String,
    /// Encoded public point.
    pub public: String,
}

/// A challenge and the answer expected for it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Challenge {
    /// Encoded challenge point, sent to the client.
    pub challenge: String,
    /// Hex x coordinate the client must answer with.
    pub solution: String,
}

fn field_bytes(hex_str: &str) -> Result<FieldBytes, CryptoError> {
    let invalid = || CryptoError::InvalidHex(hex_str.to_string());
    let digits = hex_str.trim();
    if digits.is_empty() || digits.len() > FIELD_LEN * 2 {
        return Err(invalid());
    }
    let padded = format!("{:0>width$}", digits, width = FIELD_LEN * 2);
    let bytes = hex::decode(padded).map_err(|_| invalid())?;
    Ok(FieldBytes::clone_from_slice(&bytes))
}

fn encode_point(key: &PublicKey) -> String {
    let point = key.to_encoded_point(true);
    let bytes = point.as_bytes();
    let sign = if bytes[0] == 0x03 { '-' } else { '+' };
    format!("{}{}", sign, hex::encode(&bytes[1..]))
}

/// Decode a `+`/`-` prefixed point.
pub fn parse_point(s: &str) -> Result<PublicKey, CryptoError> {
    let s = s.trim();
    let invalid = || CryptoError::InvalidPoint(s.to_string());
    let tag = match s.chars().next() {
        Some('+') => 0x02,
        Some('-') => 0x03,
        _ => return Err(invalid()),
    };
    let x = field_bytes(&s[1..]).map_err(|_| invalid())?;
    let mut sec1 = Vec::with_capacity(FIELD_LEN + 1);
    sec1.push(tag);
    sec1.extend_from_slice(&x);
    PublicKey::from_sec1_bytes(&sec1).map_err(|_| invalid())
}

/// Decode a hex private key.
pub fn parse_private(s: &str) -> Result<SecretKey, CryptoError> {
    let bytes = field_bytes(s)?;
    SecretKey::from_bytes(&bytes).map_err(|_| CryptoError::InvalidPrivateKey)
}

/// Fresh random key pair.
pub fn generate_key_pair() -> KeyPair {
    let secret = SecretKey::random(&mut OsRng);
    KeyPair {
        private: hex::encode(secret.to_bytes()),
        public: encode_point(&secret.public_key()),
    }
}

/// Public key belonging to a private key.
pub fn public_from_private(private: &str) -> Result<String, CryptoError> {
    Ok(encode_point(&parse_private(private)?.public_key()))
}

fn shared_x(secret: &SecretKey, point: &PublicKey) -> Result<String, CryptoError> {
    let shared = (point.to_projective() * *secret.to_nonzero_scalar()).to_affine();
    let encoded = shared.to_encoded_point(false);
    let x = encoded
        .x()
        .ok_or_else(|| CryptoError::InvalidPoint("identity".to_string()))?;
    Ok(hex::encode(x))
}

/// New challenge for the holder of `public`.
pub fn generate_challenge(public: &PublicKey) -> Result<Challenge, CryptoError> {
    let secret = SecretKey::random(&mut OsRng);
    Ok(Challenge {
        challenge: encode_point(&secret.public_key()),
        solution: shared_x(&secret, public)?,
    })
}

/// Client side: answer `challenge` with `private`.
pub fn answer_challenge(private: &str, challenge: &str) -> Result<String, CryptoError> {
    let secret = parse_private(private)?;
    let point = parse_point(challenge)?;
    shared_x(&secret, &point)
}

fn normalize(hex_str: &str) -> String {
    let lower = hex_str.trim().to_ascii_lowercase();
    lower.trim_start_matches('0').to_string()
}

/// Compare an answer with the expected solution, ignoring case and leading
/// zeros.
pub fn answers_match(solution: &str, answer: &str) -> bool {
    let (s, a) = (normalize(solution), normalize(answer));
    !s.is_empty() && s == a
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_pair_encoding() {
        let kp = generate_key_pair();
        assert!(kp.public.starts_with('+') || kp.public.starts_with('-'));
        assert_eq!(kp.public.len(), 1 + 48);
        assert_eq!(public_from_private(&kp.private).unwrap(), kp.public);
        let parsed = parse_point(&kp.public).unwrap();
        assert_eq!(encode_point(&parsed), kp.public);
    }

    #[test]
    fn test_challenge_answer() {
        let kp = generate_key_pair();
        let public = parse_point(&kp.public).unwrap();
        let ch = generate_challenge(&public).unwrap();
        let answer = answer_challenge(&kp.private, &ch.challenge).unwrap();
        assert!(answers_match(&ch.solution, &answer));
        assert!(answers_match(&ch.solution, &answer.to_uppercase()));

        let other = generate_key_pair();
        let wrong = answer_challenge(&other.private, &ch.challenge).unwrap();
        assert!(!answers_match(&ch.solution, &wrong));
    }

    #[test]
    fn test_normalized_comparison() {
        assert!(answers_match("00ab12", "AB12"));
        assert!(!answers_match("ab12", "ab13"));
        assert!(!answers_match("", ""));
        assert!(!answers_match("000", "0"));
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(parse_point("abc").is_err());
        assert!(parse_point("+zz").is_err());
        assert!(parse_point("+").is_err());
        assert!(parse_private("").is_err());
        assert!(parse_private(&"f".repeat(49)).is_err());
        // zero is not a valid private key
        assert!(matches!(parse_private("0"), Err(CryptoError::InvalidPrivateKey)));
    }
}
