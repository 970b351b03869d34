//! Two-stage keyed-hash login authentication.
//!
//! The login payload is an 8-byte ASCII serial number, an ASCII hex
//! token, and a trailing device-class byte. The token is derived in two
//! HMAC-MD5 stages:
//!
//! ```text
//! k1 = HMAC-MD5(secret_key, serial)            → hex
//! k2 = HMAC-MD5(hex(k1), decimal(time_bucket)) → hex  = token
//! ```
//!
//! The time bucket is the Unix timestamp rounded half-up to the nearest
//! ten seconds; both sides compute it independently at send time, which
//! tolerates roughly ±5 s of clock skew. Skew beyond that causes a
//! spurious login rejection — an operational constraint, not a defect.
//! The server's own login acknowledgement token uses the same
//! derivation with a distinct API key.

use std::time::{SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use md5::Md5;

use crate::command::DeviceClass;
use crate::error::EngineError;

type HmacMd5 = Hmac<Md5>;

/// Length of the serial-number prefix of the login payload.
pub const SERIAL_LEN: usize = 8;

/// Outcome of a successful login validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginRequest {
    pub serial: String,
    pub device_class: DeviceClass,
}

/// Validates device login tokens and produces the server's
/// acknowledgement token.
#[derive(Debug, Clone)]
pub struct Authenticator {
    secret_key: String,
    api_key: String,
}

impl Authenticator {
    pub fn new(secret_key: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            secret_key: secret_key.into(),
            api_key: api_key.into(),
        }
    }

    /// Validate a login payload against the current time bucket.
    ///
    /// Cellular devices currently bypass the token check — their link
    /// already authenticates at the carrier level and the firmware does
    /// not implement the hash.
    pub fn verify(&self, payload: &[u8]) -> Result<LoginRequest, EngineError> {
        if payload.len() < SERIAL_LEN + 1 {
            return Err(EngineError::LoginRejected("login payload too short"));
        }
        let device_class = DeviceClass::try_from(payload[payload.len() - 1])?;
        let serial = std::str::from_utf8(&payload[..SERIAL_LEN])
            .map_err(|_| EngineError::LoginRejected("serial is not ASCII"))?
            .to_string();

        if device_class.is_self_fetch() {
            return Ok(LoginRequest {
                serial,
                device_class,
            });
        }

        let token = std::str::from_utf8(&payload[SERIAL_LEN..payload.len() - 1])
            .map_err(|_| EngineError::LoginRejected("token is not ASCII"))?;
        let expected = derive_token(&self.secret_key, &serial, now_bucket());
        if token != expected {
            return Err(EngineError::LoginRejected("token mismatch"));
        }
        Ok(LoginRequest {
            serial,
            device_class,
        })
    }

    /// Token carried in the server's login acknowledgement, derived
    /// with the API key for the current time bucket.
    pub fn ack_token(&self, serial: &str) -> Vec<u8> {
        derive_token(&self.api_key, serial, now_bucket()).into_bytes()
    }
}

/// The two-stage derivation. Public so scripted devices in tests can
/// produce valid tokens.
pub fn derive_token(key: &str, serial: &str, bucket: i64) -> String {
    let k1 = hex::encode(hmac_md5(key.as_bytes(), serial.as_bytes()));
    let k2 = hmac_md5(k1.as_bytes(), bucket.to_string().as_bytes());
    hex::encode(k2)
}

/// Round a Unix timestamp half-up to the nearest 10-second boundary.
pub fn time_bucket(unix_secs: i64) -> i64 {
    let rem = unix_secs.rem_euclid(10);
    unix_secs - rem + if rem < 5 { 0 } else { 10 }
}

fn now_bucket() -> i64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    time_bucket(now.as_secs() as i64)
}

fn hmac_md5(key: &[u8], message: &[u8]) -> [u8; 16] {
    // HMAC accepts keys of any length; this cannot fail.
    let mut mac = HmacMd5::new_from_slice(key).expect("HMAC-MD5 key");
    mac.update(message);
    mac.finalize().into_bytes().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_token_matches_reference_vector() {
        // Independently derived with a reference HMAC-MD5
        // implementation.
        let token = derive_token("s3cr3t", "DEV00001", 1_700_000_000);
        assert_eq!(token, "9a73c89073c3e20b070a216ae28b82bf");
        assert_eq!(token.len(), 32);
    }

    #[test]
    fn distinct_keys_give_distinct_tokens() {
        let recv = derive_token("s3cr3t", "DEV00001", 1_700_000_000);
        let send = derive_token("apik3y", "DEV00001", 1_700_000_000);
        assert_eq!(send, "7c0ccefd6919ad6005fab4171bc3c945");
        assert_ne!(recv, send);
    }

    #[test]
    fn bucket_rounds_half_up() {
        assert_eq!(time_bucket(1_700_000_000), 1_700_000_000);
        assert_eq!(time_bucket(1_700_000_004), 1_700_000_000);
        assert_eq!(time_bucket(1_700_000_005), 1_700_000_010);
        assert_eq!(time_bucket(1_700_000_009), 1_700_000_010);
        assert_eq!(time_bucket(1_700_000_010), 1_700_000_010);
    }

    #[test]
    fn verify_accepts_current_bucket_token() {
        let auth = Authenticator::new("s3cr3t", "apik3y");
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs() as i64;
        let token = derive_token("s3cr3t", "DEV00001", time_bucket(now));

        let mut payload = b"DEV00001".to_vec();
        payload.extend_from_slice(token.as_bytes());
        payload.push(DeviceClass::WifiTest as u8);

        let login = auth.verify(&payload).unwrap();
        assert_eq!(login.serial, "DEV00001");
        assert_eq!(login.device_class, DeviceClass::WifiTest);
    }

    #[test]
    fn verify_rejects_bad_token() {
        let auth = Authenticator::new("s3cr3t", "apik3y");
        let mut payload = b"DEV00001".to_vec();
        payload.extend_from_slice(b"00000000000000000000000000000000");
        payload.push(DeviceClass::WifiTest as u8);
        assert!(matches!(
            auth.verify(&payload),
            Err(EngineError::LoginRejected("token mismatch"))
        ));
    }

    #[test]
    fn verify_rejects_short_payload() {
        let auth = Authenticator::new("s3cr3t", "apik3y");
        assert!(auth.verify(b"DEV0001").is_err());
    }

    #[test]
    fn cellular_class_bypasses_token_check() {
        let auth = Authenticator::new("s3cr3t", "apik3y");
        let mut payload = b"DEV00002".to_vec();
        payload.push(DeviceClass::CellularTest as u8);
        let login = auth.verify(&payload).unwrap();
        assert_eq!(login.device_class, DeviceClass::CellularTest);
    }

    #[test]
    fn ack_token_is_hex_digest() {
        let auth = Authenticator::new("s3cr3t", "apik3y");
        let ack = auth.ack_token("DEV00001");
        assert_eq!(ack.len(), 32);
        assert!(ack.iter().all(|b| b.is_ascii_hexdigit()));
    }
}
