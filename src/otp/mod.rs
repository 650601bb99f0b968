//! RFC 6238 time-based one-time passwords over HMAC-SHA1.

pub mod base32;

use hmac::{Hmac, Mac};
use rand::{rngs::OsRng, RngCore};
use regex::Regex;
use sha1::Sha1;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

type HmacSha1 = Hmac<Sha1>;

pub const DEFAULT_PERIOD: u64 = 30;
pub const DEFAULT_DIGITS: u32 = 6;
pub const DEFAULT_SECRET_BYTES: usize = 20;

/// 80-bit minimum once normalized.
const MIN_SECRET_CHARS: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TotpError {
    InvalidSecretFormat,
}

impl fmt::Display for TotpError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TotpError::InvalidSecretFormat => write!(formatter, "invalid TOTP secret format"),
        }
    }
}

impl std::error::Error for TotpError {}

#[derive(Debug, Clone)]
pub struct TotpOptions {
    pub period: u64,
    pub digits: u32,
    /// Unix timestamp in milliseconds; the current time when `None`.
    pub timestamp_millis: Option<u64>,
}

impl Default for TotpOptions {
    fn default() -> Self {
        Self {
            period: DEFAULT_PERIOD,
            digits: DEFAULT_DIGITS,
            timestamp_millis: None,
        }
    }
}

impl TotpOptions {
    #[must_use]
    pub fn at_millis(timestamp_millis: u64) -> Self {
        Self {
            timestamp_millis: Some(timestamp_millis),
            ..Self::default()
        }
    }
}

fn normalize_secret(secret: &str) -> String {
    let compact: String = secret.chars().filter(|c| !c.is_whitespace()).collect();
    compact.to_ascii_uppercase().trim_end_matches('=').to_string()
}

/// Whether `secret` is a usable Base32 TOTP secret.
#[must_use]
pub fn is_valid_secret(secret: &str) -> bool {
    let normalized = normalize_secret(secret);

    normalized.len() >= MIN_SECRET_CHARS
        && Regex::new(r"^[A-Z2-7]+$").map_or(false, |re| re.is_match(&normalized))
}

/// Generate a fresh Base32-encoded secret from the OS entropy source.
#[must_use]
pub fn generate_secret(byte_length: usize) -> String {
    let mut bytes = vec![0u8; byte_length];
    OsRng.fill_bytes(&mut bytes);

    base32::encode(&bytes)
}

/// Generate the one-time code for `secret` at the given options.
///
/// # Errors
/// Returns [`TotpError::InvalidSecretFormat`] when the secret does not pass
/// [`is_valid_secret`]; a bad secret never falls back to a default code.
pub fn generate(secret: &str, options: &TotpOptions) -> Result<String, TotpError> {
    if !is_valid_secret(secret) {
        return Err(TotpError::InvalidSecretFormat);
    }

    let key =
        base32::decode(&normalize_secret(secret)).map_err(|_| TotpError::InvalidSecretFormat)?;

    let timestamp_millis = options.timestamp_millis.unwrap_or_else(now_millis);
    let counter = timestamp_millis / 1000 / options.period;

    let mut mac =
        HmacSha1::new_from_slice(&key).map_err(|_| TotpError::InvalidSecretFormat)?;
    mac.update(&counter.to_be_bytes());
    let digest = mac.finalize().into_bytes();

    // RFC 4226 dynamic truncation
    let offset = (digest[19] & 0x0f) as usize;
    let code = u32::from_be_bytes([
        digest[offset] & 0x7f,
        digest[offset + 1],
        digest[offset + 2],
        digest[offset + 3],
    ]) % 10u32.pow(options.digits);

    Ok(format!("{code:0width$}", width = options.digits as usize))
}

/// Seconds until the current code rolls over, in `[1, period]`.
#[must_use]
pub fn remaining_seconds(period: u64) -> u64 {
    period - (now_millis() / 1000) % period
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_millis() as u64)
}
