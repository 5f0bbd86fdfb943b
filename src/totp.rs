// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Time-based one-time codes for command authentication.
//!
//! The alarm controller validates every command against an RFC 4226/6238
//! HMAC-SHA1 code derived from a shared secret and the current time step.
//! The secret travels base32-encoded in the controller's wire alphabet
//! (`0-9` then `A-V`, 5 bits per character), not the RFC 4648 alphabet.
//!
//! This module is pure: no clock access, no I/O. Callers supply the epoch,
//! typically after correcting for the measured client/server clock offset.
//!
//! # Examples
//!
//! ```
//! use atslink::totp::{generate_code, TotpOptions};
//!
//! let code = generate_code("79STCF7GW7Q64TLD", 1_600_000_000, &TotpOptions::default()).unwrap();
//! assert_eq!(code.len(), 6);
//! ```

use hmac::{Hmac, Mac};
use sha1::Sha1;

use crate::error::SecretError;

/// Base32 alphabet used by the controller for shared secrets.
pub const BASE32_ALPHABET: &[u8; 32] = b"0123456789ABCDEFGHIJKLMNOPQRSTUV";

/// Parameters for code generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TotpOptions {
    /// Length of one time step in seconds.
    pub step_seconds: u64,
    /// Number of digits in the generated code.
    pub digits: usize,
}

impl Default for TotpOptions {
    fn default() -> Self {
        Self {
            step_seconds: 60,
            digits: 6,
        }
    }
}

impl TotpOptions {
    /// Sets a custom time step.
    #[must_use]
    pub fn with_step(mut self, step_seconds: u64) -> Self {
        self.step_seconds = step_seconds;
        self
    }

    /// Sets a custom code length.
    #[must_use]
    pub fn with_digits(mut self, digits: usize) -> Self {
        self.digits = digits;
        self
    }
}

/// Decodes a base32 secret in the wire alphabet to raw key bytes.
///
/// Each character contributes 5 bits; the bit stream is zero-padded to a
/// byte boundary. Lowercase input is accepted.
///
/// # Errors
///
/// Returns [`SecretError::InvalidSecret`] for characters outside the
/// alphabet and [`SecretError::EmptySecret`] for an empty string.
pub fn decode_secret(secret: &str) -> Result<Vec<u8>, SecretError> {
    if secret.is_empty() {
        return Err(SecretError::EmptySecret);
    }

    let mut bytes = Vec::with_capacity(secret.len() * 5 / 8 + 1);
    let mut acc: u16 = 0;
    let mut bits: u8 = 0;

    for c in secret.chars() {
        let upper = c.to_ascii_uppercase();
        let value = BASE32_ALPHABET
            .iter()
            .position(|&a| a == upper as u8)
            .ok_or(SecretError::InvalidSecret(c))?;

        acc = (acc << 5) | value as u16;
        bits += 5;
        if bits >= 8 {
            bits -= 8;
            bytes.push((acc >> bits) as u8);
            acc &= (1 << bits) - 1;
        }
    }

    // Trailing bits are zero-padded into a final byte, matching the
    // controller's decoder.
    if bits > 0 {
        bytes.push((acc << (8 - bits)) as u8);
    }

    Ok(bytes)
}

/// Generates a one-time code for the given secret and epoch.
///
/// The time counter is `floor(epoch_seconds / step_seconds)` encoded as
/// 8 big-endian bytes, signed with HMAC-SHA1 and truncated per RFC 4226:
/// the low 4 bits of the last digest byte select a 4-byte window, the top
/// bit is masked off, and the decimal value is zero-padded before taking
/// the last `digits` characters.
///
/// # Errors
///
/// Returns [`SecretError`] if the secret cannot be decoded.
pub fn generate_code(
    secret: &str,
    epoch_seconds: u64,
    opts: &TotpOptions,
) -> Result<String, SecretError> {
    let key = decode_secret(secret)?;
    let counter = epoch_seconds / opts.step_seconds;

    // HMAC key length is unconstrained for SHA1, so new_from_slice cannot fail.
    let mut mac = Hmac::<Sha1>::new_from_slice(&key).map_err(|_| SecretError::EmptySecret)?;
    mac.update(&counter.to_be_bytes());
    let digest = mac.finalize().into_bytes();

    let offset = (digest[digest.len() - 1] & 0x0f) as usize;
    let binary = (u32::from(digest[offset]) << 24
        | u32::from(digest[offset + 1]) << 16
        | u32::from(digest[offset + 2]) << 8
        | u32::from(digest[offset + 3]))
        & 0x7fff_ffff;

    let padded = format!("{binary:0width$}", width = opts.digits);
    Ok(padded[padded.len() - opts.digits..].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    // RFC 6238 test secret "12345678901234567890" re-encoded in the wire
    // alphabet (20 bytes, 32 characters, no padding).
    const RFC_SECRET: &str = "64P36D1L6ORJGE9G64P36D1L6ORJGE9G";

    fn rfc_options() -> TotpOptions {
        TotpOptions::default().with_step(30).with_digits(8)
    }

    #[test]
    fn decode_secret_known_bytes() {
        let key = decode_secret(RFC_SECRET).unwrap();
        assert_eq!(key, b"12345678901234567890");
    }

    #[test]
    fn decode_secret_pads_trailing_bits() {
        // "8" is 01000; padded to one byte 0100_0000.
        assert_eq!(decode_secret("8").unwrap(), vec![0x40]);
    }

    #[test]
    fn decode_secret_accepts_lowercase() {
        assert_eq!(
            decode_secret("79stcf7gw7q64tld").unwrap(),
            decode_secret("79STCF7GW7Q64TLD").unwrap()
        );
    }

    #[test]
    fn decode_secret_rejects_invalid_characters() {
        assert_eq!(decode_secret("79ST!F"), Err(SecretError::InvalidSecret('!')));
        // 'W' is past the last alphabet character 'V'.
        assert_eq!(decode_secret("W"), Err(SecretError::InvalidSecret('W')));
    }

    #[test]
    fn decode_secret_rejects_empty() {
        assert_eq!(decode_secret(""), Err(SecretError::EmptySecret));
    }

    #[test]
    fn rfc_6238_sha1_vectors() {
        let opts = rfc_options();
        assert_eq!(generate_code(RFC_SECRET, 59, &opts).unwrap(), "94287082");
        assert_eq!(
            generate_code(RFC_SECRET, 1_111_111_109, &opts).unwrap(),
            "07081804"
        );
        assert_eq!(
            generate_code(RFC_SECRET, 1_234_567_890, &opts).unwrap(),
            "89005924"
        );
        assert_eq!(
            generate_code(RFC_SECRET, 2_000_000_000, &opts).unwrap(),
            "69279037"
        );
    }

    #[test]
    fn codes_stable_within_one_step() {
        let opts = TotpOptions::default();
        let base = 1_700_000_040; // start of a 60 s step
        let a = generate_code("79STCF7GW7Q64TLD", base, &opts).unwrap();
        let b = generate_code("79STCF7GW7Q64TLD", base + 59, &opts).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn codes_differ_across_steps() {
        let opts = TotpOptions::default();
        let base = 1_700_000_040;
        let a = generate_code("79STCF7GW7Q64TLD", base, &opts).unwrap();
        let b = generate_code("79STCF7GW7Q64TLD", base + 60, &opts).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn code_length_matches_digits() {
        let opts = TotpOptions::default();
        let code = generate_code("79STCF7GW7Q64TLD", 1_700_000_000, &opts).unwrap();
        assert_eq!(code.len(), 6);
        assert!(code.chars().all(|c| c.is_ascii_digit()));
    }
}
