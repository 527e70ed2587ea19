// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Local record ID generation.
//!
//! IDs are 15 characters over `[a-z0-9]`, drawn from the OS RNG. The format
//! is byte-compatible with server-issued IDs, so a locally created record can
//! be replayed to the server under its original ID and reconciliation is
//! rarely needed.

use rand::rngs::OsRng;
use rand::Rng;

/// Length of a record ID.
pub const ID_LENGTH: usize = 15;

const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Generate a fresh server-compatible record ID.
#[must_use]
pub fn generate() -> String {
    let mut rng = OsRng;
    (0..ID_LENGTH)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

/// Check whether a string is a well-formed record ID.
#[must_use]
pub fn is_valid(id: &str) -> bool {
    id.len() == ID_LENGTH
        && id.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
}
