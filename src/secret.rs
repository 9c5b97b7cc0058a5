// Copyright 2025 Jayashankar
// SPDX-License-Identifier: Apache-2.0

//! Random per-installation passwords for the keystore.

use rand::Rng;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Entropy carried by every generated password.
pub const PASSWORD_BITS: usize = 130;

const BASE32_ALPHABET: &[u8; 32] = b"0123456789abcdefghijklmnopqrstuv";

/// Number of base-32 characters needed to carry [`PASSWORD_BITS`].
pub const PASSWORD_LEN: usize = PASSWORD_BITS.div_ceil(5);

/// A String wrapper that securely zeroizes its contents on drop.
#[derive(Zeroize, ZeroizeOnDrop, PartialEq, Eq)]
pub struct Password(String);

impl Password {
    /// Draw a fresh password from the thread-local CSPRNG.
    pub fn generate() -> Self {
        let mut rng = rand::rng();
        let value = (0..PASSWORD_LEN)
            .map(|_| BASE32_ALPHABET[rng.random_range(0..BASE32_ALPHABET.len())] as char)
            .collect();
        Self(value)
    }

    /// Wrap a password loaded from the secret store.
    pub fn from_stored(value: String) -> Self {
        Self(value)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::ops::Deref for Password {
    type Target = str;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl AsRef<str> for Password {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Password {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Password(**redacted**)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_password_shape() {
        let password = Password::generate();
        assert_eq!(password.len(), PASSWORD_LEN);
        assert!(password.bytes().all(|b| BASE32_ALPHABET.contains(&b)));
    }

    #[test]
    fn test_passwords_are_independent() {
        let a = Password::generate();
        let b = Password::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn test_debug_does_not_leak() {
        let password = Password::from_stored("hunter2".into());
        assert!(!format!("{:?}", password).contains("hunter2"));
    }
}
