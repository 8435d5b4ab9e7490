//! Short public codes for uploaded files.
//!
//! Codes are fixed-length strings over the 62 symbols `0-9A-Za-z`, drawn from
//! the operating system's entropy source. The generator knows nothing about
//! codes already issued; uniqueness is enforced by the metadata store.

use rand::{RngCore, rngs::OsRng};
use thiserror::Error;

/// Symbols a code may contain.
pub const ALPHABET: &[u8; 62] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// Default code length (62^6 ≈ 5.6e10 codes).
pub const DEFAULT_CODE_LENGTH: usize = 6;

/// Largest multiple of 62 that fits in a byte. Bytes at or above it are
/// rejected so every symbol is equally likely.
const REJECTION_BOUND: u8 = 248;

#[derive(Debug, Error)]
pub enum CodeError {
    #[error("entropy source unavailable: {0}")]
    Entropy(String),
}

/// Something that can mint a candidate code.
pub trait CodeGenerator: Send + Sync {
    fn generate(&self) -> Result<String, CodeError>;
}

/// Cryptographically random generator backed by [`OsRng`].
#[derive(Debug, Clone)]
pub struct RandomCodeGenerator {
    length: usize,
}

impl RandomCodeGenerator {
    pub fn new(length: usize) -> Self {
        Self { length }
    }
}

impl Default for RandomCodeGenerator {
    fn default() -> Self {
        Self::new(DEFAULT_CODE_LENGTH)
    }
}

impl CodeGenerator for RandomCodeGenerator {
    fn generate(&self) -> Result<String, CodeError> {
        let mut code = String::with_capacity(self.length);
        let mut buf = [0u8; 32];

        while code.len() < self.length {
            OsRng
                .try_fill_bytes(&mut buf)
                .map_err(|err| CodeError::Entropy(err.to_string()))?;

            for &byte in buf.iter().filter(|b| **b < REJECTION_BOUND) {
                code.push(ALPHABET[(byte % 62) as usize] as char);
                if code.len() == self.length {
                    break;
                }
            }
        }

        Ok(code)
    }
}
