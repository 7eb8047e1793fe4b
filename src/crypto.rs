use std::collections::TryReserveError;
use std::fmt;

use aes::{
    cipher::{generic_array::GenericArray, KeyInit},
    Aes128,
};
use thiserror::Error;
use zeroize::Zeroize;

pub mod backend;
pub mod xtsn;

/// Always 128 bits by definition
pub const AES_BLOCK_SIZE: usize = 16;

/// Alias for a block-sized byte array
pub type Block = [u8; AES_BLOCK_SIZE];

/// Which way the data cipher runs. The tweak cipher
/// ignores this and always encrypts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Encrypt,
    Decrypt,
}

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum XtsnError {
    #[error("{which} key must be {expected} bytes, got {len}", expected = RoundKeys::KEY_LEN)]
    InvalidKeyLength { which: &'static str, len: usize },
    #[error("Buffer length {0} is not a multiple of 16")]
    InvalidBufferLength(usize),
    #[error("Skipped bytes {0} is not a multiple of 16")]
    InvalidSkippedBytes(u64),
    #[error("Sector size {0} must be non-zero and a multiple of 16")]
    InvalidSectorSize(u64),
    #[error("Couldn't allocate the output buffer")]
    AllocationFailure(#[from] TryReserveError),
    #[error("Accelerated backend failed in {0}")]
    BackendFailure(&'static str),
    #[error("I/O error on the encrypted region")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, XtsnError>;

/// An expanded AES-128 key. The raw key (round key 0)
/// is kept for backends that run their own schedule.
#[derive(Clone)]
pub struct RoundKeys {
    key: [u8; Self::KEY_LEN],
    cipher: Aes128,
}

impl RoundKeys {
    pub const KEY_LEN: usize = 16;

    fn expand(which: &'static str, key: &[u8]) -> Result<Self> {
        let key: [u8; Self::KEY_LEN] = key.try_into().map_err(|_| XtsnError::InvalidKeyLength {
            which,
            len: key.len(),
        })?;
        Ok(Self {
            cipher: Aes128::new(&GenericArray::from(key)),
            key,
        })
    }

    pub(crate) fn key(&self) -> &[u8; Self::KEY_LEN] {
        &self.key
    }

    pub(crate) fn cipher(&self) -> &Aes128 {
        &self.cipher
    }
}

impl Drop for RoundKeys {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

impl fmt::Debug for RoundKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoundKeys").finish_non_exhaustive()
    }
}

/// The two key schedules XTSN needs: one for the
/// data blocks and one for the sector tweaks.
/// Built once, then shared by every cipher call.
#[derive(Debug, Clone)]
pub struct RoundKeySet {
    data: RoundKeys,
    tweak: RoundKeys,
}

impl RoundKeySet {
    pub fn derive(data_key: &[u8], tweak_key: &[u8]) -> Result<Self> {
        Ok(Self {
            data: RoundKeys::expand("crypt", data_key)?,
            tweak: RoundKeys::expand("tweak", tweak_key)?,
        })
    }

    pub fn data(&self) -> &RoundKeys {
        &self.data
    }

    pub fn tweak(&self) -> &RoundKeys {
        &self.tweak
    }
}
