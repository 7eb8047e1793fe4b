//! Single-block AES-128 transforms the sector engine runs on.
//!
//! Two realizations exist: [`Portable`], built on the `aes` crate,
//! and an accelerated one that calls into a libcrypto discovered at
//! runtime (see [`openssl`]). Both must produce identical output;
//! [`registry`] decides which one is active for the process.

use std::sync::Arc;

use aes::cipher::{generic_array::GenericArray, BlockDecrypt, BlockEncrypt};

use super::{Block, Direction, Result, RoundKeys};

pub mod openssl;
pub mod registry;

pub use registry::BackendPreference;

/// One keyed AES-128 block transform. Implementations may hold
/// per-call native state, hence `&mut self`.
pub trait BlockCipher {
    fn encrypt_block(&mut self, keys: &RoundKeys, block: &mut Block) -> Result<()>;

    fn decrypt_block(&mut self, keys: &RoundKeys, block: &mut Block) -> Result<()>;

    fn crypt_block(
        &mut self,
        keys: &RoundKeys,
        block: &mut Block,
        direction: Direction,
    ) -> Result<()> {
        match direction {
            Direction::Encrypt => self.encrypt_block(keys, block),
            Direction::Decrypt => self.decrypt_block(keys, block),
        }
    }
}

/// The bundled software implementation. Never fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct Portable;

impl BlockCipher for Portable {
    fn encrypt_block(&mut self, keys: &RoundKeys, block: &mut Block) -> Result<()> {
        keys.cipher()
            .encrypt_block(GenericArray::from_mut_slice(block));
        Ok(())
    }

    fn decrypt_block(&mut self, keys: &RoundKeys, block: &mut Block) -> Result<()> {
        keys.cipher()
            .decrypt_block(GenericArray::from_mut_slice(block));
        Ok(())
    }
}

/// The capability handed to the sector engine. Cloning is cheap;
/// a loaded library stays mapped while any clone is alive.
#[derive(Debug, Clone)]
pub enum Backend {
    Portable,
    OpenSsl(Arc<openssl::LibCrypto>),
}

impl Backend {
    pub fn name(&self) -> &'static str {
        match self {
            Backend::Portable => "portable",
            Backend::OpenSsl(_) => "openssl",
        }
    }

    pub fn is_accelerated(&self) -> bool {
        matches!(self, Backend::OpenSsl(_))
    }
}

#[cfg(test)]
mod tests {
    use super::super::RoundKeySet;
    use super::*;
    use hex_literal::hex;

    #[test]
    fn test_portable_fips197_vector() {
        let keys =
            RoundKeySet::derive(&hex!("000102030405060708090a0b0c0d0e0f"), &[0; 16]).unwrap();
        let mut block = hex!("00112233445566778899aabbccddeeff");
        Portable.encrypt_block(keys.data(), &mut block).unwrap();
        assert_eq!(block, hex!("69c4e0d86a7b0430d8cdb78070b4c55a"));
        Portable.decrypt_block(keys.data(), &mut block).unwrap();
        assert_eq!(block, hex!("00112233445566778899aabbccddeeff"));
    }

    #[test]
    fn test_crypt_block_follows_direction() {
        let keys = RoundKeySet::derive(&[7; 16], &[9; 16]).unwrap();
        let mut forward = [0x5A; 16];
        let mut explicit = forward;
        Portable
            .crypt_block(keys.data(), &mut forward, Direction::Encrypt)
            .unwrap();
        Portable.encrypt_block(keys.data(), &mut explicit).unwrap();
        assert_eq!(forward, explicit);
        Portable
            .crypt_block(keys.data(), &mut forward, Direction::Decrypt)
            .unwrap();
        assert_eq!(forward, [0x5A; 16]);
    }
}
