//! Nintendo's AES-XTS variant ("XTSN").
//!
//! The block layout and tweak evolution are those of IEEE P1619
//! XTS-AES-128. The one difference is how the sector index reaches
//! the tweak cipher: as a 128-bit **big-endian** integer, where P1619
//! uses little-endian. That layout is part of the on-disk format.
//!
//! Only whole 16-byte blocks are handled; there is no ciphertext
//! stealing. A buffer may start partway into a sector
//! ([`Position::skipped_bytes`]), which is how byte-addressed reads
//! land in the middle of a 0x4000 byte NAND cluster.

use tracing::trace;

use super::backend::{registry, Backend, BlockCipher, Portable};
use super::{Block, Direction, Result, RoundKeySet, RoundKeys, XtsnError, AES_BLOCK_SIZE};

pub const DEFAULT_SECTOR_SIZE: u64 = 0x200;

/// Low byte of x^128 + x^7 + x^2 + x + 1,
/// folded back in when doubling overflows
const GF_128_FDBK: u8 = 0x87;

/// A 128-bit sector number kept as two 64-bit words.
/// Images addressed past 2^64 sectors are legal input.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SectorIndex {
    lo: u64,
    hi: u64,
}

impl SectorIndex {
    pub const fn new(lo: u64, hi: u64) -> Self {
        Self { lo, hi }
    }

    pub const fn lo(&self) -> u64 {
        self.lo
    }

    pub const fn hi(&self) -> u64 {
        self.hi
    }

    pub fn step(&mut self) {
        self.step_by(1);
    }

    /// Adds `amount`, carrying into the high word when the low word wraps.
    /// The high word itself wraps silently.
    pub fn step_by(&mut self, amount: u64) {
        let (lo, carry) = self.lo.overflowing_add(amount);
        if carry {
            self.hi = self.hi.wrapping_add(1);
        }
        self.lo = lo;
    }

    /// The tweak cipher's input block: high word first, each word
    /// big-endian.
    pub fn to_tweak_input(self) -> Block {
        let mut bytes = [0; AES_BLOCK_SIZE];
        bytes[..8].copy_from_slice(&self.hi.to_be_bytes());
        bytes[8..].copy_from_slice(&self.lo.to_be_bytes());
        bytes
    }
}

impl From<u64> for SectorIndex {
    fn from(lo: u64) -> Self {
        Self::new(lo, 0)
    }
}

impl From<u128> for SectorIndex {
    fn from(value: u128) -> Self {
        Self::new(value as u64, (value >> 64) as u64)
    }
}

impl From<SectorIndex> for u128 {
    fn from(index: SectorIndex) -> Self {
        (u128::from(index.hi) << 64) | u128::from(index.lo)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tweak {
    bytes: Block,
}

impl From<Block> for Tweak {
    fn from(bytes: Block) -> Self {
        Self { bytes }
    }
}

impl AsRef<Block> for Tweak {
    fn as_ref(&self) -> &Block {
        &self.bytes
    }
}

impl Tweak {
    /// Encrypts the sector index with the tweak keys. This is always
    /// a forward AES pass, for decryption as well.
    pub fn derive<C: BlockCipher>(
        cipher: &mut C,
        keys: &RoundKeys,
        sector: SectorIndex,
    ) -> Result<Self> {
        let mut bytes = sector.to_tweak_input();
        cipher.encrypt_block(keys, &mut bytes)?;
        Ok(Self { bytes })
    }

    /// Returns the mask for the current
    /// block, then moves on to the next.
    pub fn advance(&mut self) -> Block {
        let copy = self.bytes;
        self.double();
        copy
    }

    /// Multiplies by x in GF(2^128), the value read as a
    /// little-endian integer.
    fn double(&mut self) {
        let mut lo = [0; 8];
        let mut hi = [0; 8];
        lo.copy_from_slice(&self.bytes[..8]);
        hi.copy_from_slice(&self.bytes[8..]);
        let (lo, hi) = (u64::from_le_bytes(lo), u64::from_le_bytes(hi));
        let overflow = self.bytes[AES_BLOCK_SIZE - 1] & 0x80 != 0;
        let hi = (hi << 1) | (lo >> 63);
        let lo = lo << 1;
        self.bytes[..8].copy_from_slice(&lo.to_le_bytes());
        self.bytes[8..].copy_from_slice(&hi.to_le_bytes());
        if overflow {
            self.bytes[0] ^= GF_128_FDBK;
        }
    }

    fn skip(&mut self, blocks: u64) {
        for _ in 0..blocks {
            self.double();
        }
    }
}

/// Where a buffer sits on the encrypted medium.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Position {
    /// Sector the byte offset `skipped_bytes` is counted from.
    pub sector: SectorIndex,
    pub sector_size: u64,
    /// Bytes between the start of `sector` and the first byte
    /// of the buffer. May span several sectors.
    pub skipped_bytes: u64,
}

impl Position {
    pub fn new(sector: impl Into<SectorIndex>) -> Self {
        Self {
            sector: sector.into(),
            sector_size: DEFAULT_SECTOR_SIZE,
            skipped_bytes: 0,
        }
    }

    pub fn with_sector_size(self, sector_size: u64) -> Self {
        Self {
            sector_size,
            ..self
        }
    }

    pub fn with_skipped_bytes(self, skipped_bytes: u64) -> Self {
        Self {
            skipped_bytes,
            ..self
        }
    }

    fn validate(&self, len: usize) -> Result<()> {
        let block = AES_BLOCK_SIZE as u64;
        if len % AES_BLOCK_SIZE != 0 {
            return Err(XtsnError::InvalidBufferLength(len));
        }
        if self.skipped_bytes % block != 0 {
            return Err(XtsnError::InvalidSkippedBytes(self.skipped_bytes));
        }
        if self.sector_size == 0 || self.sector_size % block != 0 {
            return Err(XtsnError::InvalidSectorSize(self.sector_size));
        }
        Ok(())
    }
}

impl Default for Position {
    fn default() -> Self {
        Self::new(SectorIndex::default())
    }
}

fn xor_inplace<const N: usize>(dst: &mut [u8; N], other: &[u8; N]) {
    for (dst, &src) in dst.iter_mut().zip(other.iter()) {
        *dst ^= src
    }
}

fn blocks_in(bytes: u64) -> usize {
    usize::try_from(bytes / AES_BLOCK_SIZE as u64).unwrap_or(usize::MAX)
}

/// Runs the blocks of one sector through XEX, advancing `tweak` once per block.
fn crypt_sector<'a, C: BlockCipher>(
    cipher: &mut C,
    keys: &RoundKeys,
    tweak: &mut Tweak,
    blocks: impl Iterator<Item = &'a mut [u8]>,
    direction: Direction,
) -> Result<()> {
    for chunk in blocks {
        let mask = tweak.advance();
        let mut block: Block = [0; AES_BLOCK_SIZE];
        block.copy_from_slice(chunk);
        xor_inplace(&mut block, &mask);
        cipher.crypt_block(keys, &mut block, direction)?;
        xor_inplace(&mut block, &mask);
        chunk.copy_from_slice(&block);
    }
    Ok(())
}

/// The sector loop. `data` and `position` must already be validated.
fn run<C: BlockCipher>(
    cipher: &mut C,
    keys: &RoundKeySet,
    data: &mut [u8],
    position: Position,
    direction: Direction,
) -> Result<()> {
    let Position {
        mut sector,
        sector_size,
        mut skipped_bytes,
    } = position;
    let mut blocks = data.chunks_exact_mut(AES_BLOCK_SIZE);

    if skipped_bytes != 0 {
        sector.step_by(skipped_bytes / sector_size);
        skipped_bytes %= sector_size;
    }
    if skipped_bytes != 0 {
        let mut tweak = Tweak::derive(cipher, keys.tweak(), sector)?;
        tweak.skip(skipped_bytes / AES_BLOCK_SIZE as u64);
        let remaining = blocks_in(sector_size - skipped_bytes);
        crypt_sector(
            cipher,
            keys.data(),
            &mut tweak,
            blocks.by_ref().take(remaining),
            direction,
        )?;
        sector.step();
    }
    let per_sector = blocks_in(sector_size);
    while blocks.len() > 0 {
        let mut tweak = Tweak::derive(cipher, keys.tweak(), sector)?;
        crypt_sector(
            cipher,
            keys.data(),
            &mut tweak,
            blocks.by_ref().take(per_sector),
            direction,
        )?;
        sector.step();
    }
    Ok(())
}

/// An XTSN cipher bound to one crypt/tweak key pair.
///
/// Calls are independent of each other; the only shared state is
/// which [`Backend`] the process has selected, and that never
/// changes the output.
#[derive(Debug, Clone)]
pub struct Xtsn {
    keys: RoundKeySet,
}

impl From<RoundKeySet> for Xtsn {
    fn from(keys: RoundKeySet) -> Self {
        Self { keys }
    }
}

impl Xtsn {
    pub fn new(crypt: &[u8], tweak: &[u8]) -> Result<Self> {
        RoundKeySet::derive(crypt, tweak).map(Self::from)
    }

    pub fn keys(&self) -> &RoundKeySet {
        &self.keys
    }

    pub fn encrypt(&self, data: &[u8], position: Position) -> Result<Vec<u8>> {
        self.transform(data, position, Direction::Encrypt)
    }

    pub fn decrypt(&self, data: &[u8], position: Position) -> Result<Vec<u8>> {
        self.transform(data, position, Direction::Decrypt)
    }

    pub fn encrypt_in_place(&self, data: &mut [u8], position: Position) -> Result<()> {
        self.transform_in_place(data, position, Direction::Encrypt)
    }

    pub fn decrypt_in_place(&self, data: &mut [u8], position: Position) -> Result<()> {
        self.transform_in_place(data, position, Direction::Decrypt)
    }

    /// Transforms a copy of `data`, leaving the input untouched
    /// whatever the outcome.
    pub fn transform(
        &self,
        data: &[u8],
        position: Position,
        direction: Direction,
    ) -> Result<Vec<u8>> {
        if data.is_empty() {
            return Ok(Vec::new());
        }
        position.validate(data.len())?;
        let mut out = Vec::new();
        out.try_reserve_exact(data.len())?;
        out.extend_from_slice(data);
        self.transform_in_place(&mut out, position, direction)?;
        Ok(out)
    }

    /// Transforms `data` with the process's active backend.
    pub fn transform_in_place(
        &self,
        data: &mut [u8],
        position: Position,
        direction: Direction,
    ) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        self.transform_with(&registry::active(), data, position, direction)
    }

    /// Transforms `data` with an explicit backend.
    ///
    /// Precondition errors leave `data` untouched. After a
    /// [`XtsnError::BackendFailure`] its contents are unspecified;
    /// nothing is retried here.
    pub fn transform_with(
        &self,
        backend: &Backend,
        data: &mut [u8],
        position: Position,
        direction: Direction,
    ) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        position.validate(data.len())?;
        trace!(
            sector = u128::from(position.sector),
            sector_size = position.sector_size,
            skipped_bytes = position.skipped_bytes,
            len = data.len(),
            backend = backend.name(),
            ?direction,
            "xtsn"
        );
        match backend {
            Backend::Portable => run(&mut Portable, &self.keys, data, position, direction),
            Backend::OpenSsl(lib) => {
                let mut session = lib.session()?;
                run(&mut session, &self.keys, data, position, direction)
            }
        }
    }
}
