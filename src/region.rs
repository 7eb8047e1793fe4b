//! Byte-addressed access to an XTSN-encrypted region of a device,
//! e.g. one partition of a NAND image.
//!
//! Offsets are relative to the start of the region, which is also
//! sector 0 of the cipher. Reads and writes of any alignment and
//! length are widened to whole 16-byte blocks internally.

use std::io::{self, Read, Seek, SeekFrom, Write};

use tracing::{debug, trace};

use crate::crypto::xtsn::{Position, SectorIndex, Xtsn};
use crate::crypto::{Result, XtsnError, AES_BLOCK_SIZE};

const BLOCK: u64 = AES_BLOCK_SIZE as u64;

#[derive(Debug)]
pub struct EncryptedRegion<D> {
    device: D,
    base: u64,
    len: u64,
    sector_size: u64,
    xtsn: Xtsn,
}

impl<D: Read + Write + Seek> EncryptedRegion<D> {
    /// `len` bytes of `device` starting at `base`. Both the length and the
    /// sector size must be multiples of 16.
    pub fn new(device: D, base: u64, len: u64, sector_size: u64, xtsn: Xtsn) -> Result<Self> {
        if sector_size == 0 || sector_size % BLOCK != 0 {
            return Err(XtsnError::InvalidSectorSize(sector_size));
        }
        if len % BLOCK != 0 {
            return Err(XtsnError::InvalidBufferLength(
                usize::try_from(len).unwrap_or(usize::MAX),
            ));
        }
        if base.checked_add(len).is_none() {
            return Err(past_address_space());
        }
        debug!(
            "Opening encrypted region at {base:#x}, {len:#x} bytes, sector size {sector_size:#x}"
        );
        Ok(Self {
            device,
            base,
            len,
            sector_size,
            xtsn,
        })
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn into_inner(self) -> D {
        self.device
    }

    fn seek_to(&mut self, aligned_offset: u64) -> Result<()> {
        let start = self
            .base
            .checked_add(aligned_offset)
            .ok_or_else(past_address_space)?;
        self.device.seek(SeekFrom::Start(start))?;
        Ok(())
    }

    fn position(&self, aligned_offset: u64) -> Position {
        Position::new(SectorIndex::default())
            .with_sector_size(self.sector_size)
            .with_skipped_bytes(aligned_offset)
    }

    /// Reads up to `size` plaintext bytes at `offset`. Reading at or past
    /// the end yields an empty buffer.
    pub fn read_at(&mut self, offset: u64, size: usize) -> Result<Vec<u8>> {
        if offset >= self.len {
            return Ok(Vec::new());
        }
        let size = (size as u64).min(self.len - offset);
        if size == 0 {
            return Ok(Vec::new());
        }
        let before = offset % BLOCK;
        let after = (BLOCK - (offset + size) % BLOCK) % BLOCK;
        let aligned = offset - before;
        let span = usize::try_from(before + size + after)
            .map_err(|_| XtsnError::InvalidBufferLength(usize::MAX))?;
        trace!(offset, size, aligned, span, "region read");

        let mut buf = Vec::new();
        buf.try_reserve_exact(span)?;
        buf.resize(span, 0);
        self.seek_to(aligned)?;
        self.device.read_exact(&mut buf)?;
        self.xtsn
            .decrypt_in_place(&mut buf, self.position(aligned))?;

        let before = before as usize;
        buf.truncate(before + size as usize);
        buf.drain(..before);
        Ok(buf)
    }

    /// Writes `data` at `offset`, preserving the neighbouring bytes of
    /// partially covered blocks. Anything beyond the end of the region is
    /// dropped; the return value is always `data.len()`.
    pub fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<usize> {
        if offset >= self.len || data.is_empty() {
            return Ok(data.len());
        }
        let size = (data.len() as u64).min(self.len - offset);
        let end = offset + size;
        let before = offset % BLOCK;
        let after = (BLOCK - end % BLOCK) % BLOCK;
        let aligned = offset - before;
        trace!(offset, size, aligned, "region write");

        let capacity = usize::try_from(before + size + after)
            .map_err(|_| XtsnError::InvalidBufferLength(usize::MAX))?;
        let mut span = Vec::new();
        span.try_reserve_exact(capacity)?;
        if before != 0 {
            span.extend(self.read_at(aligned, before as usize)?);
        }
        span.extend_from_slice(&data[..size as usize]);
        if after != 0 {
            span.extend(self.read_at(end, after as usize)?);
        }
        self.xtsn
            .encrypt_in_place(&mut span, self.position(aligned))?;
        self.seek_to(aligned)?;
        self.device.write_all(&span)?;
        self.device.flush()?;
        Ok(data.len())
    }
}

fn past_address_space() -> XtsnError {
    XtsnError::Io(io::Error::new(
        io::ErrorKind::InvalidInput,
        "region extends past the end of the device address space",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::backend::Backend;
    use crate::crypto::Direction;
    use rand::RngCore;
    use serial_test::serial;
    use std::io::Cursor;

    const SECTOR: u64 = 0x40;
    const BASE: u64 = 0x30;

    fn random_bytes(len: usize) -> Vec<u8> {
        let mut buf = vec![0; len];
        rand::thread_rng().fill_bytes(&mut buf);
        buf
    }

    /// A device with `BASE` bytes of padding, then `plaintext` encrypted.
    fn device_with(xtsn: &Xtsn, plaintext: &[u8]) -> Cursor<Vec<u8>> {
        let mut ciphertext = plaintext.to_vec();
        xtsn.transform_with(
            &Backend::Portable,
            &mut ciphertext,
            Position::new(0u64).with_sector_size(SECTOR),
            Direction::Encrypt,
        )
        .unwrap();
        let mut raw = vec![0xAA; BASE as usize];
        raw.extend(ciphertext);
        raw.extend([0xBB; 16]);
        Cursor::new(raw)
    }

    fn xtsn() -> Xtsn {
        Xtsn::new(&[0x5E; 16], &[0xE5; 16]).unwrap()
    }

    #[test]
    fn test_new_validates_geometry() {
        let err =
            EncryptedRegion::new(Cursor::new(Vec::<u8>::new()), 0, 64, 0, xtsn()).unwrap_err();
        assert!(matches!(err, XtsnError::InvalidSectorSize(0)));
        let err =
            EncryptedRegion::new(Cursor::new(Vec::<u8>::new()), 0, 60, 0x200, xtsn()).unwrap_err();
        assert!(matches!(err, XtsnError::InvalidBufferLength(60)));
    }

    #[test]
    fn test_new_rejects_region_past_address_space() {
        let device = Cursor::new(Vec::<u8>::new());
        let err = EncryptedRegion::new(device, u64::MAX - 0x10, 0x40, SECTOR, xtsn()).unwrap_err();
        match err {
            XtsnError::Io(e) => assert_eq!(e.kind(), io::ErrorKind::InvalidInput),
            other => panic!("unexpected error {other:?}"),
        }
        let device = Cursor::new(Vec::<u8>::new());
        assert!(EncryptedRegion::new(device, u64::MAX - 0x40, 0x40, SECTOR, xtsn()).is_ok());
    }

    #[test]
    #[serial]
    fn test_unaligned_reads() {
        let plaintext = random_bytes(4 * SECTOR as usize);
        let device = device_with(&xtsn(), &plaintext);
        let mut region =
            EncryptedRegion::new(device, BASE, plaintext.len() as u64, SECTOR, xtsn()).unwrap();
        for (offset, size) in [(0, 256), (3, 10), (15, 2), (60, 70), (200, 100), (255, 1)] {
            let read = region.read_at(offset as u64, size).unwrap();
            let end = (offset + size).min(plaintext.len());
            assert_eq!(read, &plaintext[offset..end], "offset {offset} size {size}");
        }
        assert!(region.read_at(256, 16).unwrap().is_empty());
        assert!(region.read_at(10, 0).unwrap().is_empty());
    }

    #[test]
    #[serial]
    fn test_unaligned_write_preserves_neighbours() {
        let mut plaintext = random_bytes(4 * SECTOR as usize);
        let device = device_with(&xtsn(), &plaintext);
        let mut region =
            EncryptedRegion::new(device, BASE, plaintext.len() as u64, SECTOR, xtsn()).unwrap();

        let patch = random_bytes(37);
        assert_eq!(region.write_at(50, &patch).unwrap(), 37);
        plaintext[50..87].copy_from_slice(&patch);
        assert_eq!(region.read_at(0, 256).unwrap(), plaintext);

        let raw = region.into_inner().into_inner();
        assert_eq!(raw[..BASE as usize], [0xAA; BASE as usize]);
        assert_eq!(raw[raw.len() - 16..], [0xBB; 16]);
        assert_eq!(device_with(&xtsn(), &plaintext).into_inner(), raw);
    }

    #[test]
    #[serial]
    fn test_write_is_clamped_to_region() {
        let plaintext = random_bytes(2 * SECTOR as usize);
        let device = device_with(&xtsn(), &plaintext);
        let mut region =
            EncryptedRegion::new(device, BASE, plaintext.len() as u64, SECTOR, xtsn()).unwrap();

        assert_eq!(region.write_at(500, &[1, 2, 3]).unwrap(), 3);
        assert_eq!(region.write_at(120, &[0x77; 20]).unwrap(), 20);
        let tail = region.read_at(112, 64).unwrap();
        assert_eq!(tail.len(), 16);
        assert_eq!(tail[..8], plaintext[112..120]);
        assert_eq!(tail[8..], [0x77; 8]);

        let raw = region.into_inner().into_inner();
        assert_eq!(raw.len(), BASE as usize + plaintext.len() + 16);
        assert_eq!(raw[raw.len() - 16..], [0xBB; 16]);
    }
}
