pub mod crypto;
pub mod region;

pub use crypto::backend::{registry, Backend, BackendPreference};
pub use crypto::xtsn::{Position, SectorIndex, Xtsn, DEFAULT_SECTOR_SIZE};
pub use crypto::{Direction, RoundKeySet, XtsnError};
pub use region::EncryptedRegion;
