//! Accelerated AES-128 through a libcrypto found at runtime.
//!
//! Nothing here links against OpenSSL. Candidates are opened with
//! `dlopen`, first next to the binary this crate lives in, then via
//! the default linker search path. A candidate is used only if every
//! EVP symbol resolves and `OpenSSL_version_num` reports at least 1.1.
//!
//! Each block goes through a fresh `EVP_CipherInit_ex` in single-block
//! ECB mode with padding disabled. The `EVP_CIPHER_CTX` lives in a
//! [`Session`] that is created and freed inside one sector engine call.

use std::ffi::{c_void, CString};
use std::os::raw::{c_int, c_uchar, c_ulong};
use std::path::{Path, PathBuf};
use std::ptr::{self, NonNull};

use thiserror::Error;
use tracing::{debug, warn};

use super::BlockCipher;
use crate::crypto::{Block, Result, RoundKeys, XtsnError, AES_BLOCK_SIZE};

/// `OpenSSL_version_num` of 1.1.0, any patch or status.
pub const MIN_VERSION: c_ulong = 0x1010_0000;

#[cfg(target_os = "macos")]
pub const CANDIDATES: &[&str] = &[
    "libcrypto.3.dylib",
    "libcrypto.1.1.dylib",
    "libcrypto.dylib",
];
#[cfg(all(unix, not(target_os = "macos")))]
pub const CANDIDATES: &[&str] = &[
    "libcrypto.so",
    "libcrypto.so.3",
    "libcrypto.so.1.1",
    "libcrypto.so.111",
];
#[cfg(not(unix))]
pub const CANDIDATES: &[&str] = &[];

type CtxNew = unsafe extern "C" fn() -> *mut c_void;
type CipherAes128Ecb = unsafe extern "C" fn() -> *const c_void;
type CipherInitEx = unsafe extern "C" fn(
    *mut c_void,
    *const c_void,
    *mut c_void,
    *const c_uchar,
    *const c_uchar,
    c_int,
) -> c_int;
type CtxKeyLength = unsafe extern "C" fn(*const c_void) -> c_int;
type CtxSetPadding = unsafe extern "C" fn(*mut c_void, c_int) -> c_int;
type CipherUpdate =
    unsafe extern "C" fn(*mut c_void, *mut c_uchar, *mut c_int, *const c_uchar, c_int) -> c_int;
type CipherFinalEx = unsafe extern "C" fn(*mut c_void, *mut c_uchar, *mut c_int) -> c_int;
type CtxFree = unsafe extern "C" fn(*mut c_void);
type VersionNum = unsafe extern "C" fn() -> c_ulong;

/// Why a candidate library was passed over.
#[derive(Error, Debug)]
pub enum Rejection {
    #[error("could not be opened")]
    NotFound,
    #[error("is missing symbol {0}")]
    MissingSymbol(&'static str),
    #[error("reports version {0:#x}, below the 1.1 minimum")]
    TooOld(c_ulong),
}

#[cfg(unix)]
mod sys {
    use std::ffi::{c_void, CStr, CString, OsStr};
    use std::mem::MaybeUninit;
    use std::os::unix::ffi::OsStrExt;
    use std::path::{Path, PathBuf};

    pub fn c_path(path: &Path) -> Option<CString> {
        CString::new(path.as_os_str().as_bytes()).ok()
    }

    pub fn open(path: &CString) -> *mut c_void {
        unsafe { libc::dlopen(path.as_ptr(), libc::RTLD_NOW) }
    }

    pub fn symbol(handle: *mut c_void, name: &CString) -> *mut c_void {
        unsafe { libc::dlsym(handle, name.as_ptr()) }
    }

    pub fn close(handle: *mut c_void) {
        unsafe {
            libc::dlclose(handle);
        }
    }

    /// Directory of the object file containing this function.
    pub fn module_dir() -> Option<PathBuf> {
        let mut info = MaybeUninit::<libc::Dl_info>::uninit();
        let addr = module_dir as fn() -> Option<PathBuf> as *const c_void;
        if unsafe { libc::dladdr(addr, info.as_mut_ptr()) } == 0 {
            return None;
        }
        let info = unsafe { info.assume_init() };
        if info.dli_fname.is_null() {
            return None;
        }
        let fname = unsafe { CStr::from_ptr(info.dli_fname) };
        let path = Path::new(OsStr::from_bytes(fname.to_bytes()))
            .canonicalize()
            .ok()?;
        path.parent().map(Path::to_path_buf)
    }
}

#[cfg(not(unix))]
mod sys {
    use std::ffi::{c_void, CString};
    use std::path::{Path, PathBuf};

    pub fn c_path(path: &Path) -> Option<CString> {
        path.to_str().and_then(|path| CString::new(path).ok())
    }

    pub fn open(_path: &CString) -> *mut c_void {
        std::ptr::null_mut()
    }

    pub fn symbol(_handle: *mut c_void, _name: &CString) -> *mut c_void {
        std::ptr::null_mut()
    }

    pub fn close(_handle: *mut c_void) {}

    pub fn module_dir() -> Option<PathBuf> {
        None
    }
}

/// An open shared object, closed on drop.
#[derive(Debug)]
struct Library {
    handle: NonNull<c_void>,
}

// dlopen handles are process-global and usable from any thread.
unsafe impl Send for Library {}
unsafe impl Sync for Library {}

impl Library {
    fn open(path: &Path) -> Option<Self> {
        let path = sys::c_path(path)?;
        NonNull::new(sys::open(&path)).map(|handle| Self { handle })
    }

    /// Looks up `name` and reinterprets it as the function pointer type `F`.
    fn symbol<F: Copy>(&self, name: &'static str) -> std::result::Result<F, Rejection> {
        // Only instantiated with the `extern "C" fn` aliases above.
        debug_assert_eq!(std::mem::size_of::<F>(), std::mem::size_of::<*mut c_void>());
        let cname = CString::new(name).map_err(|_| Rejection::MissingSymbol(name))?;
        let ptr = sys::symbol(self.handle.as_ptr(), &cname);
        if ptr.is_null() {
            return Err(Rejection::MissingSymbol(name));
        }
        Ok(unsafe { std::mem::transmute_copy::<*mut c_void, F>(&ptr) })
    }
}

impl Drop for Library {
    fn drop(&mut self) {
        sys::close(self.handle.as_ptr());
    }
}

/// The EVP entry points the block transform needs.
#[derive(Debug, Clone, Copy)]
struct Evp {
    ctx_new: CtxNew,
    aes_128_ecb: CipherAes128Ecb,
    cipher_init_ex: CipherInitEx,
    ctx_key_length: CtxKeyLength,
    ctx_set_padding: CtxSetPadding,
    cipher_update: CipherUpdate,
    cipher_final_ex: CipherFinalEx,
    ctx_free: CtxFree,
    version_num: VersionNum,
}

impl Evp {
    fn resolve(lib: &Library) -> std::result::Result<Self, Rejection> {
        // 3.x only exports the `get_` spelling; 1.1 only the old one.
        let ctx_key_length = lib
            .symbol("EVP_CIPHER_CTX_get_key_length")
            .or_else(|_| lib.symbol("EVP_CIPHER_CTX_key_length"))?;
        Ok(Self {
            ctx_new: lib.symbol("EVP_CIPHER_CTX_new")?,
            aes_128_ecb: lib.symbol("EVP_aes_128_ecb")?,
            cipher_init_ex: lib.symbol("EVP_CipherInit_ex")?,
            ctx_key_length,
            ctx_set_padding: lib.symbol("EVP_CIPHER_CTX_set_padding")?,
            cipher_update: lib.symbol("EVP_CipherUpdate")?,
            cipher_final_ex: lib.symbol("EVP_CipherFinal_ex")?,
            ctx_free: lib.symbol("EVP_CIPHER_CTX_free")?,
            version_num: lib.symbol("OpenSSL_version_num")?,
        })
    }
}

/// A validated libcrypto. Dropping the last reference unloads it.
#[derive(Debug)]
pub struct LibCrypto {
    path: PathBuf,
    version: c_ulong,
    evp: Evp,
    _lib: Library,
}

impl LibCrypto {
    /// Walks [`CANDIDATES`] next to this module, then on the default
    /// search path, and returns the first acceptable library.
    pub fn discover() -> Option<Self> {
        let module_dir = sys::module_dir();
        Self::search(module_dir.as_deref(), CANDIDATES)
    }

    pub(crate) fn search(dir: Option<&Path>, names: &[&str]) -> Option<Self> {
        let dirs = dir.into_iter().map(Some).chain(std::iter::once(None));
        for dir in dirs {
            for name in names {
                let path = match dir {
                    Some(dir) => dir.join(name),
                    None => PathBuf::from(name),
                };
                match Self::load(&path) {
                    Ok(lib) => return Some(lib),
                    Err(reason @ Rejection::TooOld(_)) => {
                        warn!(
                            "Found libcrypto at {}, but it {reason}. Not using it",
                            path.display()
                        )
                    }
                    Err(reason) => debug!("libcrypto candidate {} {reason}", path.display()),
                }
            }
        }
        None
    }

    /// Opens one candidate and checks it qualifies.
    pub fn load(path: impl AsRef<Path>) -> std::result::Result<Self, Rejection> {
        let path = path.as_ref();
        let lib = Library::open(path).ok_or(Rejection::NotFound)?;
        let evp = Evp::resolve(&lib)?;
        let version = unsafe { (evp.version_num)() };
        if version < MIN_VERSION {
            return Err(Rejection::TooOld(version));
        }
        Ok(Self {
            path: path.to_path_buf(),
            version,
            evp,
            _lib: lib,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn version(&self) -> c_ulong {
        self.version
    }

    /// Allocates the per-call cipher context.
    pub fn session(&self) -> Result<Session<'_>> {
        let ctx = unsafe { (self.evp.ctx_new)() };
        NonNull::new(ctx)
            .map(|ctx| Session {
                evp: &self.evp,
                ctx,
            })
            .ok_or(XtsnError::BackendFailure("EVP_CIPHER_CTX_new"))
    }
}

/// An `EVP_CIPHER_CTX` borrowed from a [`LibCrypto`] for the
/// duration of one sector engine call.
#[derive(Debug)]
pub struct Session<'lib> {
    evp: &'lib Evp,
    ctx: NonNull<c_void>,
}

impl Session<'_> {
    fn crypt(
        &mut self,
        key: &[u8; RoundKeys::KEY_LEN],
        block: &mut Block,
        encrypt: bool,
    ) -> Result<()> {
        let ctx = self.ctx.as_ptr();
        let mut out = [0u8; 2 * AES_BLOCK_SIZE];
        let mut written: c_int = 0;
        let mut finished: c_int = 0;
        unsafe {
            let cipher = (self.evp.aes_128_ecb)();
            if (self.evp.cipher_init_ex)(
                ctx,
                cipher,
                ptr::null_mut(),
                key.as_ptr(),
                ptr::null(),
                encrypt as c_int,
            ) != 1
            {
                return Err(XtsnError::BackendFailure("EVP_CipherInit_ex"));
            }
            if (self.evp.ctx_key_length)(ctx) != RoundKeys::KEY_LEN as c_int {
                return Err(XtsnError::BackendFailure("EVP_CIPHER_CTX_key_length"));
            }
            (self.evp.ctx_set_padding)(ctx, 0);
            if (self.evp.cipher_update)(
                ctx,
                out.as_mut_ptr(),
                &mut written,
                block.as_ptr(),
                AES_BLOCK_SIZE as c_int,
            ) != 1
            {
                return Err(XtsnError::BackendFailure("EVP_CipherUpdate"));
            }
            let tail = out
                .as_mut_ptr()
                .add(written.clamp(0, AES_BLOCK_SIZE as c_int) as usize);
            if (self.evp.cipher_final_ex)(ctx, tail, &mut finished) != 1 {
                return Err(XtsnError::BackendFailure("EVP_CipherFinal_ex"));
            }
        }
        if written + finished != AES_BLOCK_SIZE as c_int {
            return Err(XtsnError::BackendFailure("EVP_CipherFinal_ex"));
        }
        block.copy_from_slice(&out[..AES_BLOCK_SIZE]);
        Ok(())
    }
}

impl BlockCipher for Session<'_> {
    fn encrypt_block(&mut self, keys: &RoundKeys, block: &mut Block) -> Result<()> {
        self.crypt(keys.key(), block, true)
    }

    fn decrypt_block(&mut self, keys: &RoundKeys, block: &mut Block) -> Result<()> {
        self.crypt(keys.key(), block, false)
    }
}

impl Drop for Session<'_> {
    fn drop(&mut self) {
        unsafe { (self.evp.ctx_free)(self.ctx.as_ptr()) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::backend::Portable;
    use crate::crypto::RoundKeySet;

    #[test]
    fn test_missing_library_is_not_found() {
        let err = LibCrypto::load("libdefinitely-not-a-real-crypto.so.0").unwrap_err();
        assert!(matches!(err, Rejection::NotFound));
    }

    #[test]
    fn test_search_without_candidates_finds_nothing() {
        assert!(LibCrypto::search(Some(Path::new("/nonexistent")), &[]).is_none());
        assert!(LibCrypto::search(None, &["libdefinitely-not-a-real-crypto.so.0"]).is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_candidate_path_keeps_raw_bytes() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let dir = Path::new(OsStr::from_bytes(b"/opt/caf\xe9/lib"));
        let path = sys::c_path(&dir.join("libcrypto.so.3")).unwrap();
        assert_eq!(path.as_bytes(), b"/opt/caf\xe9/lib/libcrypto.so.3");
        let err = LibCrypto::load(dir.join("libdefinitely-not-a-real-crypto.so.0")).unwrap_err();
        assert!(matches!(err, Rejection::NotFound));
    }

    #[test]
    fn test_session_matches_portable_when_available() {
        let Some(lib) = LibCrypto::discover() else {
            return;
        };
        assert!(lib.version() >= MIN_VERSION);
        let keys = RoundKeySet::derive(&[0x3C; 16], &[0xC3; 16]).unwrap();
        let mut session = lib.session().unwrap();
        let mut accelerated = *b"sixteen byte blk";
        let mut portable = accelerated;
        session
            .encrypt_block(keys.data(), &mut accelerated)
            .unwrap();
        Portable.encrypt_block(keys.data(), &mut portable).unwrap();
        assert_eq!(accelerated, portable);
        session
            .decrypt_block(keys.data(), &mut accelerated)
            .unwrap();
        assert_eq!(&accelerated, b"sixteen byte blk");
    }
}
