//! Per-connection native controller loading.
//!
//! Dynamic loaders hand back the same handle for equivalent inodes, which
//! would share a controller's mutable statics across sessions. Each
//! connection therefore copies the library to a unique path before loading,
//! so every session gets its own instance.

use std::ffi::c_char;
use std::fs;
use std::path::{Path, PathBuf};

use discon_proto::Frame;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tracing::warn;

/// The Bladed-style controller entry point.
pub type DisconFn =
    unsafe extern "C" fn(*mut f32, *mut i32, *mut c_char, *mut c_char, *mut c_char);

#[derive(Debug, thiserror::Error)]
pub enum LoaderError {
    #[error("error loading shared library: {0}")]
    Load(#[source] libloading::Error),
    #[error("error loading function from shared library: {0}")]
    Symbol(#[source] libloading::Error),
    #[error("error duplicating library: {0}")]
    Duplicate(#[source] std::io::Error),
}

impl LoaderError {
    /// Stable status code surfaced in the failed HTTP upgrade: 1 = library,
    /// 2 = symbol, 3 = context setup.
    pub fn code(&self) -> i32 {
        match self {
            LoaderError::Load(_) => 1,
            LoaderError::Symbol(_) => 2,
            LoaderError::Duplicate(_) => 3,
        }
    }
}

/// One loaded controller instance, bound to a duplicated library file.
pub struct ControllerLibrary {
    // Held only to keep the library mapped for the lifetime of `entry`.
    _library: libloading::Library,
    entry: DisconFn,
    duplicate_path: PathBuf,
}

impl ControllerLibrary {
    /// Copies `library_path` to a connection-unique file in the working
    /// directory, loads it, and resolves `symbol`.
    pub fn load(library_path: &Path, symbol: &str, conn_id: u64) -> Result<Self, LoaderError> {
        let duplicate_path = duplicate_library(Path::new("."), library_path, conn_id)
            .map_err(LoaderError::Duplicate)?;
        let library = match unsafe { libloading::Library::new(&duplicate_path) } {
            Ok(lib) => lib,
            Err(err) => {
                let _ = fs::remove_file(&duplicate_path);
                return Err(LoaderError::Load(err));
            }
        };
        let entry = match unsafe { library.get::<DisconFn>(symbol.as_bytes()) } {
            Ok(sym) => *sym,
            Err(err) => {
                drop(library);
                let _ = fs::remove_file(&duplicate_path);
                return Err(LoaderError::Symbol(err));
            }
        };
        Ok(Self {
            _library: library,
            entry,
            duplicate_path,
        })
    }

    /// Invokes the controller with in-place pointers into the frame's
    /// buffers; the native code mutates them for the duration of the call.
    pub fn call(&self, frame: &mut Frame) {
        unsafe {
            (self.entry)(
                frame.swap.as_mut_ptr(),
                &mut frame.fail,
                frame.in_file.as_mut_ptr() as *mut c_char,
                frame.out_name.as_mut_ptr() as *mut c_char,
                frame.msg.as_mut_ptr() as *mut c_char,
            );
        }
    }

    /// Unmaps the library and deletes the duplicated file.
    pub fn unload(self) {
        let ControllerLibrary {
            _library: library,
            duplicate_path,
            ..
        } = self;
        drop(library);
        if let Err(err) = fs::remove_file(&duplicate_path) {
            warn!(path = %duplicate_path.display(), %err, "failed to remove duplicated library");
        }
    }
}

/// Copies the library to `<basename>-<conn-id>-<random>` under `dir` and
/// returns the new path.
fn duplicate_library(dir: &Path, path: &Path, conn_id: u64) -> std::io::Result<PathBuf> {
    let base = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "library".to_string());
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(char::from)
        .collect();
    let duplicate = dir.join(format!("{base}-{conn_id:03}-{suffix}"));
    fs::copy(path, &duplicate)?;
    Ok(duplicate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn duplicate_creates_unique_copies() {
        let dir = tempfile::tempdir().expect("tempdir");
        let original = dir.path().join("controller.so");
        fs::write(&original, b"not really a library").expect("write");

        let a = duplicate_library(dir.path(), &original, 1).expect("dup a");
        let b = duplicate_library(dir.path(), &original, 1).expect("dup b");

        assert_ne!(a, b);
        let name = a.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("controller.so-001-"), "{name}");
        assert_eq!(fs::read(&a).expect("read"), b"not really a library");
    }

    #[test]
    fn loader_error_codes_are_stable() {
        let err = LoaderError::Duplicate(std::io::Error::other("boom"));
        assert_eq!(err.code(), 3);
        assert!(err.to_string().starts_with("error duplicating library"));
    }
}
