use std::path::PathBuf;
use std::sync::Arc;

use strata_base::ResourceId;

#[derive(Debug, Clone)]
pub enum CacheError {
    /// No manifest entry and no existing handle for the identity.
    UnresolvableIdentifier(ResourceId),
    /// A path was resolved but nothing exists there.
    MissingFile(PathBuf),
    /// The header or payload codec rejected the stored bytes.
    DecodeFailure(String),
    /// The resource is neither loaded nor in flight.
    NotLoaded(ResourceId),
    /// The save destination exists and overwrite was not requested.
    SaveConflict(PathBuf),
    IoError(Arc<std::io::Error>),
    BincodeError(Arc<bincode::Error>),
}

impl std::error::Error for CacheError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match *self {
            CacheError::UnresolvableIdentifier(_) => None,
            CacheError::MissingFile(_) => None,
            CacheError::DecodeFailure(_) => None,
            CacheError::NotLoaded(_) => None,
            CacheError::SaveConflict(_) => None,
            CacheError::IoError(ref e) => Some(&**e),
            CacheError::BincodeError(ref e) => Some(&**e),
        }
    }
}

impl core::fmt::Display for CacheError {
    fn fmt(
        &self,
        fmt: &mut core::fmt::Formatter,
    ) -> core::fmt::Result {
        match *self {
            CacheError::UnresolvableIdentifier(ref id) => {
                write!(fmt, "no manifest entry resolves {:?}", id)
            }
            CacheError::MissingFile(ref path) => {
                write!(fmt, "no file at {:?}", path)
            }
            CacheError::DecodeFailure(ref message) => {
                write!(fmt, "decode failed: {}", message)
            }
            CacheError::NotLoaded(ref id) => {
                write!(fmt, "{:?} is not loaded", id)
            }
            CacheError::SaveConflict(ref path) => {
                write!(fmt, "{:?} already exists and overwrite was not requested", path)
            }
            CacheError::IoError(ref e) => e.fmt(fmt),
            CacheError::BincodeError(ref e) => e.fmt(fmt),
        }
    }
}

impl From<std::io::Error> for CacheError {
    fn from(error: std::io::Error) -> Self {
        CacheError::IoError(Arc::new(error))
    }
}

impl From<bincode::Error> for CacheError {
    fn from(error: bincode::Error) -> Self {
        CacheError::BincodeError(Arc::new(error))
    }
}

pub type CacheResult<T> = Result<T, CacheError>;
