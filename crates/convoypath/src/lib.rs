#![deny(clippy::all)]

//! Typed paths for convoy.
//!
//! Three path families are distinguished at the type level and never
//! converted implicitly:
//!
//! - [`AbsoluteSystemPath`] / [`AbsoluteSystemPathBuf`]: absolute, OS-native
//!   separators. All filesystem mutation goes through these.
//! - [`AnchoredSystemPath`] / [`AnchoredSystemPathBuf`]: relative, OS-native
//!   separators. Only meaningful together with an absolute anchor.
//! - [`RelativeUnixPath`] / [`RelativeUnixPathBuf`]: relative, always
//!   `/`-separated. Every persisted or hashed path uses this family so the
//!   bytes are identical across operating systems.

mod absolute_system_path;
mod absolute_system_path_buf;
mod anchored_system_path;
mod anchored_system_path_buf;
mod relative_unix_path;
mod relative_unix_path_buf;

pub use absolute_system_path::AbsoluteSystemPath;
pub use absolute_system_path_buf::AbsoluteSystemPathBuf;
pub use anchored_system_path::AnchoredSystemPath;
pub use anchored_system_path_buf::AnchoredSystemPathBuf;
pub use relative_unix_path::RelativeUnixPath;
pub use relative_unix_path_buf::RelativeUnixPathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PathError {
    #[error("path is non-UTF-8: {0}")]
    InvalidUnicode(String),
    #[error("path is not absolute: {0}")]
    NotAbsolute(String),
    #[error("path is not relative: {0}")]
    NotRelative(String),
    #[error("path is malformed: {0}")]
    MalformedPath(String),
    #[error("path {0} is not anchored at {1}")]
    NotParent(String, String),
    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),
}

impl PathError {
    pub fn invalid_utf8_error(path: impl AsRef<std::path::Path>) -> Self {
        PathError::InvalidUnicode(path.as_ref().to_string_lossy().into_owned())
    }
}

/// Checks that a relative path never climbs above its anchor.
///
/// `..` components are tracked against the current depth so `a/../b` is fine
/// while `a/../../b` is rejected.
pub(crate) fn check_well_formed(path: &camino::Utf8Path) -> Result<(), PathError> {
    let mut depth = 0i32;
    for component in path.components() {
        match component {
            camino::Utf8Component::ParentDir => {
                depth -= 1;
                if depth < 0 {
                    return Err(PathError::MalformedPath(path.to_string()));
                }
            }
            camino::Utf8Component::CurDir => {}
            _ => depth += 1,
        }
    }
    Ok(())
}
