use std::fmt;

use camino::Utf8Path;
use path_slash::PathExt;

use crate::{AnchoredSystemPathBuf, PathError, RelativeUnixPathBuf};

/// A borrowed relative path with OS-native separators. Only gains meaning
/// when resolved against an absolute anchor.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct AnchoredSystemPath(Utf8Path);

impl AnchoredSystemPath {
    pub fn new<P: AsRef<str> + ?Sized>(value: &P) -> Result<&Self, PathError> {
        let path = Utf8Path::new(value.as_ref());
        if path.is_absolute() {
            return Err(PathError::NotRelative(path.to_string()));
        }
        Ok(Self::new_unchecked(path))
    }

    pub(crate) fn new_unchecked(path: &Utf8Path) -> &Self {
        // SAFETY: repr(transparent) over Utf8Path
        unsafe { &*(path as *const Utf8Path as *const Self) }
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    pub fn as_std_path(&self) -> &std::path::Path {
        self.0.as_std_path()
    }

    pub fn parent(&self) -> Option<&AnchoredSystemPath> {
        self.0.parent().map(Self::new_unchecked)
    }

    pub fn components(&self) -> impl Iterator<Item = camino::Utf8Component> {
        self.0.components()
    }

    pub fn to_owned(&self) -> AnchoredSystemPathBuf {
        AnchoredSystemPathBuf::new_unchecked(self.0.to_owned())
    }

    /// Converts to forward slashes for hashing and archival.
    pub fn to_unix(&self) -> RelativeUnixPathBuf {
        let unix = self
            .0
            .as_std_path()
            .to_slash()
            .expect("utf-8 path converts to unix losslessly");
        RelativeUnixPathBuf::new_unchecked(unix.into_owned())
    }

    pub fn join_component(&self, segment: &str) -> AnchoredSystemPathBuf {
        debug_assert!(!segment.contains(std::path::MAIN_SEPARATOR));
        AnchoredSystemPathBuf::new_unchecked(self.0.join(segment))
    }
}

impl fmt::Display for AnchoredSystemPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl AsRef<AnchoredSystemPath> for AnchoredSystemPath {
    fn as_ref(&self) -> &AnchoredSystemPath {
        self
    }
}

impl ToOwned for AnchoredSystemPath {
    type Owned = AnchoredSystemPathBuf;

    fn to_owned(&self) -> AnchoredSystemPathBuf {
        AnchoredSystemPath::to_owned(self)
    }
}

impl std::borrow::Borrow<AnchoredSystemPath> for AnchoredSystemPathBuf {
    fn borrow(&self) -> &AnchoredSystemPath {
        self
    }
}
