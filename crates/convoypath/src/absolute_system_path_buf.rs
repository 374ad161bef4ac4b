use std::{fmt, ops::Deref, path::PathBuf};

use camino::{Utf8Path, Utf8PathBuf};
use path_clean::PathClean;
use serde::Serialize;

use crate::{AbsoluteSystemPath, PathError};

/// An owned absolute path with OS-native separators.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct AbsoluteSystemPathBuf(Utf8PathBuf);

impl AbsoluteSystemPathBuf {
    /// Validates that the given value is an absolute path and normalizes
    /// away `.` and `..` segments.
    pub fn new(value: impl Into<Utf8PathBuf>) -> Result<Self, PathError> {
        let path: Utf8PathBuf = value.into();
        if path.is_relative() {
            return Err(PathError::NotAbsolute(path.into_string()));
        }
        Ok(Self::new_unchecked(path))
    }

    pub(crate) fn new_unchecked(path: Utf8PathBuf) -> Self {
        let cleaned = path.as_std_path().clean();
        let path = Utf8PathBuf::try_from(cleaned)
            .expect("cleaning a utf-8 path yields a utf-8 path");
        Self(path)
    }

    /// Interprets `value` against `base` when relative, keeps it when
    /// already absolute.
    pub fn from_unknown(base: &AbsoluteSystemPath, value: impl AsRef<Utf8Path>) -> Self {
        let value = value.as_ref();
        if value.is_absolute() {
            Self::new_unchecked(value.to_owned())
        } else {
            Self::new_unchecked(Utf8Path::new(base.as_str()).join(value))
        }
    }

    /// The current working directory.
    pub fn cwd() -> Result<Self, PathError> {
        let cwd = std::env::current_dir()?;
        Self::try_from(cwd)
    }

    pub fn as_absolute_path(&self) -> &AbsoluteSystemPath {
        AbsoluteSystemPath::new_unchecked(&self.0)
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    pub fn into_string(self) -> String {
        self.0.into_string()
    }
}

impl Deref for AbsoluteSystemPathBuf {
    type Target = AbsoluteSystemPath;

    fn deref(&self) -> &Self::Target {
        self.as_absolute_path()
    }
}

impl fmt::Display for AbsoluteSystemPathBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl AsRef<AbsoluteSystemPath> for AbsoluteSystemPathBuf {
    fn as_ref(&self) -> &AbsoluteSystemPath {
        self
    }
}

impl TryFrom<&str> for AbsoluteSystemPathBuf {
    type Error = PathError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<PathBuf> for AbsoluteSystemPathBuf {
    type Error = PathError;

    fn try_from(value: PathBuf) -> Result<Self, Self::Error> {
        let path =
            Utf8PathBuf::try_from(value).map_err(|err| PathError::invalid_utf8_error(err.as_path()))?;
        Self::new(path)
    }
}

impl TryFrom<&std::path::Path> for AbsoluteSystemPathBuf {
    type Error = PathError;

    fn try_from(value: &std::path::Path) -> Result<Self, Self::Error> {
        Self::try_from(value.to_path_buf())
    }
}
