use std::{fmt, ops::Deref, path::Path};

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::{check_well_formed, AbsoluteSystemPath, AnchoredSystemPath, PathError};

/// An owned relative path with OS-native separators.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AnchoredSystemPathBuf(Utf8PathBuf);

impl AnchoredSystemPathBuf {
    /// Anchors `path` at `root`, failing when `path` is not under `root`.
    pub fn new(
        root: &AbsoluteSystemPath,
        path: &AbsoluteSystemPath,
    ) -> Result<Self, PathError> {
        let not_parent = || {
            PathError::NotParent(root.as_str().to_string(), path.as_str().to_string())
        };
        let stripped = path
            .as_str()
            .strip_prefix(root.as_str())
            .ok_or_else(not_parent)?;
        // A prefix match alone is not containment: /repo is not a parent
        // of /repository
        if !stripped.is_empty() && !stripped.starts_with(std::path::MAIN_SEPARATOR) {
            return Err(not_parent());
        }
        Ok(Self(Utf8PathBuf::from(
            stripped.trim_start_matches(std::path::MAIN_SEPARATOR),
        )))
    }

    /// Validates a raw relative path string.
    pub fn from_raw(value: impl Into<Utf8PathBuf>) -> Result<Self, PathError> {
        let path: Utf8PathBuf = value.into();
        if path.is_absolute() {
            return Err(PathError::NotRelative(path.into_string()));
        }
        check_well_formed(&path)?;
        Ok(Self(path))
    }

    /// Validates a relative system path, e.g. one pulled out of an archive
    /// header.
    pub fn from_system_path(path: &Path) -> Result<Self, PathError> {
        let path = Utf8PathBuf::try_from(path.to_path_buf())
            .map_err(|err| PathError::invalid_utf8_error(err.as_path()))?;
        if path.is_absolute() {
            return Err(PathError::NotRelative(path.into_string()));
        }
        check_well_formed(&path)?;
        // Strip any trailing separator that tar directory entries carry
        let trimmed = path
            .as_str()
            .trim_end_matches(std::path::MAIN_SEPARATOR)
            .trim_end_matches('/');
        Ok(Self(Utf8PathBuf::from(trimmed)))
    }

    pub(crate) fn new_unchecked(path: Utf8PathBuf) -> Self {
        Self(path)
    }

    pub fn as_anchored_path(&self) -> &AnchoredSystemPath {
        AnchoredSystemPath::new_unchecked(&self.0)
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    pub fn as_path(&self) -> &Path {
        self.0.as_std_path()
    }

    pub fn into_string(self) -> String {
        self.0.into_string()
    }
}

impl Deref for AnchoredSystemPathBuf {
    type Target = AnchoredSystemPath;

    fn deref(&self) -> &Self::Target {
        self.as_anchored_path()
    }
}

impl fmt::Display for AnchoredSystemPathBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl AsRef<AnchoredSystemPath> for AnchoredSystemPathBuf {
    fn as_ref(&self) -> &AnchoredSystemPath {
        self
    }
}

impl TryFrom<&Path> for AnchoredSystemPathBuf {
    type Error = PathError;

    fn try_from(value: &Path) -> Result<Self, Self::Error> {
        Self::from_system_path(value)
    }
}
