use std::{fmt, ops::Deref};

use camino::Utf8PathBuf;
use path_slash::PathBufExt;
use serde::{Deserialize, Serialize};

use crate::{AnchoredSystemPathBuf, PathError, RelativeUnixPath};

/// An owned relative `/`-separated path.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RelativeUnixPathBuf(String);

impl RelativeUnixPathBuf {
    pub fn new(value: impl Into<String>) -> Result<Self, PathError> {
        let path = value.into();
        if path.starts_with('/') {
            return Err(PathError::NotRelative(path));
        }
        Ok(Self(path))
    }

    pub(crate) fn new_unchecked(path: String) -> Self {
        Self(path)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    /// Converts back into an OS-native anchored path.
    pub fn to_system_path_buf(&self) -> AnchoredSystemPathBuf {
        let system = std::path::PathBuf::from_slash(&self.0);
        let system = Utf8PathBuf::try_from(system)
            .expect("unix path was valid utf-8, system form remains utf-8");
        AnchoredSystemPathBuf::new_unchecked(system)
    }

    /// Normalizes the path for use as an archive entry name. Directory
    /// entries carry a trailing slash; the operation is idempotent.
    pub fn make_canonical_for_tar(&mut self, is_dir: bool) {
        if is_dir && !self.0.ends_with('/') {
            self.0.push('/');
        }
    }

    pub fn join(&self, tail: &RelativeUnixPath) -> RelativeUnixPathBuf {
        if self.0.is_empty() {
            return tail.to_owned();
        }
        Self(format!("{}/{}", self.0, tail.as_str()))
    }

    pub fn strip_prefix(&self, prefix: &RelativeUnixPath) -> Option<RelativeUnixPathBuf> {
        if prefix.as_str().is_empty() {
            return Some(self.clone());
        }
        self.0
            .strip_prefix(prefix.as_str())
            .and_then(|rest| rest.strip_prefix('/').or(Some(rest).filter(|r| r.is_empty())))
            .map(|rest| Self(rest.to_string()))
    }
}

impl Deref for RelativeUnixPathBuf {
    type Target = RelativeUnixPath;

    fn deref(&self) -> &Self::Target {
        RelativeUnixPath::new_unchecked(&self.0)
    }
}

impl fmt::Display for RelativeUnixPathBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<RelativeUnixPath> for RelativeUnixPathBuf {
    fn as_ref(&self) -> &RelativeUnixPath {
        self
    }
}
