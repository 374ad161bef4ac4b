use std::{
    fmt,
    fs::{self, File, Metadata, OpenOptions},
    io::Write,
    path::Path,
};

use camino::{Utf8Component, Utf8Path};

use crate::{AbsoluteSystemPathBuf, AnchoredSystemPath, AnchoredSystemPathBuf, PathError};

/// A borrowed absolute path with OS-native separators. Filesystem operations
/// that mutate state are only exposed on this type.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct AbsoluteSystemPath(Utf8Path);

impl AbsoluteSystemPath {
    /// Validates that the given string is an absolute path.
    ///
    /// Does not canonicalize or touch the filesystem.
    pub fn new<P: AsRef<str> + ?Sized>(value: &P) -> Result<&Self, PathError> {
        let path = Utf8Path::new(value.as_ref());
        if path.is_relative() {
            return Err(PathError::NotAbsolute(path.to_string()));
        }
        Ok(Self::new_unchecked(path))
    }

    pub fn from_std_path(path: &Path) -> Result<&Self, PathError> {
        let path: &Utf8Path = path
            .try_into()
            .map_err(|_| PathError::invalid_utf8_error(path))?;
        if path.is_relative() {
            return Err(PathError::NotAbsolute(path.to_string()));
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

    pub fn as_std_path(&self) -> &Path {
        self.0.as_std_path()
    }

    pub fn to_owned(&self) -> AbsoluteSystemPathBuf {
        AbsoluteSystemPathBuf::new_unchecked(self.0.to_owned())
    }

    pub fn parent(&self) -> Option<&AbsoluteSystemPath> {
        self.0.parent().map(Self::new_unchecked)
    }

    pub fn file_name(&self) -> Option<&str> {
        self.0.file_name()
    }

    pub fn extension(&self) -> Option<&str> {
        self.0.extension()
    }

    pub fn components(&self) -> impl Iterator<Item = Utf8Component> {
        self.0.components()
    }

    /// Appends a single path component. The component must not contain a
    /// separator; use [`Self::join_components`] for multiple segments.
    pub fn join_component(&self, segment: &str) -> AbsoluteSystemPathBuf {
        debug_assert!(!segment.contains(std::path::MAIN_SEPARATOR));
        AbsoluteSystemPathBuf::new_unchecked(self.0.join(segment))
    }

    pub fn join_components(&self, segments: &[&str]) -> AbsoluteSystemPathBuf {
        let mut path = self.0.to_path_buf();
        for segment in segments {
            debug_assert!(!segment.contains(std::path::MAIN_SEPARATOR));
            path.push(segment);
        }
        AbsoluteSystemPathBuf::new_unchecked(path)
    }

    /// Resolves an anchored path against this path as the anchor.
    pub fn resolve(&self, path: &AnchoredSystemPath) -> AbsoluteSystemPathBuf {
        AbsoluteSystemPathBuf::new_unchecked(self.0.join(path.as_str()))
    }

    /// Produces the anchored path of `path` relative to `self`.
    pub fn anchor(&self, path: &AbsoluteSystemPath) -> Result<AnchoredSystemPathBuf, PathError> {
        AnchoredSystemPathBuf::new(self, path)
    }

    pub fn ancestors(&self) -> impl Iterator<Item = &AbsoluteSystemPath> {
        self.0.ancestors().map(Self::new_unchecked)
    }

    // Filesystem operations

    pub fn exists(&self) -> bool {
        self.0.exists()
    }

    pub fn try_exists(&self) -> Result<bool, PathError> {
        // camino's try_exists would be nicer, but this fs call keeps the
        // symlink behavior identical to `exists`
        Ok(fs::metadata(&self.0).is_ok())
    }

    pub fn is_dir(&self) -> bool {
        self.0.is_dir()
    }

    pub fn metadata(&self) -> Result<Metadata, PathError> {
        Ok(fs::metadata(&self.0)?)
    }

    pub fn symlink_metadata(&self) -> Result<Metadata, PathError> {
        Ok(fs::symlink_metadata(&self.0)?)
    }

    pub fn open(&self) -> Result<File, PathError> {
        Ok(File::open(&self.0)?)
    }

    pub fn open_with_options(&self, options: OpenOptions) -> Result<File, PathError> {
        Ok(options.open(&self.0)?)
    }

    pub fn read_to_string(&self) -> Result<String, PathError> {
        Ok(fs::read_to_string(&self.0)?)
    }

    pub fn read(&self) -> Result<Vec<u8>, PathError> {
        Ok(fs::read(&self.0)?)
    }

    pub fn read_dir(&self) -> Result<fs::ReadDir, PathError> {
        Ok(fs::read_dir(&self.0)?)
    }

    pub fn read_link(&self) -> Result<camino::Utf8PathBuf, PathError> {
        let target = fs::read_link(&self.0)?;
        camino::Utf8PathBuf::try_from(target).map_err(|err| {
            PathError::invalid_utf8_error(err.into_path_buf())
        })
    }

    pub fn create_dir_all(&self) -> Result<(), PathError> {
        Ok(fs::create_dir_all(&self.0)?)
    }

    /// Creates the parent directories of this path.
    pub fn ensure_dir(&self) -> Result<(), PathError> {
        if let Some(parent) = self.parent() {
            parent.create_dir_all()?;
        }
        Ok(())
    }

    pub fn create_with_contents(&self, contents: impl AsRef<[u8]>) -> Result<(), PathError> {
        let mut f = File::create(&self.0)?;
        f.write_all(contents.as_ref())?;
        Ok(())
    }

    pub fn remove_file(&self) -> Result<(), PathError> {
        Ok(fs::remove_file(&self.0)?)
    }

    pub fn remove_dir_all(&self) -> Result<(), PathError> {
        Ok(fs::remove_dir_all(&self.0)?)
    }

    pub fn rename(&self, to: &AbsoluteSystemPath) -> Result<(), PathError> {
        Ok(fs::rename(&self.0, &to.0)?)
    }

    pub fn symlink_to_file<P: AsRef<str>>(&self, target: P) -> Result<(), PathError> {
        let target = Path::new(target.as_ref());
        #[cfg(unix)]
        std::os::unix::fs::symlink(target, &self.0)?;
        #[cfg(windows)]
        std::os::windows::fs::symlink_file(target, &self.0)?;
        Ok(())
    }

    pub fn symlink_to_dir<P: AsRef<str>>(&self, target: P) -> Result<(), PathError> {
        let target = Path::new(target.as_ref());
        #[cfg(unix)]
        std::os::unix::fs::symlink(target, &self.0)?;
        #[cfg(windows)]
        std::os::windows::fs::symlink_dir(target, &self.0)?;
        Ok(())
    }

    #[cfg(unix)]
    pub fn set_mode(&self, mode: u32) -> Result<(), PathError> {
        use std::os::unix::fs::PermissionsExt;
        let permissions = fs::Permissions::from_mode(mode);
        fs::set_permissions(&self.0, permissions)?;
        Ok(())
    }

    #[cfg(not(unix))]
    pub fn set_mode(&self, _mode: u32) -> Result<(), PathError> {
        Ok(())
    }
}

impl fmt::Display for AbsoluteSystemPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl AsRef<AbsoluteSystemPath> for AbsoluteSystemPath {
    fn as_ref(&self) -> &AbsoluteSystemPath {
        self
    }
}

impl AsRef<Path> for AbsoluteSystemPath {
    fn as_ref(&self) -> &Path {
        self.0.as_std_path()
    }
}

impl ToOwned for AbsoluteSystemPath {
    type Owned = AbsoluteSystemPathBuf;

    fn to_owned(&self) -> AbsoluteSystemPathBuf {
        AbsoluteSystemPath::to_owned(self)
    }
}

impl std::borrow::Borrow<AbsoluteSystemPath> for AbsoluteSystemPathBuf {
    fn borrow(&self) -> &AbsoluteSystemPath {
        self
    }
}
