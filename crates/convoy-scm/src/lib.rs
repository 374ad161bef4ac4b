#![deny(clippy::all)]

//! Package file hashing.
//!
//! Each package's hashable state is a map from package-anchored unix paths
//! to content hashes. When the repository is a git work tree and no `inputs`
//! filter is configured, hashes come from the version-control index
//! (tracked entries folded with working-tree changes). Otherwise files are
//! walked and hashed directly, with the same git blob function, so the two
//! modes agree on bytes.

mod git;
mod hash_object;
mod manual;
mod package_deps;

use std::{collections::HashMap, process::Command};

use convoypath::{AbsoluteSystemPath, AbsoluteSystemPathBuf, RelativeUnixPathBuf};
use thiserror::Error;

pub use crate::package_deps::FileHashOracle;

pub type GitHashes = HashMap<RelativeUnixPathBuf, String>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("git error: {0}")]
    Git(String),
    #[error("git binary not found: {0}")]
    GitBinaryNotFound(#[from] which::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("path error: {0}")]
    Path(#[from] convoypath::PathError),
    #[error("could not walk filesystem: {0}")]
    Walk(#[from] ignore::Error),
    #[error("invalid glob: {0}")]
    Glob(#[from] globset::Error),
    #[error("entry is neither a file nor a symlink: {0}")]
    UnsupportedFileType(String),
    #[error("git produced non-UTF-8 output")]
    Encoding,
}

impl Error {
    pub(crate) fn git_error(message: impl Into<String>) -> Self {
        Error::Git(message.into())
    }
}

/// The source-control backend for a repository, probed once per run.
#[derive(Debug, Clone)]
pub enum SCM {
    Git(git::Git),
    /// Fallback when no git work tree (or binary) is available.
    Manual,
}

impl SCM {
    /// Probes for a git work tree containing `path_in_repo`. Never fails:
    /// the manual fallback covers repositories without version control.
    pub fn new(path_in_repo: &AbsoluteSystemPath) -> SCM {
        match git::Git::find(path_in_repo) {
            Ok(git) => SCM::Git(git),
            Err(err) => {
                tracing::debug!("failed to find git, continuing with manual hashing: {err}");
                SCM::Manual
            }
        }
    }

    pub fn is_manual(&self) -> bool {
        matches!(self, SCM::Manual)
    }
}

pub(crate) fn run_git(
    git_binary: &std::path::Path,
    cwd: &AbsoluteSystemPath,
    args: &[&str],
) -> Result<Vec<u8>, Error> {
    let output = Command::new(git_binary)
        .args(args)
        .current_dir(cwd.as_std_path())
        .output()?;
    if !output.status.success() {
        return Err(Error::git_error(format!(
            "git {} exited with {}: {}",
            args.join(" "),
            output.status,
            String::from_utf8_lossy(&output.stderr)
        )));
    }
    Ok(output.stdout)
}

pub(crate) fn find_git_root(
    path_in_repo: &AbsoluteSystemPath,
) -> Result<AbsoluteSystemPathBuf, Error> {
    let git_binary = which::which("git")?;
    let output = run_git(&git_binary, path_in_repo, &["rev-parse", "--show-toplevel"])?;
    let root = String::from_utf8(output).map_err(|_| Error::Encoding)?;
    Ok(AbsoluteSystemPathBuf::new(root.trim_end()).map_err(Error::Path)?)
}
