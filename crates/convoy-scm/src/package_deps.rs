use convoypath::{AbsoluteSystemPath, AnchoredSystemPath, AnchoredSystemPathBuf};
use tracing::debug;

use crate::{hash_object::hash_file, manual, Error, GitHashes, SCM};

/// An external provider of precomputed package file hashes, e.g. a daemon
/// that watches the filesystem. A `Some` answer is authoritative; `None`
/// means the caller computes the hashes itself.
pub trait FileHashOracle {
    fn file_hashes(
        &self,
        package_path: &AnchoredSystemPath,
        inputs_fingerprint: &str,
    ) -> Option<GitHashes>;
}

impl SCM {
    /// The full hashable state of one package: a complete map of
    /// package-anchored unix paths to content hashes, or an error. Never a
    /// partial result.
    ///
    /// With a git work tree and no `inputs` filter the index supplies the
    /// hashes; otherwise the package directory is walked directly.
    pub fn get_package_file_hashes(
        &self,
        repo_root: &AbsoluteSystemPath,
        package_path: &AnchoredSystemPath,
        inputs: &[String],
    ) -> Result<GitHashes, Error> {
        match self {
            SCM::Git(git) if inputs.is_empty() => {
                git.get_package_file_hashes(repo_root, package_path)
            }
            SCM::Git(_) | SCM::Manual => {
                manual::get_package_file_hashes_without_git(repo_root, package_path, inputs)
            }
        }
    }

    /// Like [`Self::get_package_file_hashes`] but consults `oracle` first.
    pub fn get_package_file_hashes_with_oracle(
        &self,
        repo_root: &AbsoluteSystemPath,
        package_path: &AnchoredSystemPath,
        inputs: &[String],
        inputs_fingerprint: &str,
        oracle: Option<&dyn FileHashOracle>,
    ) -> Result<GitHashes, Error> {
        if let Some(oracle) = oracle {
            if let Some(hashes) = oracle.file_hashes(package_path, inputs_fingerprint) {
                debug!("file hashes for {package_path} supplied by oracle");
                return Ok(hashes);
            }
        }
        self.get_package_file_hashes(repo_root, package_path, inputs)
    }

    /// Hashes exactly the files matching the given globs, anchored at
    /// `base_path`. Unlike package hashing, nothing is implicitly added.
    pub fn get_file_hashes_matching_globs(
        &self,
        repo_root: &AbsoluteSystemPath,
        base_path: &AnchoredSystemPath,
        globs: &[String],
    ) -> Result<GitHashes, Error> {
        manual::hash_files_matching_globs(repo_root, base_path, globs)
    }

    /// Hashes an explicit list of files anchored at `anchor`. Files that do
    /// not exist are skipped rather than erroring; used for dotenv files
    /// which are frequently absent.
    pub fn hash_existing_of(
        &self,
        anchor: &AbsoluteSystemPath,
        files: impl Iterator<Item = AnchoredSystemPathBuf>,
    ) -> Result<GitHashes, Error> {
        let mut hashes = GitHashes::new();
        for file in files {
            let path = anchor.resolve(&file);
            match path.symlink_metadata() {
                Ok(_) => {
                    hashes.insert(file.to_unix(), hash_file(&path)?);
                }
                Err(_) => continue,
            }
        }
        Ok(hashes)
    }
}
