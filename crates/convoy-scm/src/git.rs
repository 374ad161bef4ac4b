use std::path::PathBuf;

use convoypath::{AbsoluteSystemPath, AbsoluteSystemPathBuf, AnchoredSystemPath, RelativeUnixPathBuf};
use tracing::debug;

use crate::{find_git_root, hash_object::hash_file, run_git, Error, GitHashes};

/// A discovered git work tree plus the binary used to query it.
#[derive(Debug, Clone)]
pub struct Git {
    pub(crate) root: AbsoluteSystemPathBuf,
    bin: PathBuf,
}

impl Git {
    pub(crate) fn find(path_in_repo: &AbsoluteSystemPath) -> Result<Self, Error> {
        let root = find_git_root(path_in_repo)?;
        let bin = which::which("git")?;
        Ok(Self { root, bin })
    }

    /// Index-mode hashing: tracked entries from `HEAD` folded with
    /// working-tree changes. Only valid when no `inputs` filter applies.
    pub(crate) fn get_package_file_hashes(
        &self,
        repo_root: &AbsoluteSystemPath,
        package_path: &AnchoredSystemPath,
    ) -> Result<GitHashes, Error> {
        let package_dir = repo_root.resolve(package_path);
        let mut hashes = self.ls_tree(&package_dir)?;
        // Fold in working tree state: modified and untracked entries get
        // re-hashed, deletions drop out.
        let (to_hash, deleted) = self.status(&package_dir)?;
        for path in deleted {
            hashes.remove(&path);
        }
        for path in to_hash {
            let file_path = package_dir.resolve(&path.to_system_path_buf());
            match hash_file(&file_path) {
                Ok(hash) => {
                    hashes.insert(path, hash);
                }
                Err(Error::Path(_)) | Err(Error::Io(_)) if !file_path.exists() => {
                    // Raced with a deletion between status and hashing
                    hashes.remove(&path);
                }
                Err(err) => return Err(err),
            }
        }
        Ok(hashes)
    }

    /// Tracked files under `cwd` at `HEAD`, keyed relative to `cwd`.
    fn ls_tree(&self, cwd: &AbsoluteSystemPath) -> Result<GitHashes, Error> {
        let output = run_git(&self.bin, cwd, &["ls-tree", "-r", "-z", "HEAD"])?;
        Self::parse_ls_tree(&output)
    }

    fn parse_ls_tree(output: &[u8]) -> Result<GitHashes, Error> {
        let mut hashes = GitHashes::new();
        // Each entry: "<mode> <type> <oid>\t<path>" NUL-terminated
        for entry in output.split(|b| *b == b'\0') {
            if entry.is_empty() {
                continue;
            }
            let entry = std::str::from_utf8(entry).map_err(|_| Error::Encoding)?;
            let (meta, path) = entry
                .split_once('\t')
                .ok_or_else(|| Error::git_error(format!("malformed ls-tree entry: {entry}")))?;
            let mut fields = meta.split_ascii_whitespace();
            let _mode = fields
                .next()
                .ok_or_else(|| Error::git_error("ls-tree entry missing mode"))?;
            let object_type = fields
                .next()
                .ok_or_else(|| Error::git_error("ls-tree entry missing type"))?;
            let oid = fields
                .next()
                .ok_or_else(|| Error::git_error("ls-tree entry missing oid"))?;
            // Submodules surface as commit objects; skip them, their
            // contents are not part of this package's state.
            if object_type != "blob" {
                continue;
            }
            hashes.insert(RelativeUnixPathBuf::new(path.to_string())?, oid.to_string());
        }
        Ok(hashes)
    }

    /// Working-tree changes under `cwd`: paths needing a re-hash and paths
    /// deleted since `HEAD`, both relative to `cwd`.
    fn status(
        &self,
        cwd: &AbsoluteSystemPath,
    ) -> Result<(Vec<RelativeUnixPathBuf>, Vec<RelativeUnixPathBuf>), Error> {
        let output = run_git(
            &self.bin,
            cwd,
            &["status", "-z", "--untracked-files=all", "--", "."],
        )?;
        let prefix = cwd
            .as_str()
            .strip_prefix(self.root.as_str())
            .map(|p| p.trim_start_matches(std::path::MAIN_SEPARATOR))
            .unwrap_or_default();
        Self::parse_status(&output, prefix)
    }

    fn parse_status(
        output: &[u8],
        prefix: &str,
    ) -> Result<(Vec<RelativeUnixPathBuf>, Vec<RelativeUnixPathBuf>), Error> {
        let mut to_hash = Vec::new();
        let mut deleted = Vec::new();

        // Porcelain entries are "XY <path>"; renames carry the origin path
        // as an extra NUL-separated field.
        let mut fields = output.split(|b| *b == b'\0').peekable();
        while let Some(entry) = fields.next() {
            if entry.len() < 4 {
                continue;
            }
            let entry = std::str::from_utf8(entry).map_err(|_| Error::Encoding)?;
            let (status, path) = entry.split_at(3);
            let x = status.as_bytes()[0];
            let y = status.as_bytes()[1];

            let is_rename = x == b'R' || y == b'R';
            if is_rename {
                // The next field is the path the file moved from
                if let Some(from) = fields.next() {
                    let from = std::str::from_utf8(from).map_err(|_| Error::Encoding)?;
                    if let Some(from) = Self::reanchor(from, prefix)? {
                        deleted.push(from);
                    }
                }
            }

            let Some(path) = Self::reanchor(path, prefix)? else {
                // Status pathspec was limited to the package, but renames
                // can reference paths outside it
                continue;
            };
            if x == b'D' || y == b'D' {
                deleted.push(path);
            } else {
                to_hash.push(path);
            }
        }

        Ok((to_hash, deleted))
    }

    // Status paths are repo-root-relative; re-anchor them at the package.
    fn reanchor(path: &str, prefix: &str) -> Result<Option<RelativeUnixPathBuf>, Error> {
        if prefix.is_empty() {
            return Ok(Some(RelativeUnixPathBuf::new(path.to_string())?));
        }
        // The prefix is an anchored system path; status output is unix-style
        let unix_prefix = prefix.replace(std::path::MAIN_SEPARATOR, "/");
        let Some(stripped) = path
            .strip_prefix(unix_prefix.as_str())
            .map(|p| p.trim_start_matches('/'))
        else {
            debug!("status entry {path} falls outside of package {prefix}");
            return Ok(None);
        };
        Ok(Some(RelativeUnixPathBuf::new(stripped.to_string())?))
    }
}
