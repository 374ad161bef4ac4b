use std::io::Read;

use convoypath::AbsoluteSystemPath;
use sha1::{Digest, Sha1};

use crate::Error;

/// Hashes bytes the way the git object store does: the digest of
/// `"blob " <decimal-size> NUL <bytes>`. Matching git here is what lets the
/// working-tree fallback agree byte-for-byte with index-derived hashes.
pub(crate) fn hash_blob_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(format!("blob {}\0", bytes.len()).as_bytes());
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Streams a file through the blob hash without loading it whole.
pub(crate) fn hash_file(path: &AbsoluteSystemPath) -> Result<String, Error> {
    let metadata = path.symlink_metadata()?;

    if metadata.is_symlink() {
        // A symlink blob's content is its target string
        let target = path.read_link()?;
        return Ok(hash_blob_bytes(target.as_str().as_bytes()));
    }

    if !metadata.is_file() {
        return Err(Error::UnsupportedFileType(path.to_string()));
    }

    let mut hasher = Sha1::new();
    hasher.update(format!("blob {}\0", metadata.len()).as_bytes());

    let mut file = path.open()?;
    let mut buffer = [0u8; 8192];
    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use convoypath::AbsoluteSystemPathBuf;
    use test_case::test_case;

    use super::*;

    // Known git blob hashes, e.g. `echo -n "" | git hash-object --stdin`
    #[test_case(b"", "e69de29bb2d1d6434b8b29ae775ad8c2e48c5391" ; "empty blob")]
    #[test_case(b"hello world\n", "3b18e512dba79e4c8300dd08aeb37f8e728b8dad" ; "hello world")]
    fn test_hash_blob_bytes(bytes: &[u8], expected: &str) {
        assert_eq!(hash_blob_bytes(bytes), expected);
    }

    #[test]
    fn test_hash_file_matches_bytes() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let root = AbsoluteSystemPathBuf::try_from(dir.path())?;
        let file = root.join_component("data.txt");
        file.create_with_contents(b"file contents")?;
        assert_eq!(hash_file(&file)?, hash_blob_bytes(b"file contents"));
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn test_hash_symlink_is_target_string() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let root = AbsoluteSystemPathBuf::try_from(dir.path())?;
        let link = root.join_component("link");
        link.symlink_to_file("target-that-does-not-exist")?;
        assert_eq!(
            hash_file(&link)?,
            hash_blob_bytes(b"target-that-does-not-exist")
        );
        Ok(())
    }
}
