use std::{
    collections::{HashMap, HashSet},
    io::Read,
    path::{Path, PathBuf},
};

use convoypath::{AbsoluteSystemPath, AbsoluteSystemPathBuf, AnchoredSystemPathBuf};
use petgraph::graph::DiGraph;
use sha2::{Digest, Sha512};
use tar::Entry;

use crate::CacheError;

/// Reads a cache archive back onto disk.
pub struct CacheReader<'a> {
    reader: Box<dyn Read + 'a>,
}

impl<'a> CacheReader<'a> {
    pub fn from_reader(reader: impl Read + 'a, is_compressed: bool) -> Result<Self, CacheError> {
        let reader: Box<dyn Read> = if is_compressed {
            Box::new(zstd::Decoder::new(reader)?)
        } else {
            Box::new(reader)
        };

        Ok(CacheReader { reader })
    }

    pub fn open(path: &AbsoluteSystemPath) -> Result<Self, CacheError> {
        let file = path.open()?;
        let is_compressed = path.extension() == Some("zst");

        let reader: Box<dyn Read> = if is_compressed {
            Box::new(zstd::Decoder::new(file)?)
        } else {
            Box::new(file)
        };

        Ok(CacheReader { reader })
    }

    /// Hex digest of the full uncompressed stream. Consumes the reader;
    /// verification happens before restoration touches the filesystem.
    pub fn get_sha(mut self) -> Result<String, CacheError> {
        let mut hasher = Sha512::new();
        let mut buffer = [0; 8192];
        loop {
            let n = self.reader.read(&mut buffer)?;
            if n == 0 {
                break;
            }
            hasher.update(&buffer[..n]);
        }

        Ok(hex::encode(hasher.finalize()))
    }

    /// Restores every entry under `anchor`, creating parent directories
    /// idempotently and applying normalized modes. Returns the restored
    /// paths in restoration order.
    pub fn restore(
        &mut self,
        anchor: &AbsoluteSystemPath,
    ) -> Result<Vec<AnchoredSystemPathBuf>, CacheError> {
        let mut restored = Vec::new();
        anchor.create_dir_all()?;

        let mut dir_cache = CachedDirTree::new();
        let mut tr = tar::Archive::new(&mut self.reader);

        // Symlinks whose targets have not been restored yet are deferred
        // and topologically ordered after the main pass.
        let mut deferred_symlinks: Vec<DeferredSymlink> = Vec::new();

        for entry in tr.entries()? {
            let mut entry = entry?;
            let processed_name = AnchoredSystemPathBuf::from_system_path(&entry.path()?)?;

            match entry.header().entry_type() {
                tar::EntryType::Directory => {
                    restore_directory(&mut dir_cache, anchor, &processed_name)?;
                    restored.push(processed_name);
                }
                tar::EntryType::Regular => {
                    restore_regular(&mut dir_cache, anchor, &processed_name, &mut entry)?;
                    restored.push(processed_name);
                }
                tar::EntryType::Symlink => {
                    let linkname = entry
                        .header()
                        .link_name()?
                        .ok_or(CacheError::LinkTargetNotOnHeader)?
                        .into_owned();
                    match restore_symlink(anchor, &mut dir_cache, &processed_name, &linkname, false)
                    {
                        Ok(()) => restored.push(processed_name),
                        Err(CacheError::LinkTargetDoesNotExist(_)) => {
                            deferred_symlinks.push(DeferredSymlink {
                                path: processed_name,
                                linkname,
                            });
                        }
                        Err(err) => return Err(err),
                    }
                }
                ty => return Err(CacheError::RestoreUnsupportedFileType(ty)),
            }
        }

        restored.append(&mut topologically_restore_symlinks(
            anchor,
            &mut dir_cache,
            deferred_symlinks,
        )?);
        Ok(restored)
    }
}

struct DeferredSymlink {
    path: AnchoredSystemPathBuf,
    linkname: PathBuf,
}

// Symlinks may point at each other; restoring them in dependency order
// keeps the existence check meaningful for chains like one -> two -> real.
fn topologically_restore_symlinks(
    anchor: &AbsoluteSystemPath,
    dir_cache: &mut CachedDirTree,
    symlinks: Vec<DeferredSymlink>,
) -> Result<Vec<AnchoredSystemPathBuf>, CacheError> {
    let mut graph = DiGraph::new();
    let mut nodes = HashMap::new();
    let mut entry_lookup = HashMap::new();
    let mut restored = Vec::new();

    for symlink in &symlinks {
        let source = canonicalize_linkname(anchor, &symlink.path, symlink.path.as_path());
        let target = canonicalize_linkname(anchor, &symlink.path, &symlink.linkname);

        let source_node = *nodes
            .entry(source.clone())
            .or_insert_with(|| graph.add_node(source.clone()));
        let target_node = *nodes
            .entry(target.clone())
            .or_insert_with(|| graph.add_node(target));
        graph.add_edge(source_node, target_node, ());

        entry_lookup.insert(source, symlink);
    }

    let ordering =
        petgraph::algo::toposort(&graph, None).map_err(|_| CacheError::CycleDetected)?;

    for node in ordering {
        let key = &graph[node];
        let Some(symlink) = entry_lookup.get(key) else {
            continue;
        };
        restore_symlink(anchor, dir_cache, &symlink.path, &symlink.linkname, true)?;
        restored.push(symlink.path.clone());
    }

    Ok(restored)
}

/// Tracks directories already known to exist so restoration does not stat
/// or recreate the same tree repeatedly.
struct CachedDirTree {
    created: HashSet<AbsoluteSystemPathBuf>,
}

impl CachedDirTree {
    fn new() -> Self {
        Self {
            created: HashSet::new(),
        }
    }

    fn ensure_parent(
        &mut self,
        anchor: &AbsoluteSystemPath,
        path: &AbsoluteSystemPath,
    ) -> Result<(), CacheError> {
        let Some(parent) = path.parent() else {
            return Ok(());
        };
        if self.created.contains(&parent.to_owned()) {
            return Ok(());
        }
        check_within_anchor(anchor, parent)?;
        parent.create_dir_all()?;
        self.created.insert(parent.to_owned());
        Ok(())
    }

    fn mark_created(&mut self, path: AbsoluteSystemPathBuf) {
        self.created.insert(path);
    }
}

// Follows any already-restored symlinks in the parent chain and confirms
// the write lands under the anchor. This is what stops a crafted archive
// from planting a symlink to `..` and writing through it.
fn check_within_anchor(
    anchor: &AbsoluteSystemPath,
    path: &AbsoluteSystemPath,
) -> Result<(), CacheError> {
    // Canonicalize the deepest existing ancestor; everything below it is
    // yet to be created and cannot redirect the write.
    let mut existing: &AbsoluteSystemPath = path;
    while !existing.exists() {
        let Some(parent) = existing.parent() else {
            break;
        };
        existing = parent;
    }

    let canonical_existing = std::fs::canonicalize(existing.as_std_path())?;
    let canonical_anchor = std::fs::canonicalize(anchor.as_std_path())?;
    if !canonical_existing.starts_with(&canonical_anchor) {
        return Err(CacheError::LinkOutsideOfDirectory(
            path.as_str().to_string(),
        ));
    }
    Ok(())
}

fn restore_directory(
    dir_cache: &mut CachedDirTree,
    anchor: &AbsoluteSystemPath,
    processed_name: &AnchoredSystemPathBuf,
) -> Result<(), CacheError> {
    let target = anchor.resolve(processed_name);
    dir_cache.ensure_parent(anchor, &target)?;
    check_within_anchor(anchor, &target)?;
    target.create_dir_all()?;
    target.set_mode(0o755)?;
    dir_cache.mark_created(target);
    Ok(())
}

fn restore_regular<T: Read>(
    dir_cache: &mut CachedDirTree,
    anchor: &AbsoluteSystemPath,
    processed_name: &AnchoredSystemPathBuf,
    entry: &mut Entry<'_, T>,
) -> Result<(), CacheError> {
    let target = anchor.resolve(processed_name);
    dir_cache.ensure_parent(anchor, &target)?;
    check_within_anchor(anchor, &target)?;

    let mode = entry.header().mode().unwrap_or(0o644);
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    let mut file = target.open_with_options(options)?;
    std::io::copy(entry, &mut file)?;
    drop(file);
    target.set_mode(mode & 0o777)?;
    Ok(())
}

fn restore_symlink(
    anchor: &AbsoluteSystemPath,
    dir_cache: &mut CachedDirTree,
    processed_name: &AnchoredSystemPathBuf,
    linkname: &Path,
    allow_missing_target: bool,
) -> Result<(), CacheError> {
    let link_path = anchor.resolve(processed_name);
    dir_cache.ensure_parent(anchor, &link_path)?;

    if !allow_missing_target {
        let resolved_target = canonicalize_linkname(anchor, processed_name, linkname);
        if !resolved_target.exists() {
            return Err(CacheError::LinkTargetDoesNotExist(
                linkname.to_string_lossy().into_owned(),
            ));
        }
    }

    // Restoration may legitimately overwrite an earlier link with the same
    // name (last entry wins)
    if link_path.symlink_metadata().is_ok() {
        link_path.remove_file()?;
    }

    let target = linkname.to_string_lossy();
    link_path.symlink_to_file(target.as_ref())?;
    Ok(())
}

/// Resolves a symlink target to the absolute location it would point at
/// once restored, without touching the filesystem.
fn canonicalize_linkname(
    anchor: &AbsoluteSystemPath,
    processed_name: &AnchoredSystemPathBuf,
    linkname: &Path,
) -> PathBuf {
    use path_clean::PathClean;

    if linkname.is_absolute() {
        return linkname.to_path_buf().clean();
    }
    let link_location = anchor.resolve(processed_name);
    link_location
        .as_std_path()
        .parent()
        .unwrap_or_else(|| anchor.as_std_path())
        .join(linkname)
        .clean()
}

#[cfg(test)]
mod tests {
    use std::{fs, fs::File, io::empty};

    use anyhow::Result;
    use tar::Header;
    use tempfile::{tempdir, TempDir};

    use super::*;

    enum TarFile {
        File {
            body: Vec<u8>,
            path: &'static str,
        },
        Directory {
            path: &'static str,
        },
        Symlink {
            link_path: &'static str,
            link_target: &'static str,
        },
        Fifo {
            path: &'static str,
        },
    }

    struct TestCase {
        name: &'static str,
        input_files: Vec<TarFile>,
        // Restored paths on success, error message otherwise
        expected_output: Result<Vec<&'static str>, &'static str>,
    }

    fn generate_tar(test_dir: &TempDir, files: &[TarFile]) -> Result<AbsoluteSystemPathBuf> {
        let test_archive_path = test_dir.path().join("test.tar");
        let archive_file = File::create(&test_archive_path)?;

        let mut tar_writer = tar::Builder::new(archive_file);

        for file in files {
            match file {
                TarFile::File { path, body } => {
                    let mut header = Header::new_gnu();
                    header.set_size(body.len() as u64);
                    header.set_entry_type(tar::EntryType::Regular);
                    header.set_mode(0o644);
                    // `Header::set_path` (used by `append_data`) rejects `..`
                    // components, which is exactly the malicious path this test
                    // needs inside the archive, so write the raw name bytes instead.
                    let name_bytes = path.as_bytes();
                    header.as_old_mut().name[..name_bytes.len()].copy_from_slice(name_bytes);
                    header.set_cksum();
                    tar_writer.append(&header, &body[..])?;
                }
                TarFile::Directory { path } => {
                    let mut header = Header::new_gnu();
                    header.set_entry_type(tar::EntryType::Directory);
                    header.set_size(0);
                    header.set_mode(0o755);
                    tar_writer.append_data(&mut header, path, empty())?;
                }
                TarFile::Symlink {
                    link_path,
                    link_target,
                } => {
                    let mut header = tar::Header::new_gnu();
                    header.set_entry_type(tar::EntryType::Symlink);
                    header.set_size(0);
                    tar_writer.append_link(&mut header, link_path, link_target)?;
                }
                // Unsupported, but needed in archives for testing
                TarFile::Fifo { path } => {
                    let mut header = tar::Header::new_gnu();
                    header.set_entry_type(tar::EntryType::Fifo);
                    header.set_size(0);
                    tar_writer.append_data(&mut header, path, empty())?;
                }
            }
        }

        tar_writer.into_inner()?;

        Ok(AbsoluteSystemPathBuf::try_from(
            test_archive_path.as_path(),
        )?)
    }

    #[test]
    fn test_name_traversal_rejected() -> Result<()> {
        let input_dir = tempdir()?;
        let archive_path = generate_tar(
            &input_dir,
            &[TarFile::File {
                body: b"escape".to_vec(),
                path: "../escape",
            }],
        )?;

        let output_dir = tempdir()?;
        let anchor = AbsoluteSystemPath::from_std_path(output_dir.path())?;
        let mut cache_reader = CacheReader::open(&archive_path)?;
        let result = cache_reader.restore(anchor);
        assert_eq!(
            result.unwrap_err().to_string(),
            "Invalid file path: path is malformed: ../escape"
        );
        Ok(())
    }

    #[test]
    fn test_restore() -> Result<()> {
        let tests = vec![
            TestCase {
                name: "cache optimized",
                input_files: vec![
                    TarFile::Directory { path: "one/" },
                    TarFile::Directory { path: "one/two/" },
                    TarFile::Directory {
                        path: "one/two/three/",
                    },
                    TarFile::File {
                        body: vec![],
                        path: "one/two/three/file-one",
                    },
                    TarFile::File {
                        body: vec![],
                        path: "one/two/three/file-two",
                    },
                ],
                expected_output: Ok(vec![
                    "one",
                    "one/two",
                    "one/two/three",
                    "one/two/three/file-one",
                    "one/two/three/file-two",
                ]),
            },
            TestCase {
                name: "pathological cache works",
                input_files: vec![
                    TarFile::Directory { path: "one/" },
                    TarFile::File {
                        body: vec![],
                        path: "one/file",
                    },
                    TarFile::Directory { path: "two/" },
                    TarFile::File {
                        body: vec![],
                        path: "two/file",
                    },
                ],
                expected_output: Ok(vec!["one", "one/file", "two", "two/file"]),
            },
            TestCase {
                name: "symlink hello world",
                input_files: vec![
                    TarFile::Directory { path: "target" },
                    TarFile::Symlink {
                        link_path: "source",
                        link_target: "target",
                    },
                ],
                expected_output: Ok(vec!["target", "source"]),
            },
            TestCase {
                name: "pathological symlinks",
                input_files: vec![
                    TarFile::Symlink {
                        link_path: "one",
                        link_target: "two",
                    },
                    TarFile::Symlink {
                        link_path: "two",
                        link_target: "three",
                    },
                    TarFile::Symlink {
                        link_path: "three",
                        link_target: "real",
                    },
                    TarFile::File {
                        body: b"real".to_vec(),
                        path: "real",
                    },
                ],
                expected_output: Ok(vec!["real", "one", "two", "three"]),
            },
            TestCase {
                name: "symlink cycle",
                input_files: vec![
                    TarFile::Symlink {
                        link_path: "one",
                        link_target: "two",
                    },
                    TarFile::Symlink {
                        link_path: "two",
                        link_target: "three",
                    },
                    TarFile::Symlink {
                        link_path: "three",
                        link_target: "one",
                    },
                ],
                expected_output: Err("links in the cache are cyclic"),
            },
            TestCase {
                name: "symlink clobber",
                input_files: vec![
                    TarFile::Symlink {
                        link_path: "one",
                        link_target: "two",
                    },
                    TarFile::Symlink {
                        link_path: "one",
                        link_target: "three",
                    },
                    TarFile::Symlink {
                        link_path: "one",
                        link_target: "real",
                    },
                    TarFile::File {
                        body: b"real".to_vec(),
                        path: "real",
                    },
                ],
                expected_output: Ok(vec!["real", "one"]),
            },
            TestCase {
                name: "symlink traversal",
                input_files: vec![
                    TarFile::Symlink {
                        link_path: "escape",
                        link_target: "../",
                    },
                    TarFile::File {
                        body: b"file".to_vec(),
                        path: "escape/file",
                    },
                ],
                expected_output: Err("tar attempts to write outside of directory"),
            },
            TestCase {
                name: "fifo unsupported",
                input_files: vec![TarFile::Fifo { path: "fifo" }],
                expected_output: Err("attempted to restore unsupported file type: Fifo"),
            },
            TestCase {
                name: "duplicate restores",
                input_files: vec![
                    TarFile::File {
                        body: b"target".to_vec(),
                        path: "target",
                    },
                    TarFile::Symlink {
                        link_path: "source",
                        link_target: "target",
                    },
                    TarFile::Directory { path: "one/" },
                    TarFile::Directory { path: "one/two/" },
                ],
                expected_output: Ok(vec!["target", "source", "one", "one/two"]),
            },
        ];

        for is_compressed in [true, false] {
            for test in &tests {
                let input_dir = tempdir()?;
                let archive_path = generate_tar(&input_dir, &test.input_files)?;
                let output_dir = tempdir()?;
                let anchor = AbsoluteSystemPath::from_std_path(output_dir.path())?;

                let archive_path = if is_compressed {
                    compress_tar(&archive_path)?
                } else {
                    archive_path
                };

                let mut cache_reader = CacheReader::open(&archive_path)?;

                match (cache_reader.restore(anchor), &test.expected_output) {
                    (Ok(restored), Ok(expected)) => {
                        let restored: Vec<_> =
                            restored.iter().map(|p| p.to_unix().into_string()).collect();
                        assert_eq!(&restored, expected, "{}", test.name);
                    }
                    (Err(err), Err(expected)) => {
                        assert!(
                            err.to_string().starts_with(expected),
                            "{}: expected `{expected}`, got `{err}`",
                            test.name
                        );
                    }
                    (Ok(restored), Err(expected)) => panic!(
                        "{}: expected error {expected}, restored {restored:?}",
                        test.name
                    ),
                    (Err(err), Ok(_)) => panic!("{}: unexpected error {err}", test.name),
                }
            }
        }

        Ok(())
    }

    fn compress_tar(archive_path: &AbsoluteSystemPathBuf) -> Result<AbsoluteSystemPathBuf> {
        let mut input_file = File::open(archive_path.as_std_path())?;
        let output_file_path = format!("{archive_path}.zst");
        let output_file = File::create(&output_file_path)?;
        let mut zw = zstd::stream::Encoder::new(output_file, 0)?;
        std::io::copy(&mut input_file, &mut zw)?;
        zw.finish()?;
        Ok(AbsoluteSystemPathBuf::new(output_file_path)?)
    }

    #[test]
    fn test_restored_file_contents() -> Result<()> {
        let input_dir = tempdir()?;
        let archive_path = generate_tar(
            &input_dir,
            &[
                TarFile::Directory { path: "folder/" },
                TarFile::File {
                    body: b"file contents".to_vec(),
                    path: "folder/file",
                },
            ],
        )?;

        let output_dir = tempdir()?;
        let anchor = AbsoluteSystemPath::from_std_path(output_dir.path())?;
        let mut cache_reader = CacheReader::open(&archive_path)?;
        cache_reader.restore(anchor)?;

        let contents = fs::read(output_dir.path().join("folder").join("file"))?;
        assert_eq!(contents, b"file contents");
        Ok(())
    }
}
