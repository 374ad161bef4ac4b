use std::{
    fs::OpenOptions,
    io::{BufWriter, Read, Write},
    path::Path,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use convoypath::{AbsoluteSystemPath, AbsoluteSystemPathBuf, AnchoredSystemPath};
use sha2::{Digest, Sha512};
use tar::{EntryType, Header};

use crate::CacheError;

/// Process-wide counter making temp filenames unique across concurrent
/// tasks; combined with the PID for cross-process uniqueness.
static TEMP_FILE_COUNTER: AtomicU64 = AtomicU64::new(0);

fn generate_temp_path(final_path: &AbsoluteSystemPath) -> AbsoluteSystemPathBuf {
    let file_name = final_path.file_name().unwrap_or("cache").to_string();
    let unique_id = TEMP_FILE_COUNTER.fetch_add(1, Ordering::Relaxed);
    let temp_name = format!(".{}.{}.{}.tmp", file_name, std::process::id(), unique_id);
    final_path
        .parent()
        .expect("cache path has a parent directory")
        .join_component(&temp_name)
}

/// Tees tar output into a digest before compression, so the fingerprintable
/// stream is the uncompressed one.
struct DigestWriter<W: Write> {
    inner: W,
    digest: Arc<Mutex<Sha512>>,
}

impl<W: Write> Write for DigestWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.digest
            .lock()
            .expect("digest lock poisoned")
            .update(&buf[..written]);
        Ok(written)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// Writes a cache archive: a tar stream of normalized entries behind a
/// single-pass zstd compression, with an integrity digest of the
/// uncompressed stream.
///
/// When created via [`CacheWriter::create`], bytes go to a temporary file
/// that is atomically renamed into place by [`CacheWriter::finish`], so
/// concurrent readers see either the whole old artifact or the whole new
/// one. `Drop` removes the temp file if `finish` never ran.
pub struct CacheWriter<'a> {
    builder: tar::Builder<Box<dyn Write + 'a>>,
    digest: Arc<Mutex<Sha512>>,
    temp_path: Option<AbsoluteSystemPathBuf>,
    final_path: Option<AbsoluteSystemPathBuf>,
}

impl Drop for CacheWriter<'_> {
    fn drop(&mut self) {
        // Best-effort cleanup when finish() was never reached
        if let Some(temp_path) = self.temp_path.take() {
            let _ = temp_path.remove_file();
        }
    }
}

impl<'a> CacheWriter<'a> {
    fn append_data(
        &mut self,
        header: &mut Header,
        path: impl AsRef<Path>,
        body: impl Read,
    ) -> Result<(), CacheError> {
        Ok(self.builder.append_data(header, path, body)?)
    }

    fn append_link(
        &mut self,
        header: &mut Header,
        path: impl AsRef<Path>,
        target: impl AsRef<Path>,
    ) -> Result<(), CacheError> {
        Ok(self.builder.append_link(header, path, target)?)
    }

    /// Finalizes the archive and, for file-backed writers, renames the temp
    /// file into place. Returns the hex digest of the uncompressed stream.
    pub fn finish(mut self) -> Result<String, CacheError> {
        // Writes the tar terminator; the zstd encoder finalizes on drop via
        // auto_finish
        self.builder.finish()?;

        if let (Some(temp_path), Some(final_path)) = (self.temp_path.take(), self.final_path.take())
        {
            temp_path.rename(&final_path)?;
        }

        let digest = self.digest.lock().expect("digest lock poisoned").clone();
        Ok(hex::encode(digest.finalize()))
    }

    pub fn from_writer(writer: impl Write + 'a, use_compression: bool) -> Result<Self, CacheError> {
        let digest = Arc::new(Mutex::new(Sha512::new()));
        let builder: Box<dyn Write + 'a> = if use_compression {
            let zw = zstd::Encoder::new(writer, 0)?.auto_finish();
            Box::new(DigestWriter {
                inner: zw,
                digest: digest.clone(),
            })
        } else {
            Box::new(DigestWriter {
                inner: writer,
                digest: digest.clone(),
            })
        };
        Ok(CacheWriter {
            builder: tar::Builder::new(builder),
            digest,
            temp_path: None,
            final_path: None,
        })
    }

    // Wires up the chain of writers:
    // tar::Builder -> DigestWriter -> zstd::Encoder (optional) -> BufWriter -> File
    pub fn create(path: &AbsoluteSystemPath) -> Result<Self, CacheError> {
        let temp_path = generate_temp_path(path);

        let mut options = OpenOptions::new();
        options.write(true).create(true).truncate(true);
        let file = temp_path.open_with_options(options)?;

        // Flush to disk in 1mb chunks.
        let file_buffer = BufWriter::with_capacity(2usize.pow(20), file);

        let is_compressed = path.extension() == Some("zst");
        let digest = Arc::new(Mutex::new(Sha512::new()));

        let writer: Box<dyn Write> = if is_compressed {
            let zw = zstd::Encoder::new(file_buffer, 0)?.auto_finish();
            Box::new(DigestWriter {
                inner: zw,
                digest: digest.clone(),
            })
        } else {
            Box::new(DigestWriter {
                inner: file_buffer,
                digest: digest.clone(),
            })
        };

        Ok(CacheWriter {
            builder: tar::Builder::new(writer),
            digest,
            temp_path: Some(temp_path),
            final_path: Some(path.to_owned()),
        })
    }

    /// Appends one filesystem entry. Callers supply entries in sorted
    /// anchored-unix order so identical inputs produce identical bytes.
    pub fn add_file(
        &mut self,
        anchor: &AbsoluteSystemPath,
        file_path: &AnchoredSystemPath,
    ) -> Result<(), CacheError> {
        let source_path = anchor.resolve(file_path);
        let file_info = source_path.symlink_metadata()?;

        // Tar entry names are unix-style; directories carry a trailing slash
        let mut file_path = file_path.to_unix();
        file_path.make_canonical_for_tar(file_info.is_dir());

        let mut header = Self::create_header(&file_info)?;

        if matches!(header.entry_type(), EntryType::Regular) && file_info.len() > 0 {
            let file = source_path.open()?;
            self.append_data(&mut header, file_path.as_str(), file)?;
        } else if matches!(header.entry_type(), EntryType::Symlink) {
            // Target strings are preserved verbatim; they are restored as
            // written
            let target = source_path.read_link()?;
            self.append_link(&mut header, file_path.as_str(), target.as_std_path())?;
        } else {
            self.append_data(&mut header, file_path.as_str(), &mut std::io::empty())?;
        }

        Ok(())
    }

    fn create_header(file_info: &std::fs::Metadata) -> Result<Header, CacheError> {
        let mut header = Header::new_gnu();

        if file_info.is_symlink() {
            // The linkname is set when the entry is appended; set through
            // the header it could overflow the fixed-size field
            header.set_entry_type(EntryType::Symlink);
            header.set_size(0);
            header.set_mode(0o777);
        } else if file_info.is_dir() {
            header.set_entry_type(EntryType::Directory);
            header.set_size(0);
            header.set_mode(0o755);
        } else if file_info.is_file() {
            header.set_entry_type(EntryType::Regular);
            header.set_size(file_info.len());
            header.set_mode(normalized_file_mode(file_info));
        } else {
            // Fifos, sockets, and devices have no place in a cache
            return Err(CacheError::CreateUnsupportedFileType);
        }

        // Consistent creation
        header.set_uid(0);
        header.set_gid(0);
        header.as_gnu_mut().unwrap().set_atime(0);
        header.set_mtime(0);
        header.as_gnu_mut().unwrap().set_ctime(0);

        Ok(header)
    }
}

// Everything but the owner-executable bit is normalized away; 0644 plain,
// 0755 executable, on every platform.
#[cfg(unix)]
fn normalized_file_mode(file_info: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::MetadataExt;
    if file_info.mode() & 0o100 != 0 {
        0o755
    } else {
        0o644
    }
}

#[cfg(not(unix))]
fn normalized_file_mode(_file_info: &std::fs::Metadata) -> u32 {
    0o644
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use convoypath::AnchoredSystemPathBuf;
    use tempfile::tempdir;
    use test_case::test_case;

    use super::*;
    use crate::cache_archive::restore::CacheReader;

    #[derive(Debug)]
    enum FileType {
        Dir,
        Symlink { linkname: String },
        File,
    }

    #[derive(Debug)]
    struct CreateFileDefinition {
        path: AnchoredSystemPathBuf,
        file_type: FileType,
    }

    fn create_entry(anchor: &AbsoluteSystemPath, file: &CreateFileDefinition) -> Result<()> {
        let path = anchor.resolve(&file.path);
        match &file.file_type {
            FileType::Dir => path.create_dir_all()?,
            FileType::Symlink { linkname } => path.symlink_to_file(linkname)?,
            FileType::File => path.create_with_contents(b"file contents")?,
        }
        Ok(())
    }

    #[test_case(
        vec![
            CreateFileDefinition {
                path: AnchoredSystemPathBuf::from_raw("hello world.txt").unwrap(),
                file_type: FileType::File,
            }
        ]
        ; "create regular file"
    )]
    #[test_case(
        vec![
            CreateFileDefinition {
                path: AnchoredSystemPathBuf::from_raw("one").unwrap(),
                file_type: FileType::Symlink { linkname: "two".to_string() },
            },
            CreateFileDefinition {
                path: AnchoredSystemPathBuf::from_raw("two").unwrap(),
                file_type: FileType::Symlink { linkname: "three".to_string() },
            },
            CreateFileDefinition {
                path: AnchoredSystemPathBuf::from_raw("three").unwrap(),
                file_type: FileType::Symlink { linkname: "real".to_string() },
            },
            CreateFileDefinition {
                path: AnchoredSystemPathBuf::from_raw("real").unwrap(),
                file_type: FileType::File,
            }
        ]
        ; "create symlinks"
    )]
    #[test_case(
        vec![
            CreateFileDefinition {
                path: AnchoredSystemPathBuf::from_raw("parent").unwrap(),
                file_type: FileType::Dir,
            },
            CreateFileDefinition {
                path: AnchoredSystemPathBuf::from_raw(
                    ["parent", "child"].join(std::path::MAIN_SEPARATOR_STR)
                ).unwrap(),
                file_type: FileType::File,
            },
        ]
        ; "create directory"
    )]
    fn test_create_round_trips(files: Vec<CreateFileDefinition>) -> Result<()> {
        for compressed in [false, true] {
            let input_dir = tempdir()?;
            let archive_dir = tempdir()?;
            let input_dir_path = AbsoluteSystemPathBuf::try_from(input_dir.path())?;
            let archive_path = if compressed {
                AbsoluteSystemPathBuf::try_from(archive_dir.path().join("out.tar.zst"))?
            } else {
                AbsoluteSystemPathBuf::try_from(archive_dir.path().join("out.tar"))?
            };

            let mut cache_archive = CacheWriter::create(&archive_path)?;
            for file in files.iter() {
                create_entry(&input_dir_path, file)?;
                cache_archive.add_file(&input_dir_path, &file.path)?;
            }
            let digest = cache_archive.finish()?;
            assert_eq!(digest.len(), 128);

            // The digest is reproducible from the written artifact
            let reader = CacheReader::open(&archive_path)?;
            assert_eq!(reader.get_sha()?, digest);

            let restore_dir = tempdir()?;
            let restore_path = AbsoluteSystemPathBuf::try_from(restore_dir.path())?;
            let mut reader = CacheReader::open(&archive_path)?;
            let restored = reader.restore(&restore_path)?;
            assert_eq!(restored.len(), files.len());
        }
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn test_unsupported_file_type_fails() -> Result<()> {
        use std::ffi::CString;

        let input_dir = tempdir()?;
        let input_dir_path = AbsoluteSystemPathBuf::try_from(input_dir.path())?;
        let fifo_path = input_dir_path.join_component("fifo");
        let path_cstr = CString::new(fifo_path.as_str())?;
        unsafe {
            libc::mkfifo(path_cstr.as_ptr(), 0o644);
        }

        let archive_dir = tempdir()?;
        let archive_path = AbsoluteSystemPathBuf::try_from(archive_dir.path().join("out.tar"))?;
        let mut cache_archive = CacheWriter::create(&archive_path)?;
        let result = cache_archive.add_file(
            &input_dir_path,
            &AnchoredSystemPathBuf::from_raw("fifo").unwrap(),
        );
        assert!(matches!(result, Err(CacheError::CreateUnsupportedFileType)));
        Ok(())
    }

    #[test]
    fn test_deterministic_bytes() -> Result<()> {
        let input_dir = tempdir()?;
        let input_dir_path = AbsoluteSystemPathBuf::try_from(input_dir.path())?;
        input_dir_path
            .join_component("a.txt")
            .create_with_contents(b"alpha")?;
        input_dir_path
            .join_component("b.txt")
            .create_with_contents(b"beta")?;

        let write_archive = || -> Result<Vec<u8>> {
            let mut bytes = Vec::new();
            {
                let mut writer = CacheWriter::from_writer(&mut bytes, true)?;
                writer.add_file(
                    &input_dir_path,
                    &AnchoredSystemPathBuf::from_raw("a.txt").unwrap(),
                )?;
                writer.add_file(
                    &input_dir_path,
                    &AnchoredSystemPathBuf::from_raw("b.txt").unwrap(),
                )?;
                writer.finish()?;
            }
            Ok(bytes)
        };

        assert_eq!(write_archive()?, write_archive()?);
        Ok(())
    }

    #[test]
    fn test_temp_file_cleaned_up_on_drop() -> Result<()> {
        let archive_dir = tempdir()?;
        let archive_path =
            AbsoluteSystemPathBuf::try_from(archive_dir.path().join("test.tar.zst"))?;

        {
            let _writer = CacheWriter::create(&archive_path)?;
            // Dropped without finish()
        }

        let leftovers: Vec<_> = std::fs::read_dir(archive_dir.path())?
            .filter_map(|e| e.ok())
            .collect();
        assert!(
            leftovers.is_empty(),
            "temp files should not outlive the writer: {leftovers:?}"
        );
        Ok(())
    }

    #[test]
    fn test_generate_temp_path_uniqueness() -> Result<()> {
        let archive_dir = tempdir()?;
        let base_path = AbsoluteSystemPathBuf::try_from(archive_dir.path().join("hash.tar.zst"))?;

        let paths: Vec<_> = (0..100).map(|_| generate_temp_path(&base_path)).collect();
        let unique: std::collections::HashSet<_> = paths.iter().collect();
        assert_eq!(unique.len(), paths.len());
        Ok(())
    }
}
