use camino::Utf8Path;
use convoy_analytics::AnalyticsSender;
use convoy_api_client::analytics::{self, AnalyticsEvent};
use convoypath::{AbsoluteSystemPath, AbsoluteSystemPathBuf, AnchoredSystemPathBuf};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    cache_archive::{CacheReader, CacheWriter},
    single_flight::SingleFlight,
    CacheError, CacheHitMetadata, CacheSource,
};

/// The filesystem cache tier: one `<hash>.tar.zst` per entry with a
/// `<hash>-meta.json` sidecar carrying the original duration and the
/// integrity digest of the uncompressed stream.
pub struct FsCache {
    cache_directory: AbsoluteSystemPathBuf,
    analytics_recorder: Option<AnalyticsSender>,
    single_flight: SingleFlight,
}

#[derive(Debug, Deserialize, Serialize)]
struct CacheMetadata {
    hash: String,
    duration: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    digest: Option<String>,
}

impl CacheMetadata {
    fn read(path: &AbsoluteSystemPath) -> Result<CacheMetadata, CacheError> {
        serde_json::from_str(&path.read_to_string()?).map_err(CacheError::InvalidMetadata)
    }
}

impl FsCache {
    pub fn new(
        cache_dir: &Utf8Path,
        repo_root: &AbsoluteSystemPath,
        analytics_recorder: Option<AnalyticsSender>,
    ) -> Result<Self, CacheError> {
        let cache_directory = AbsoluteSystemPathBuf::from_unknown(repo_root, cache_dir);
        cache_directory.create_dir_all()?;

        Ok(FsCache {
            cache_directory,
            analytics_recorder,
            single_flight: SingleFlight::new(),
        })
    }

    fn archive_path(&self, hash: &str) -> AbsoluteSystemPathBuf {
        self.cache_directory
            .join_component(&format!("{hash}.tar.zst"))
    }

    fn metadata_path(&self, hash: &str) -> AbsoluteSystemPathBuf {
        self.cache_directory
            .join_component(&format!("{hash}-meta.json"))
    }

    fn log_fetch(&self, event: analytics::CacheEvent, hash: &str, duration: u64) {
        // Failing to record analytics is not worth failing the cache
        if let Some(analytics_recorder) = &self.analytics_recorder {
            let analytics_event = AnalyticsEvent {
                session_id: None,
                source: analytics::CacheSource::Local,
                event,
                hash: hash.to_string(),
                duration,
            };
            let _ = analytics_recorder.send(analytics_event);
        }
    }

    /// Restores the entry for `hash` under `anchor`. Returns the restored
    /// paths, or `None` on a miss. A corrupted entry is a miss, not an
    /// error.
    #[tracing::instrument(skip_all, fields(hash = hash))]
    pub async fn fetch(
        &self,
        anchor: &AbsoluteSystemPath,
        hash: &str,
    ) -> Result<Option<(CacheHitMetadata, Vec<AnchoredSystemPathBuf>)>, CacheError> {
        let _guard = self.single_flight.acquire(hash).await;

        let cache_path = self.archive_path(hash);
        if !cache_path.exists() {
            debug!("cache miss for {hash} in {}", self.cache_directory);
            self.log_fetch(analytics::CacheEvent::Miss, hash, 0);
            return Ok(None);
        }

        let meta = CacheMetadata::read(&self.metadata_path(hash))?;

        // Verify before any bytes land on disk; a failed check degrades to
        // a miss so the task simply re-runs.
        if let Some(expected_digest) = &meta.digest {
            let actual = CacheReader::open(&cache_path)?.get_sha()?;
            if &actual != expected_digest {
                warn!("cache entry for {hash} failed integrity check, ignoring");
                self.log_fetch(analytics::CacheEvent::Miss, hash, 0);
                return Ok(None);
            }
        }

        let mut cache_reader = CacheReader::open(&cache_path)?;
        let restored_files = cache_reader.restore(anchor)?;

        self.log_fetch(analytics::CacheEvent::Hit, hash, meta.duration);

        Ok(Some((
            CacheHitMetadata {
                source: CacheSource::Local,
                time_saved: meta.duration,
            },
            restored_files,
        )))
    }

    pub async fn exists(&self, hash: &str) -> Result<Option<CacheHitMetadata>, CacheError> {
        if !self.archive_path(hash).exists() {
            return Ok(None);
        }

        let duration = CacheMetadata::read(&self.metadata_path(hash))
            .map(|meta| meta.duration)
            .unwrap_or(0);

        Ok(Some(CacheHitMetadata {
            source: CacheSource::Local,
            time_saved: duration,
        }))
    }

    /// Archives `files` (anchored at `anchor`) into the store.
    #[tracing::instrument(skip_all, fields(hash = hash))]
    pub async fn put(
        &self,
        anchor: &AbsoluteSystemPath,
        hash: &str,
        files: &[AnchoredSystemPathBuf],
        duration: u64,
    ) -> Result<(), CacheError> {
        let _guard = self.single_flight.acquire(hash).await;

        let cache_path = self.archive_path(hash);
        let mut cache_item = CacheWriter::create(&cache_path)?;

        for file in files {
            cache_item.add_file(anchor, file)?;
        }

        // Atomic rename from temp to final path
        let digest = cache_item.finish()?;

        self.write_metadata(hash, duration, Some(digest))
    }

    /// Stores already-archived bytes, e.g. a remote artifact being written
    /// through to the local tier.
    pub async fn put_raw_archive(
        &self,
        hash: &str,
        body: &[u8],
        duration: u64,
    ) -> Result<(), CacheError> {
        let _guard = self.single_flight.acquire(hash).await;

        let cache_path = self.archive_path(hash);
        let temp_path = self
            .cache_directory
            .join_component(&format!(".{hash}.tar.zst.{}.tmp", std::process::id()));
        temp_path.create_with_contents(body)?;
        temp_path.rename(&cache_path)?;

        let digest = CacheReader::from_reader(body, true)?.get_sha()?;
        self.write_metadata(hash, duration, Some(digest))
    }

    /// Removes entries that have not been touched within `max_age`, plus
    /// any temp files a crashed writer left behind.
    pub fn clean(&self, max_age: std::time::Duration) -> Result<usize, CacheError> {
        let now = std::time::SystemTime::now();
        let mut removed = 0;
        for entry in self.cache_directory.read_dir()? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let is_cache_file = name.ends_with(".tar.zst")
                || name.ends_with("-meta.json")
                || name.ends_with(".tmp");
            if !is_cache_file {
                continue;
            }
            let stale = entry
                .metadata()
                .and_then(|meta| meta.modified())
                .ok()
                .and_then(|modified| now.duration_since(modified).ok())
                .is_some_and(|age| age > max_age);
            if stale {
                std::fs::remove_file(entry.path())?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    // Metadata writes use the same temp-then-rename pattern as archives.
    fn write_metadata(
        &self,
        hash: &str,
        duration: u64,
        digest: Option<String>,
    ) -> Result<(), CacheError> {
        let metadata_path = self.metadata_path(hash);
        let meta = CacheMetadata {
            hash: hash.to_string(),
            duration,
            digest,
        };
        let meta_json = serde_json::to_string(&meta).map_err(CacheError::MetadataWriteFailure)?;

        let temp_metadata_path = self
            .cache_directory
            .join_component(&format!(".{hash}-meta.json.{}.tmp", std::process::id()));
        temp_metadata_path.create_with_contents(&meta_json)?;
        temp_metadata_path.rename(&metadata_path)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use convoypath::AnchoredSystemPath;
    use tempfile::tempdir;

    use super::*;

    fn setup() -> Result<(tempfile::TempDir, AbsoluteSystemPathBuf, FsCache)> {
        let repo_root = tempdir()?;
        let repo_root_path = AbsoluteSystemPathBuf::try_from(repo_root.path())?;
        let cache = FsCache::new(Utf8Path::new("cache"), &repo_root_path, None)?;
        Ok((repo_root, repo_root_path, cache))
    }

    #[tokio::test]
    async fn test_round_trip() -> Result<()> {
        let (_dir, repo_root, cache) = setup()?;
        let test_file = repo_root.join_component("test.txt");
        test_file.create_with_contents("test content")?;

        let files = vec![AnchoredSystemPathBuf::from_raw("test.txt")?];
        let hash = "0123456789abcdef";

        let miss = cache.fetch(&repo_root, hash).await?;
        assert!(miss.is_none());

        cache.put(&repo_root, hash, &files, 100).await?;

        // Restore into a fresh anchor to prove the archive carries the data
        let restore_dir = tempdir()?;
        let restore_root = AbsoluteSystemPathBuf::try_from(restore_dir.path())?;
        let (status, restored) = cache.fetch(&restore_root, hash).await?.unwrap();

        assert_eq!(
            status,
            CacheHitMetadata {
                source: CacheSource::Local,
                time_saved: 100
            }
        );
        assert_eq!(restored.len(), 1);
        let restored_path: &AnchoredSystemPath = &restored[0];
        assert_eq!(restored_path.as_str(), "test.txt");
        assert_eq!(
            restore_root.join_component("test.txt").read_to_string()?,
            "test content"
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_exists_reports_duration() -> Result<()> {
        let (_dir, repo_root, cache) = setup()?;
        let test_file = repo_root.join_component("out.txt");
        test_file.create_with_contents("output")?;
        let files = vec![AnchoredSystemPathBuf::from_raw("out.txt")?];

        assert!(cache.exists("feedfacefeedface").await?.is_none());
        cache.put(&repo_root, "feedfacefeedface", &files, 42).await?;
        assert_eq!(
            cache.exists("feedfacefeedface").await?,
            Some(CacheHitMetadata {
                source: CacheSource::Local,
                time_saved: 42
            })
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_corrupted_archive_is_a_miss() -> Result<()> {
        let (_dir, repo_root, cache) = setup()?;
        let test_file = repo_root.join_component("data.txt");
        test_file.create_with_contents("data")?;
        let files = vec![AnchoredSystemPathBuf::from_raw("data.txt")?];
        let hash = "cafed00dcafed00d";

        cache.put(&repo_root, hash, &files, 1).await?;

        // Swap the artifact for different bytes without touching the
        // metadata digest
        let archive_path = repo_root.join_components(&["cache", &format!("{hash}.tar.zst")]);
        let mut other_bytes = Vec::new();
        {
            let other_file = repo_root.join_component("other.txt");
            other_file.create_with_contents("other")?;
            let mut writer = CacheWriter::from_writer(&mut other_bytes, true)?;
            writer.add_file(&repo_root, AnchoredSystemPath::new("other.txt")?)?;
            writer.finish()?;
        }
        archive_path.create_with_contents(&other_bytes)?;

        assert!(cache.fetch(&repo_root, hash).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_clean_removes_stale_entries() -> Result<()> {
        let (_dir, repo_root, cache) = setup()?;
        let test_file = repo_root.join_component("out.txt");
        test_file.create_with_contents("output")?;
        let files = vec![AnchoredSystemPathBuf::from_raw("out.txt")?];
        cache.put(&repo_root, "abcd1234abcd1234", &files, 1).await?;

        // Fresh entries survive
        assert_eq!(cache.clean(std::time::Duration::from_secs(60))?, 0);
        assert!(cache.exists("abcd1234abcd1234").await?.is_some());

        // A zero threshold treats everything as stale
        assert!(cache.clean(std::time::Duration::ZERO)? >= 2);
        assert!(cache.exists("abcd1234abcd1234").await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_concurrent_writes_same_hash() -> Result<()> {
        let (_dir, repo_root, cache) = setup()?;
        let test_file = repo_root.join_component("test.txt");
        test_file.create_with_contents("test content")?;
        let files = vec![AnchoredSystemPathBuf::from_raw("test.txt")?];
        let hash = "feedbeeffeedbeef";

        let cache = std::sync::Arc::new(cache);
        let repo_root = std::sync::Arc::new(repo_root);
        let mut handles = Vec::new();
        for _ in 0..3 {
            let cache = cache.clone();
            let repo_root = repo_root.clone();
            let files = files.clone();
            handles.push(tokio::spawn(async move {
                cache.put(&repo_root, hash, &files, 100).await
            }));
        }
        for handle in handles {
            handle.await??;
        }

        assert!(cache.fetch(&repo_root, hash).await?.is_some());

        // No temp files left behind
        let cache_dir = repo_root.join_component("cache");
        let leftovers: Vec<_> = std::fs::read_dir(cache_dir.as_std_path())?
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty(), "orphaned temp files: {leftovers:?}");
        Ok(())
    }
}
