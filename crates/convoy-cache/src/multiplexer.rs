use std::sync::atomic::{AtomicBool, Ordering};

use convoy_analytics::AnalyticsSender;
use convoy_api_client::{APIAuth, APIClient};
use convoypath::{AbsoluteSystemPath, AnchoredSystemPathBuf};
use tracing::{debug, warn};

use crate::{fs::FsCache, http::HttpCache, CacheError, CacheHitMetadata, CacheOpts};

/// The two-tier cache policy.
///
/// Reads try the filesystem tier, then the remote tier; a remote hit is
/// written through locally before returning so the next read is fast.
/// Writes land in the filesystem tier synchronously; remote uploads are the
/// caller's concern (see `AsyncCache`). Remote transport failures degrade
/// to local-only, never to a failed run.
pub struct CacheMultiplexer {
    fs: Option<FsCache>,
    http: Option<HttpCache>,
    // The remote tier can turn out to be disabled for this account at
    // runtime; after the first such response we stop asking.
    http_disabled: AtomicBool,
    http_reads_enabled: bool,
}

impl CacheMultiplexer {
    pub fn new(
        opts: &CacheOpts,
        repo_root: &AbsoluteSystemPath,
        api: Option<(APIClient, APIAuth)>,
        analytics_recorder: Option<AnalyticsSender>,
    ) -> Result<Self, CacheError> {
        let use_fs_cache = !opts.skip_filesystem;
        let use_http_cache = !opts.skip_remote;
        // These flags are not mutually exclusive, so it is possible to
        // configure yourself out of having a cache at all. Tell the user,
        // but don't fail the build over it.
        if !use_fs_cache && !use_http_cache {
            warn!("no caches are enabled");
        }

        let fs_cache = use_fs_cache
            .then(|| FsCache::new(&opts.cache_dir, repo_root, analytics_recorder.clone()))
            .transpose()?;

        let http_cache = use_http_cache
            .then(|| {
                api.map(|(client, auth)| {
                    HttpCache::new(
                        client,
                        opts,
                        repo_root.to_owned(),
                        auth,
                        analytics_recorder,
                    )
                })
            })
            .flatten();

        Ok(CacheMultiplexer {
            fs: fs_cache,
            http: http_cache,
            http_disabled: AtomicBool::new(false),
            http_reads_enabled: !opts.remote_cache_write_only,
        })
    }

    fn http(&self) -> Option<&HttpCache> {
        if self.http_disabled.load(Ordering::Relaxed) {
            return None;
        }
        self.http.as_ref()
    }

    fn disable_http(&self) {
        warn!("remote cache is disabled for this account, continuing with local cache only");
        self.http_disabled.store(true, Ordering::Relaxed);
    }

    pub async fn fetch(
        &self,
        anchor: &AbsoluteSystemPath,
        key: &str,
    ) -> Result<Option<(CacheHitMetadata, Vec<AnchoredSystemPathBuf>)>, CacheError> {
        if let Some(fs) = &self.fs {
            match fs.fetch(anchor, key).await {
                Ok(Some(hit)) => return Ok(Some(hit)),
                Ok(None) => {}
                // A broken local entry reads as a miss; the remote tier may
                // still have a good copy
                Err(err) => warn!("failed to read from local cache: {err}"),
            }
        }

        if let Some(http) = self.http().filter(|_| self.http_reads_enabled) {
            match http.fetch(key).await {
                Ok(Some((meta, files, body))) => {
                    // Write through so subsequent fetches stay local
                    if let Some(fs) = &self.fs {
                        if let Err(err) = fs.put_raw_archive(key, &body, meta.time_saved).await {
                            warn!("failed to write remote artifact to local cache: {err}");
                        }
                    }
                    return Ok(Some((meta, files)));
                }
                Ok(None) => {}
                Err(CacheError::InvalidTag) | Err(CacheError::ArtifactTagMissing) => {
                    // A bad signature is a miss, not an error; the task will
                    // re-run and overwrite the artifact
                    warn!("remote artifact for {key} failed signature verification, ignoring");
                }
                Err(CacheError::ApiClientError(err))
                    if matches!(*err, convoy_api_client::Error::CacheDisabled) =>
                {
                    self.disable_http();
                }
                Err(err) => {
                    debug!("failed to read from remote cache: {err}");
                }
            }
        }

        Ok(None)
    }

    pub async fn exists(&self, key: &str) -> Result<Option<CacheHitMetadata>, CacheError> {
        if let Some(fs) = &self.fs {
            if let Some(hit) = fs.exists(key).await? {
                return Ok(Some(hit));
            }
        }

        if let Some(http) = self.http().filter(|_| self.http_reads_enabled) {
            match http.exists(key).await {
                Ok(Some(hit)) => return Ok(Some(hit)),
                Ok(None) => {}
                Err(CacheError::ApiClientError(err))
                    if matches!(*err, convoy_api_client::Error::CacheDisabled) =>
                {
                    self.disable_http();
                }
                Err(err) => debug!("failed to probe remote cache: {err}"),
            }
        }

        Ok(None)
    }

    /// Synchronous local write; part of the task's critical path.
    pub async fn put_local(
        &self,
        anchor: &AbsoluteSystemPath,
        key: &str,
        files: &[AnchoredSystemPathBuf],
        duration: u64,
    ) -> Result<(), CacheError> {
        if let Some(fs) = &self.fs {
            fs.put(anchor, key, files, duration).await?;
        }
        Ok(())
    }

    /// Remote upload; runs on the background worker pool. Failures are
    /// logged, and a disabled-cache response turns the remote tier off for
    /// the rest of the run.
    pub async fn put_remote(
        &self,
        anchor: &AbsoluteSystemPath,
        key: &str,
        files: &[AnchoredSystemPathBuf],
        duration: u64,
    ) -> Result<(), CacheError> {
        let Some(http) = self.http() else {
            return Ok(());
        };

        match http.put(anchor, key, files, duration).await {
            Ok(()) => Ok(()),
            Err(CacheError::ApiClientError(err))
                if matches!(*err, convoy_api_client::Error::CacheDisabled) =>
            {
                self.disable_http();
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    pub fn has_remote(&self) -> bool {
        self.http().is_some()
    }
}
