use std::{sync::Arc, time::Duration};

use convoy_analytics::AnalyticsSender;
use convoy_api_client::{APIAuth, APIClient};
use convoypath::{AbsoluteSystemPath, AbsoluteSystemPathBuf, AnchoredSystemPathBuf};
use futures::{stream::FuturesUnordered, StreamExt};
use tokio::sync::{mpsc, oneshot, Semaphore};
use tracing::warn;

use crate::{multiplexer::CacheMultiplexer, CacheError, CacheHitMetadata, CacheOpts};

const WORKER_QUEUE_DEPTH: usize = 64;

enum WorkerRequest {
    Upload {
        anchor: AbsoluteSystemPathBuf,
        key: String,
        files: Vec<AnchoredSystemPathBuf>,
        duration: u64,
    },
    Flush(oneshot::Sender<()>),
}

/// The cache handle the scheduler talks to.
///
/// Reads go straight through to the multiplexer. Writes land in the local
/// tier synchronously and queue a remote upload onto a bounded worker pool;
/// a full queue backpressures the caller rather than buffering without
/// limit.
pub struct AsyncCache {
    real_cache: Arc<CacheMultiplexer>,
    writer_sender: mpsc::Sender<WorkerRequest>,
    remote_writes_enabled: bool,
}

impl AsyncCache {
    pub fn new(
        opts: &CacheOpts,
        repo_root: &AbsoluteSystemPath,
        api: Option<(APIClient, APIAuth)>,
        analytics_recorder: Option<AnalyticsSender>,
    ) -> Result<AsyncCache, CacheError> {
        let max_workers = opts.workers.max(1) as usize;
        let remote_writes_enabled = !opts.remote_cache_read_only;
        let real_cache = Arc::new(CacheMultiplexer::new(
            opts,
            repo_root,
            api,
            analytics_recorder,
        )?);

        let (writer_sender, mut write_consumer) =
            mpsc::channel::<WorkerRequest>(WORKER_QUEUE_DEPTH);

        let worker_cache = real_cache.clone();
        tokio::spawn(async move {
            let semaphore = Arc::new(Semaphore::new(max_workers));
            let mut workers = FuturesUnordered::new();

            loop {
                tokio::select! {
                    request = write_consumer.recv() => {
                        match request {
                            Some(WorkerRequest::Upload { anchor, key, files, duration }) => {
                                let permit = semaphore
                                    .clone()
                                    .acquire_owned()
                                    .await
                                    .expect("upload semaphore closed while workers are running");
                                let cache = worker_cache.clone();
                                workers.push(tokio::spawn(async move {
                                    if let Err(err) =
                                        cache.put_remote(&anchor, &key, &files, duration).await
                                    {
                                        warn!("failed to upload {key} to remote cache: {err}");
                                    }
                                    drop(permit);
                                }));
                            }
                            Some(WorkerRequest::Flush(done)) => {
                                while let Some(result) = workers.next().await {
                                    if result.is_err() {
                                        warn!("remote cache upload worker panicked");
                                    }
                                }
                                done.send(()).ok();
                            }
                            // All senders dropped; drain and exit
                            None => break,
                        }
                    }
                    Some(result) = workers.next(), if !workers.is_empty() => {
                        if result.is_err() {
                            warn!("remote cache upload worker panicked");
                        }
                    }
                }
            }

            while let Some(result) = workers.next().await {
                if result.is_err() {
                    warn!("remote cache upload worker panicked");
                }
            }
        });

        Ok(AsyncCache {
            real_cache,
            writer_sender,
            remote_writes_enabled,
        })
    }

    pub async fn fetch(
        &self,
        anchor: &AbsoluteSystemPath,
        key: &str,
    ) -> Result<Option<(CacheHitMetadata, Vec<AnchoredSystemPathBuf>)>, CacheError> {
        self.real_cache.fetch(anchor, key).await
    }

    pub async fn exists(&self, key: &str) -> Result<Option<CacheHitMetadata>, CacheError> {
        self.real_cache.exists(key).await
    }

    /// Stores a new entry: local write now, remote upload queued.
    pub async fn put(
        &self,
        anchor: AbsoluteSystemPathBuf,
        key: String,
        files: Vec<AnchoredSystemPathBuf>,
        duration: u64,
    ) -> Result<(), CacheError> {
        self.real_cache
            .put_local(&anchor, &key, &files, duration)
            .await?;

        if self.remote_writes_enabled && self.real_cache.has_remote() {
            self.writer_sender
                .send(WorkerRequest::Upload {
                    anchor,
                    key,
                    files,
                    duration,
                })
                .await
                .map_err(|_| CacheError::CacheShuttingDown)?;
        }

        Ok(())
    }

    /// Waits for every queued upload to finish, up to `grace`. Uploads that
    /// have not started within the window are abandoned.
    pub async fn wait_for_uploads(&self, grace: Duration) {
        let (done_sender, done) = oneshot::channel();
        if self
            .writer_sender
            .send(WorkerRequest::Flush(done_sender))
            .await
            .is_err()
        {
            return;
        }
        if tokio::time::timeout(grace, done).await.is_err() {
            warn!("timed out waiting for remote cache uploads; some artifacts were not uploaded");
        }
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use camino::Utf8PathBuf;
    use tempfile::tempdir;

    use super::*;

    fn local_only_opts() -> CacheOpts {
        CacheOpts {
            cache_dir: Utf8PathBuf::from("cache"),
            workers: 2,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_local_round_trip_without_remote() -> Result<()> {
        let repo_root = tempdir()?;
        let repo_root_path = AbsoluteSystemPathBuf::try_from(repo_root.path())?;
        repo_root_path
            .join_component("out.txt")
            .create_with_contents(b"output")?;

        let cache = AsyncCache::new(&local_only_opts(), &repo_root_path, None, None)?;

        let files = vec![AnchoredSystemPathBuf::from_raw("out.txt")?];
        cache
            .put(repo_root_path.clone(), "abc123abc123abc1".to_string(), files, 7)
            .await?;

        let hit = cache.fetch(&repo_root_path, "abc123abc123abc1").await?;
        assert!(hit.is_some());
        let (meta, restored) = hit.unwrap();
        assert_eq!(meta.time_saved, 7);
        assert_eq!(restored.len(), 1);

        cache.wait_for_uploads(Duration::from_millis(100)).await;
        Ok(())
    }

    #[tokio::test]
    async fn test_miss_is_none() -> Result<()> {
        let repo_root = tempdir()?;
        let repo_root_path = AbsoluteSystemPathBuf::try_from(repo_root.path())?;
        let cache = AsyncCache::new(&local_only_opts(), &repo_root_path, None, None)?;
        assert!(cache.fetch(&repo_root_path, "0000000000000000").await?.is_none());
        assert!(cache.exists("0000000000000000").await?.is_none());
        Ok(())
    }
}
