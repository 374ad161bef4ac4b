use convoy_analytics::AnalyticsSender;
use convoy_api_client::{
    analytics::{self, AnalyticsEvent},
    duration_from_response, APIAuth, APIClient, TAG_HEADER,
};
use convoypath::{AbsoluteSystemPath, AbsoluteSystemPathBuf, AnchoredSystemPathBuf};
use tracing::debug;

use crate::{
    cache_archive::{CacheReader, CacheWriter},
    signature_authentication::ArtifactSignatureAuthenticator,
    CacheError, CacheHitMetadata, CacheOpts, CacheSource,
};

/// The remote cache tier. Archives are built in memory, optionally signed,
/// and shipped over HTTP; fetched artifacts are verified before a single
/// byte is restored.
pub struct HttpCache {
    client: APIClient,
    signer_verifier: Option<ArtifactSignatureAuthenticator>,
    repo_root: AbsoluteSystemPathBuf,
    api_auth: APIAuth,
    analytics_recorder: Option<AnalyticsSender>,
}

impl HttpCache {
    pub fn new(
        client: APIClient,
        opts: &CacheOpts,
        repo_root: AbsoluteSystemPathBuf,
        api_auth: APIAuth,
        analytics_recorder: Option<AnalyticsSender>,
    ) -> HttpCache {
        let signer_verifier = opts
            .remote_cache_opts
            .as_ref()
            .is_some_and(|remote_cache_opts| remote_cache_opts.signature())
            .then(|| {
                ArtifactSignatureAuthenticator::new(
                    api_auth
                        .team_id
                        .as_deref()
                        .unwrap_or_default()
                        .as_bytes()
                        .to_vec(),
                    None,
                )
            });

        HttpCache {
            client,
            signer_verifier,
            repo_root,
            api_auth,
            analytics_recorder,
        }
    }

    #[tracing::instrument(skip_all, fields(hash = hash))]
    pub async fn put(
        &self,
        anchor: &AbsoluteSystemPath,
        hash: &str,
        files: &[AnchoredSystemPathBuf],
        duration: u64,
    ) -> Result<(), CacheError> {
        let mut artifact_body = Vec::new();
        {
            let mut cache_archive = CacheWriter::from_writer(&mut artifact_body, true)?;
            for file in files {
                cache_archive.add_file(anchor, file)?;
            }
            cache_archive.finish()?;
        }

        let tag = self
            .signer_verifier
            .as_ref()
            .map(|signer| signer.generate_tag(hash.as_bytes(), &artifact_body))
            .transpose()?;

        debug!("uploading {hash}");
        self.client
            .put_artifact(hash, artifact_body, duration, tag.as_deref(), &self.api_auth)
            .await?;
        debug!("uploaded {hash}");

        Ok(())
    }

    pub async fn exists(&self, hash: &str) -> Result<Option<CacheHitMetadata>, CacheError> {
        let Some(response) = self.client.artifact_exists(hash, &self.api_auth).await? else {
            return Ok(None);
        };

        let duration = duration_from_response(&response)?;

        Ok(Some(CacheHitMetadata {
            source: CacheSource::Remote,
            time_saved: duration,
        }))
    }

    fn log_fetch(&self, event: analytics::CacheEvent, hash: &str, duration: u64) {
        // Analytics never fail the cache
        if let Some(analytics_recorder) = &self.analytics_recorder {
            let analytics_event = AnalyticsEvent {
                session_id: None,
                source: analytics::CacheSource::Remote,
                event,
                hash: hash.to_string(),
                duration,
            };
            let _ = analytics_recorder.send(analytics_event);
        }
    }

    /// Downloads, verifies, and restores the artifact for `hash`. On a hit
    /// the raw archive bytes are returned alongside the restored paths so
    /// the caller can write the entry through to the local tier.
    #[tracing::instrument(skip_all, fields(hash = hash))]
    pub async fn fetch(
        &self,
        hash: &str,
    ) -> Result<Option<(CacheHitMetadata, Vec<AnchoredSystemPathBuf>, Vec<u8>)>, CacheError> {
        let Some(response) = self.client.fetch_artifact(hash, &self.api_auth).await? else {
            self.log_fetch(analytics::CacheEvent::Miss, hash, 0);
            return Ok(None);
        };

        let duration = duration_from_response(&response)?;

        let expected_tag = response
            .headers()
            .get(TAG_HEADER)
            .and_then(|tag| tag.to_str().ok())
            .map(|tag| tag.to_string());

        let body = response
            .bytes()
            .await
            .map_err(convoy_api_client::Error::from)?;

        if let Some(signer_verifier) = &self.signer_verifier {
            let expected_tag = expected_tag.ok_or(CacheError::ArtifactTagMissing)?;
            let is_valid = signer_verifier.validate(hash.as_bytes(), &body, &expected_tag)?;
            if !is_valid {
                return Err(CacheError::InvalidTag);
            }
        }

        let mut cache_reader = CacheReader::from_reader(&body[..], true)?;
        let restored_files = cache_reader.restore(&self.repo_root)?;

        self.log_fetch(analytics::CacheEvent::Hit, hash, duration);

        Ok(Some((
            CacheHitMetadata {
                source: CacheSource::Remote,
                time_saved: duration,
            },
            restored_files,
            body.to_vec(),
        )))
    }
}
