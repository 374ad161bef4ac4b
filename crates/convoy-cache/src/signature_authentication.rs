use std::env;

use base64::{prelude::BASE64_STANDARD, Engine};
use hmac::{Hmac, Mac};
use os_str_bytes::OsStringBytes;
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum SignatureError {
    #[error(
        "signature secret key not found. You must specify a secret key in the \
         CONVOY_REMOTE_CACHE_SIGNATURE_KEY environment variable"
    )]
    NoSignatureSecretKey,
    #[error("base64 encoding error: {0}")]
    Base64EncodingError(#[from] base64::DecodeError),
    #[error(transparent)]
    Hmac(#[from] hmac::digest::InvalidLength),
}

/// Signs and verifies remote artifacts with `HMAC-SHA256(key, hash ||
/// team_id || artifact_bytes)`. The key comes from the environment so it
/// never passes through configuration files.
#[derive(Debug)]
pub struct ArtifactSignatureAuthenticator {
    pub(crate) team_id: Vec<u8>,
    // Test override, avoiding env var races between tests
    pub(crate) secret_key_override: Option<Vec<u8>>,
}

impl ArtifactSignatureAuthenticator {
    pub fn new(team_id: Vec<u8>, secret_key_override: Option<Vec<u8>>) -> Self {
        Self {
            team_id,
            secret_key_override,
        }
    }

    // HMAC-SHA256 has no hard key length limit; keys over 64 bytes get
    // hashed down by the primitive itself.
    fn secret_key(&self) -> Result<Vec<u8>, SignatureError> {
        if let Some(secret_key) = &self.secret_key_override {
            return Ok(secret_key.to_vec());
        }

        Ok(env::var_os("CONVOY_REMOTE_CACHE_SIGNATURE_KEY")
            .ok_or(SignatureError::NoSignatureSecretKey)?
            .into_raw_vec())
    }

    fn construct_metadata(&self, hash: &[u8]) -> Vec<u8> {
        let mut metadata = hash.to_vec();
        metadata.extend_from_slice(&self.team_id);
        metadata
    }

    fn get_tag_generator(&self, hash: &[u8]) -> Result<HmacSha256, SignatureError> {
        let mut mac = HmacSha256::new_from_slice(&self.secret_key()?)?;
        mac.update(&self.construct_metadata(hash));
        Ok(mac)
    }

    /// The base64 tag attached to an uploaded artifact.
    #[tracing::instrument(skip_all)]
    pub fn generate_tag(
        &self,
        hash: &[u8],
        artifact_body: &[u8],
    ) -> Result<String, SignatureError> {
        let mut mac = self.get_tag_generator(hash)?;
        mac.update(artifact_body);
        Ok(BASE64_STANDARD.encode(mac.finalize().into_bytes()))
    }

    /// Constant-time verification of a downloaded artifact against its tag.
    #[tracing::instrument(skip_all)]
    pub fn validate(
        &self,
        hash: &[u8],
        artifact_body: &[u8],
        expected_tag: &str,
    ) -> Result<bool, SignatureError> {
        let mut mac = HmacSha256::new_from_slice(&self.secret_key()?)?;
        mac.update(&self.construct_metadata(hash));
        mac.update(artifact_body);

        let expected_bytes = BASE64_STANDARD.decode(expected_tag)?;
        Ok(mac.verify_slice(&expected_bytes).is_ok())
    }
}
