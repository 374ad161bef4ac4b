use std::collections::HashMap;

use convoy_engine::EnvMode;
use convoy_env::{EnvironmentVariableMap, EnvironmentVariablePairs};
use convoy_hash::StableHash;
use convoy_scm::SCM;
use convoypath::{AbsoluteSystemPath, AnchoredSystemPath, RelativeUnixPathBuf};
use tracing::debug;

use crate::hash::GlobalHashable;

/// Versioned constant salting every fingerprint. Bumping it invalidates
/// every cache entry ever written; that is the escape hatch for hash-schema
/// changes.
pub const GLOBAL_CACHE_KEY: &str = "A convoy moves at the speed of its slowest ship";

/// Additional operator-supplied salt.
pub const GLOBAL_HASH_SALT_VAR: &str = "CONVOY_HASH_SALT";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Scm(#[from] convoy_scm::Error),
    #[error(transparent)]
    Env(#[from] convoy_env::Error),
    #[error(transparent)]
    Path(#[from] convoypath::PathError),
}

/// The resolved repo-wide hash inputs, kept around after hashing because
/// the run summary reports them.
#[derive(Debug, Default)]
pub struct GlobalHashableInputs {
    pub global_cache_key: String,
    pub global_file_hash_map: HashMap<RelativeUnixPathBuf, String>,
    pub root_external_deps_hash: String,
    /// Declared global env names.
    pub env: Vec<String>,
    /// Sorted `NAME=sha256(value)` pairs the declarations resolved to.
    pub resolved_env_vars: EnvironmentVariablePairs,
    pub pass_through_env: Option<Vec<String>>,
    pub env_mode: EnvMode,
    pub framework_inference: bool,
    pub dot_env: Vec<RelativeUnixPathBuf>,
}

#[allow(clippy::too_many_arguments)]
pub fn get_global_hash_inputs(
    repo_root: &AbsoluteSystemPath,
    scm: &SCM,
    root_external_deps_hash: String,
    global_file_dependencies: &[String],
    env_at_execution_start: &EnvironmentVariableMap,
    global_env: Vec<String>,
    global_pass_through_env: Option<Vec<String>>,
    env_mode: EnvMode,
    framework_inference: bool,
    dot_env: Vec<RelativeUnixPathBuf>,
) -> Result<GlobalHashableInputs, Error> {
    let root = AnchoredSystemPath::new("").expect("empty path is anchored");
    let mut global_file_hash_map =
        scm.get_file_hashes_matching_globs(repo_root, root, global_file_dependencies)?;

    if !dot_env.is_empty() {
        let dot_env_hashes = scm.hash_existing_of(
            repo_root,
            dot_env.iter().map(|path| path.to_system_path_buf()),
        )?;
        global_file_hash_map.extend(dot_env_hashes);
    }

    let resolved_env_vars =
        convoy_env::hashable_env_pairs(env_at_execution_start, &global_env)?;

    let global_cache_key = match env_at_execution_start.get(GLOBAL_HASH_SALT_VAR) {
        Some(salt) if !salt.is_empty() => format!("{GLOBAL_CACHE_KEY}::{salt}"),
        _ => GLOBAL_CACHE_KEY.to_string(),
    };

    Ok(GlobalHashableInputs {
        global_cache_key,
        global_file_hash_map,
        root_external_deps_hash,
        env: global_env,
        resolved_env_vars,
        pass_through_env: global_pass_through_env,
        env_mode,
        framework_inference,
        dot_env,
    })
}

impl GlobalHashableInputs {
    pub fn calculate_global_hash(&self) -> String {
        let hashable = GlobalHashable {
            global_cache_key: self.global_cache_key.clone(),
            global_file_hash_map: self.global_file_hash_map.clone(),
            root_external_deps_hash: self.root_external_deps_hash.clone(),
            env: self.env.clone(),
            resolved_env_vars: self.resolved_env_vars.clone(),
            pass_through_env: self.pass_through_env.clone(),
            env_mode: self.env_mode,
            framework_inference: self.framework_inference,
            dot_env: self.dot_env.clone(),
        };
        let hash = hashable.hash();
        debug!("global hash: {hash}");
        hash
    }
}
