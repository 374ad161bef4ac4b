//! The hashable input structures and their canonical encodings.
//!
//! Field order here is the public contract of every fingerprint: any
//! reordering, addition, or removal is a cache-busting breaking change and
//! must come with a bump of the global cache key. Do not add "just one more
//! field".

use std::collections::HashMap;

use convoy_engine::{EnvMode, TaskOutputs};
use convoy_env::EnvironmentVariablePairs;
use convoy_hash::{CanonicalEncoder, StableHash};
use convoypath::RelativeUnixPathBuf;

/// Everything that can change a single task's output.
#[derive(Debug)]
pub struct TaskHashable<'a> {
    // hashes
    pub(crate) global_hash: &'a str,
    pub(crate) task_dependency_hashes: Vec<String>,
    pub(crate) hash_of_files: &'a str,
    pub(crate) external_deps_hash: String,

    // task
    pub(crate) package_dir: RelativeUnixPathBuf,
    pub(crate) task: &'a str,
    pub(crate) outputs: TaskOutputs,
    pub(crate) pass_thru_args: &'a [String],

    // env
    pub(crate) env: &'a [String],
    pub(crate) resolved_env_vars: EnvironmentVariablePairs,
    pub(crate) pass_thru_env: Option<&'a [String]>,
    pub(crate) env_mode: EnvMode,
    pub(crate) dot_env: &'a [RelativeUnixPathBuf],
}

impl TaskHashable<'_> {
    pub fn calculate_task_hash(mut self) -> String {
        // In loose mode the child inherits everything anyway, so the
        // pass-through list cannot affect the output.
        if matches!(self.env_mode, EnvMode::Loose) {
            self.pass_thru_env = None;
        }
        self.hash()
    }
}

impl StableHash for TaskHashable<'_> {
    fn encode(&self, encoder: &mut CanonicalEncoder) {
        encoder.write_str(self.global_hash);
        encoder.write_str(self.package_dir.as_str());
        encoder.write_str(self.hash_of_files);
        encoder.write_str(&self.external_deps_hash);
        encoder.write_str(self.task);
        encoder.write_enum(self.env_mode.hash_code());

        // Outputs are serialized as the sorted inclusion and exclusion
        // sequences
        let mut inclusions = self.outputs.inclusions.clone();
        inclusions.sort();
        encoder.write_str_seq(inclusions.iter());
        let mut exclusions = self.outputs.exclusions.clone();
        exclusions.sort();
        encoder.write_str_seq(exclusions.iter());

        let mut task_dependency_hashes = self.task_dependency_hashes.clone();
        task_dependency_hashes.sort();
        encoder.write_str_seq(task_dependency_hashes.iter());

        // Argument order is significant; passed through as-is
        encoder.write_str_seq(self.pass_thru_args.iter());

        let mut env = self.env.to_vec();
        env.sort();
        encoder.write_str_seq(env.iter());

        encoder.write_option(self.pass_thru_env, |encoder, pass_thru_env| {
            let mut pass_thru_env = pass_thru_env.to_vec();
            pass_thru_env.sort();
            encoder.write_str_seq(pass_thru_env.iter());
        });

        // Declared order, not sorted: moving a dotenv file changes which
        // values win
        encoder.write_str_seq(self.dot_env.iter().map(|path| path.as_str()));

        let mut resolved_env_vars = self.resolved_env_vars.clone();
        resolved_env_vars.sort();
        encoder.write_str_seq(resolved_env_vars.iter());
    }
}

/// Repo-wide inputs common to every task in a run.
#[derive(Debug, Default)]
pub struct GlobalHashable {
    pub(crate) global_cache_key: String,
    pub(crate) global_file_hash_map: HashMap<RelativeUnixPathBuf, String>,
    pub(crate) root_external_deps_hash: String,
    pub(crate) env: Vec<String>,
    pub(crate) resolved_env_vars: EnvironmentVariablePairs,
    pub(crate) pass_through_env: Option<Vec<String>>,
    pub(crate) env_mode: EnvMode,
    pub(crate) framework_inference: bool,
    pub(crate) dot_env: Vec<RelativeUnixPathBuf>,
}

impl StableHash for GlobalHashable {
    fn encode(&self, encoder: &mut CanonicalEncoder) {
        encoder.write_str(&self.global_cache_key);

        let mut file_hashes: Vec<_> = self
            .global_file_hash_map
            .iter()
            .map(|(path, hash)| (path.as_str(), hash.as_str()))
            .collect();
        file_hashes.sort();
        encoder.write_sorted_map(file_hashes.into_iter());

        encoder.write_str(&self.root_external_deps_hash);

        let mut env = self.env.clone();
        env.sort();
        encoder.write_str_seq(env.iter());

        let mut resolved_env_vars = self.resolved_env_vars.clone();
        resolved_env_vars.sort();
        encoder.write_str_seq(resolved_env_vars.iter());

        encoder.write_option(self.pass_through_env.as_deref(), |encoder, vars| {
            let mut vars = vars.to_vec();
            vars.sort();
            encoder.write_str_seq(vars.iter());
        });

        encoder.write_enum(self.env_mode.hash_code());
        encoder.write_bool(self.framework_inference);

        encoder.write_str_seq(self.dot_env.iter().map(|path| path.as_str()));
    }
}

/// A package's file-hash map in hashable form.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
#[serde(transparent)]
pub struct FileHashes(pub HashMap<RelativeUnixPathBuf, String>);

impl StableHash for FileHashes {
    fn encode(&self, encoder: &mut CanonicalEncoder) {
        let mut entries: Vec<_> = self
            .0
            .iter()
            .map(|(path, hash)| (path.as_str(), hash.as_str()))
            .collect();
        entries.sort();
        encoder.write_sorted_map(entries.into_iter());
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn base_task_hashable() -> TaskHashable<'static> {
        TaskHashable {
            global_hash: "global_hash",
            task_dependency_hashes: vec!["dependency_hash".to_string()],
            hash_of_files: "hash_of_files",
            external_deps_hash: "external_deps_hash".to_string(),
            package_dir: RelativeUnixPathBuf::new("packages/util").unwrap(),
            task: "build",
            outputs: TaskOutputs {
                inclusions: vec!["dist/**".to_string()],
                exclusions: vec!["dist/cache/**".to_string()],
            },
            pass_thru_args: &[],
            env: &[],
            resolved_env_vars: vec![],
            pass_thru_env: None,
            env_mode: EnvMode::Strict,
            dot_env: &[],
        }
    }

    #[test]
    fn test_task_hash_is_deterministic() {
        assert_eq!(
            base_task_hashable().calculate_task_hash(),
            base_task_hashable().calculate_task_hash(),
        );
    }

    #[test]
    fn test_task_hash_shape() {
        let hash = base_task_hashable().calculate_task_hash();
        assert_eq!(hash.len(), 16);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_dependency_hash_order_does_not_matter() {
        let mut forward = base_task_hashable();
        forward.task_dependency_hashes = vec!["aaa".to_string(), "bbb".to_string()];
        let mut reverse = base_task_hashable();
        reverse.task_dependency_hashes = vec!["bbb".to_string(), "aaa".to_string()];
        assert_eq!(
            forward.calculate_task_hash(),
            reverse.calculate_task_hash()
        );
    }

    #[test]
    fn test_pass_through_args_order_matters() {
        let args_one = vec!["--flag".to_string(), "value".to_string()];
        let args_two = vec!["value".to_string(), "--flag".to_string()];
        let mut one = base_task_hashable();
        one.pass_thru_args = &args_one;
        let mut two = base_task_hashable();
        two.pass_thru_args = &args_two;
        assert_ne!(one.calculate_task_hash(), two.calculate_task_hash());
    }

    #[test]
    fn test_global_hash_changes_with_file() {
        let mut base = GlobalHashable {
            global_cache_key: "key".to_string(),
            ..Default::default()
        };
        let empty = base.hash();
        base.global_file_hash_map.insert(
            RelativeUnixPathBuf::new("convoy.json").unwrap(),
            "filehash".to_string(),
        );
        assert_ne!(empty, base.hash());
    }

    #[test]
    fn test_global_hash_none_pass_through_differs_from_empty() {
        let none = GlobalHashable {
            global_cache_key: "key".to_string(),
            pass_through_env: None,
            ..Default::default()
        };
        let empty = GlobalHashable {
            global_cache_key: "key".to_string(),
            pass_through_env: Some(vec![]),
            ..Default::default()
        };
        assert_ne!(none.hash(), empty.hash());
    }

    #[test]
    fn test_loose_mode_ignores_pass_through() {
        let vars = vec!["SECRET".to_string()];
        let mut with_pass_through = base_task_hashable();
        with_pass_through.env_mode = EnvMode::Loose;
        with_pass_through.pass_thru_env = Some(&vars);

        let mut without = base_task_hashable();
        without.env_mode = EnvMode::Loose;
        without.pass_thru_env = None;

        assert_eq!(
            with_pass_through.calculate_task_hash(),
            without.calculate_task_hash()
        );
    }

    #[test]
    fn test_file_hashes_order_resistant() {
        let mut a = HashMap::new();
        a.insert(RelativeUnixPathBuf::new("a").unwrap(), "1".to_string());
        a.insert(RelativeUnixPathBuf::new("b").unwrap(), "2".to_string());
        let mut b = HashMap::new();
        b.insert(RelativeUnixPathBuf::new("b").unwrap(), "2".to_string());
        b.insert(RelativeUnixPathBuf::new("a").unwrap(), "1".to_string());
        assert_eq!(FileHashes(a).hash(), FileHashes(b).hash());
    }
}
