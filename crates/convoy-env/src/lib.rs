#![deny(clippy::all)]

//! Environment variable resolution for hashing and child process
//! construction.

use std::{
    collections::HashMap,
    env,
    ops::{Deref, DerefMut},
};

use regex::Regex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Clone, Debug, Error)]
pub enum Error {
    #[error("Failed to parse regex: {0}")]
    Regex(#[from] regex::Error),
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct EnvironmentVariableMap(HashMap<String, String>);

/// A list of `NAME=value-digest` strings, sorted by name.
pub type EnvironmentVariablePairs = Vec<String>;

// BySource separates the vars of a DetailedMap by how they were selected.
#[derive(Debug, Serialize)]
pub struct BySource {
    pub explicit: EnvironmentVariableMap,
    pub matching: EnvironmentVariableMap,
}

// DetailedMap contains the composite and the detailed maps of environment
// variables. `all` is the hash input; `by_source` feeds run summaries.
#[derive(Debug, Serialize)]
pub struct DetailedMap {
    pub all: EnvironmentVariableMap,
    pub by_source: BySource,
}

/// A pair of inclusion/exclusion maps produced from wildcard patterns.
#[derive(Debug)]
pub struct WildcardMaps {
    pub inclusions: EnvironmentVariableMap,
    pub exclusions: EnvironmentVariableMap,
}

impl WildcardMaps {
    fn resolve(self) -> EnvironmentVariableMap {
        let mut output = self.inclusions;
        output.difference(&self.exclusions);
        output
    }
}

impl From<HashMap<String, String>> for EnvironmentVariableMap {
    fn from(map: HashMap<String, String>) -> Self {
        EnvironmentVariableMap(map)
    }
}

impl Deref for EnvironmentVariableMap {
    type Target = HashMap<String, String>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for EnvironmentVariableMap {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl EnvironmentVariableMap {
    /// Snapshot of the current process environment.
    pub fn infer() -> Self {
        EnvironmentVariableMap(env::vars().collect())
    }

    pub fn into_inner(self) -> HashMap<String, String> {
        self.0
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.keys().cloned().collect();
        names.sort();
        names
    }

    /// Sorted `NAME=value` pairs. Not for hashing; use
    /// [`Self::to_secret_hashable`] so raw values never reach a fingerprint.
    pub fn to_hashable(&self) -> EnvironmentVariablePairs {
        let mut pairs: Vec<_> = self.iter().map(|(k, v)| format!("{k}={v}")).collect();
        pairs.sort();
        pairs
    }

    /// Sorted `NAME=sha256(value)` pairs. An empty value still hashes; a
    /// variable that is declared but absent from the map serializes as
    /// `NAME=` at the call site, keeping unset distinct from set-to-empty.
    pub fn to_secret_hashable(&self) -> EnvironmentVariablePairs {
        let mut pairs: Vec<_> = self
            .iter()
            .map(|(k, v)| {
                let mut hasher = Sha256::new();
                hasher.update(v.as_bytes());
                format!("{k}={}", hex::encode(hasher.finalize()))
            })
            .collect();
        pairs.sort();
        pairs
    }

    // Adds `another` into `self`, overwriting existing values.
    pub fn union(&mut self, another: &EnvironmentVariableMap) {
        for (key, value) in &another.0 {
            self.0.insert(key.clone(), value.clone());
        }
    }

    // Removes keys of `another` from `self`.
    pub fn difference(&mut self, another: &EnvironmentVariableMap) {
        for key in another.0.keys() {
            self.0.remove(key);
        }
    }

    fn wildcard_map_from_wildcards(
        &self,
        wildcard_patterns: &[impl AsRef<str>],
    ) -> Result<WildcardMaps, Error> {
        let mut output = WildcardMaps {
            inclusions: EnvironmentVariableMap::default(),
            exclusions: EnvironmentVariableMap::default(),
        };

        let mut include_patterns = Vec::new();
        let mut exclude_patterns = Vec::new();

        for wildcard_pattern in wildcard_patterns {
            let wildcard_pattern = wildcard_pattern.as_ref();
            if let Some(rest) = wildcard_pattern.strip_prefix('!') {
                exclude_patterns.push(wildcard_to_regex_pattern(rest));
            } else if let Some(rest) = wildcard_pattern.strip_prefix("\\!") {
                // Escaped leading bang is a literal
                include_patterns.push(wildcard_to_regex_pattern(&format!("!{rest}")));
            } else {
                include_patterns.push(wildcard_to_regex_pattern(wildcard_pattern));
            }
        }

        let include_regex = Regex::new(&format!("^({})$", include_patterns.join("|")))?;
        let exclude_regex = Regex::new(&format!("^({})$", exclude_patterns.join("|")))?;
        for (env_var, env_value) in &self.0 {
            if !include_patterns.is_empty() && include_regex.is_match(env_var) {
                output.inclusions.insert(env_var.clone(), env_value.clone());
            }
            if !exclude_patterns.is_empty() && exclude_regex.is_match(env_var) {
                output.exclusions.insert(env_var.clone(), env_value.clone());
            }
        }

        Ok(output)
    }

    /// The variables of this map matching an array of wildcard patterns,
    /// with `!`-prefixed exclusions applied.
    pub fn from_wildcards(
        &self,
        wildcard_patterns: &[impl AsRef<str>],
    ) -> Result<EnvironmentVariableMap, Error> {
        if wildcard_patterns.is_empty() {
            return Ok(EnvironmentVariableMap::default());
        }

        let resolved_set = self.wildcard_map_from_wildcards(wildcard_patterns)?;
        Ok(resolved_set.resolve())
    }

    /// Like [`Self::from_wildcards`] but keeps inclusions and exclusions
    /// apart so user exclusions keep primacy over inferred inclusions.
    pub fn wildcard_map_from_wildcards_unresolved(
        &self,
        wildcard_patterns: &[impl AsRef<str>],
    ) -> Result<WildcardMaps, Error> {
        if wildcard_patterns.is_empty() {
            return Ok(WildcardMaps {
                inclusions: EnvironmentVariableMap::default(),
                exclusions: EnvironmentVariableMap::default(),
            });
        }

        self.wildcard_map_from_wildcards(wildcard_patterns)
    }
}

const WILDCARD: char = '*';
const WILDCARD_ESCAPE: char = '\\';
const REGEX_WILDCARD_SEGMENT: &str = ".*";

fn wildcard_to_regex_pattern(pattern: &str) -> String {
    let mut regex_string = Vec::new();
    let mut previous_index = 0;
    let mut previous_char: Option<char> = None;

    for (i, char) in pattern.chars().enumerate() {
        if char == WILDCARD {
            if previous_char == Some(WILDCARD_ESCAPE) {
                // Literal `*`: replace the trailing `\*` with just `*`.
                regex_string.push(regex::escape(&format!(
                    "{}*",
                    &pattern[previous_index..(i - 1)]
                )));
            } else {
                regex_string.push(regex::escape(&pattern[previous_index..i]));
                // Collapse adjacent dynamic segments
                if regex_string.last().map(String::as_str) != Some(REGEX_WILDCARD_SEGMENT) {
                    regex_string.push(REGEX_WILDCARD_SEGMENT.to_string());
                }
            }
            previous_index = i + 1;
        }
        previous_char = Some(char);
    }

    regex_string.push(regex::escape(&pattern[previous_index..]));
    regex_string.join("")
}

/// Expands declared env names (wildcards allowed) into the sorted
/// `NAME=sha256(value)` pairs that feed a fingerprint. Declared-but-unset
/// names serialize as `NAME=`, so unset and set-to-empty stay distinct.
pub fn hashable_env_pairs(
    env_at_execution_start: &EnvironmentVariableMap,
    declared: &[impl AsRef<str>],
) -> Result<EnvironmentVariablePairs, Error> {
    let resolved = env_at_execution_start.from_wildcards(declared)?;
    let mut pairs = resolved.to_secret_hashable();
    for name in declared {
        let name = name.as_ref();
        if name.contains(WILDCARD) || name.starts_with('!') {
            continue;
        }
        if !resolved.contains_key(name) {
            pairs.push(format!("{name}="));
        }
    }
    pairs.sort();
    pairs.dedup();
    Ok(pairs)
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    fn test_map() -> EnvironmentVariableMap {
        let mut map = HashMap::new();
        map.insert("NEXT_PUBLIC_API".to_string(), "https://api".to_string());
        map.insert("NEXT_PUBLIC_KEY".to_string(), "abc".to_string());
        map.insert("NODE_ENV".to_string(), "production".to_string());
        map.insert("SECRET".to_string(), "hunter2".to_string());
        EnvironmentVariableMap::from(map)
    }

    #[test_case("LITERAL_\\*", "LITERAL_\\*" ; "literal star")]
    #[test_case("\\*LEADING", "\\*LEADING" ; "leading literal star")]
    #[test_case("*LEADING", ".*LEADING" ; "leading star")]
    #[test_case("NEXT_PUBLIC_*", "NEXT_PUBLIC_.*" ; "trailing star")]
    #[test_case("A**B", "A.*B" ; "adjacent stars collapse")]
    fn test_wildcard_to_regex_pattern(pattern: &str, expected: &str) {
        assert_eq!(wildcard_to_regex_pattern(pattern), expected);
    }

    #[test]
    fn test_from_wildcards() {
        let map = test_map();
        let resolved = map.from_wildcards(&["NEXT_PUBLIC_*"]).unwrap();
        assert_eq!(resolved.names(), vec!["NEXT_PUBLIC_API", "NEXT_PUBLIC_KEY"]);
    }

    #[test]
    fn test_exclusions_win() {
        let map = test_map();
        let resolved = map
            .from_wildcards(&["NEXT_PUBLIC_*", "!NEXT_PUBLIC_KEY"])
            .unwrap();
        assert_eq!(resolved.names(), vec!["NEXT_PUBLIC_API"]);
    }

    #[test]
    fn test_secret_hashable_hides_values() {
        let map = test_map();
        for pair in map.to_secret_hashable() {
            assert!(!pair.contains("hunter2"));
            assert!(!pair.contains("production"));
        }
    }

    #[test]
    fn test_hashable_pairs_missing_markers() {
        let map = test_map();
        let pairs = hashable_env_pairs(&map, &["NODE_ENV", "UNSET_VAR"]).unwrap();
        assert_eq!(pairs.len(), 2);
        assert!(pairs.iter().any(|p| p == "UNSET_VAR="));
        assert!(pairs.iter().any(|p| p.starts_with("NODE_ENV=") && p.len() > "NODE_ENV=".len()));
    }

    #[test]
    fn test_unset_differs_from_empty() {
        let mut with_empty = test_map();
        with_empty.insert("MAYBE".to_string(), String::new());
        let without = test_map();

        let set_to_empty = hashable_env_pairs(&with_empty, &["MAYBE"]).unwrap();
        let unset = hashable_env_pairs(&without, &["MAYBE"]).unwrap();
        assert_ne!(set_to_empty, unset);
    }

    #[test]
    fn test_union_difference() {
        let mut base = test_map();
        let mut other = EnvironmentVariableMap::default();
        other.insert("EXTRA".to_string(), "1".to_string());
        base.union(&other);
        assert!(base.contains_key("EXTRA"));
        base.difference(&other);
        assert!(!base.contains_key("EXTRA"));
    }
}
