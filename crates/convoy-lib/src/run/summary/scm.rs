use convoy_env::EnvironmentVariableMap;
use serde::Serialize;

/// Source-control state at the time of the run, as reported by the
/// environment. The core never shells out here; CI providers export these
/// and local runs simply leave them null.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScmState {
    #[serde(rename = "type")]
    pub scm_type: &'static str,
    pub sha: Option<String>,
    pub branch: Option<String>,
}

const SHA_VARS: [&str; 2] = ["CONVOY_SCM_SHA", "GITHUB_SHA"];
const BRANCH_VARS: [&str; 2] = ["CONVOY_SCM_BRANCH", "GITHUB_REF_NAME"];

impl ScmState {
    pub fn get(env_vars: &EnvironmentVariableMap) -> Self {
        let lookup = |names: &[&str]| {
            names
                .iter()
                .find_map(|name| env_vars.get(*name).filter(|v| !v.is_empty()).cloned())
        };
        ScmState {
            scm_type: "git",
            sha: lookup(&SHA_VARS),
            branch: lookup(&BRANCH_VARS),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn test_reads_from_env() {
        let mut map = HashMap::new();
        map.insert("CONVOY_SCM_SHA".to_string(), "abc123".to_string());
        map.insert("CONVOY_SCM_BRANCH".to_string(), "main".to_string());
        let state = ScmState::get(&EnvironmentVariableMap::from(map));
        assert_eq!(state.sha.as_deref(), Some("abc123"));
        assert_eq!(state.branch.as_deref(), Some("main"));
    }

    #[test]
    fn test_missing_vars_are_null() {
        let state = ScmState::get(&EnvironmentVariableMap::from(HashMap::new()));
        assert!(state.sha.is_none());
        assert!(state.branch.is_none());
    }
}
