use std::{
    collections::HashMap,
    ffi::{OsStr, OsString},
};

use convoypath::AbsoluteSystemPathBuf;

/// A process invocation under construction. The environment is explicit:
/// nothing is inherited unless the caller copied it in, which is what makes
/// strict env mode enforceable.
#[derive(Debug, Clone)]
pub struct Command {
    program: OsString,
    args: Vec<OsString>,
    cwd: Option<AbsoluteSystemPathBuf>,
    env: HashMap<OsString, OsString>,
    open_stdin: bool,
}

impl Command {
    pub fn new(program: impl AsRef<OsStr>) -> Self {
        Self {
            program: program.as_ref().to_os_string(),
            args: Vec::new(),
            cwd: None,
            env: HashMap::new(),
            open_stdin: false,
        }
    }

    pub fn args(&mut self, args: impl IntoIterator<Item = impl AsRef<OsStr>>) -> &mut Self {
        self.args = args
            .into_iter()
            .map(|arg| arg.as_ref().to_os_string())
            .collect();
        self
    }

    pub fn current_dir(&mut self, dir: AbsoluteSystemPathBuf) -> &mut Self {
        self.cwd = Some(dir);
        self
    }

    pub fn envs(
        &mut self,
        vars: impl IntoIterator<Item = (impl AsRef<OsStr>, impl AsRef<OsStr>)>,
    ) -> &mut Self {
        self.env.extend(
            vars.into_iter()
                .map(|(k, v)| (k.as_ref().to_os_string(), v.as_ref().to_os_string())),
        );
        self
    }

    /// Interactive tasks inherit the parent's stdin; everything else gets a
    /// closed one.
    pub fn open_stdin(&mut self) -> &mut Self {
        self.open_stdin = true;
        self
    }

    pub fn will_open_stdin(&self) -> bool {
        self.open_stdin
    }

    pub fn label(&self) -> String {
        format!(
            "({}) {} {}",
            self.cwd
                .as_ref()
                .map(|cwd| cwd.as_str())
                .unwrap_or_default(),
            self.program.to_string_lossy(),
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy())
                .collect::<Vec<_>>()
                .join(" ")
        )
    }
}

impl From<Command> for tokio::process::Command {
    fn from(value: Command) -> Self {
        let Command {
            program,
            args,
            cwd,
            env,
            open_stdin,
        } = value;

        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args)
            // The environment is fully specified by the caller
            .env_clear()
            .envs(env)
            .stdin(if open_stdin {
                std::process::Stdio::inherit()
            } else {
                std::process::Stdio::null()
            })
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());
        if let Some(cwd) = cwd {
            cmd.current_dir(cwd.as_std_path());
        }
        cmd
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label() {
        let mut command = Command::new("npm");
        command.args(["run", "build"]);
        assert_eq!(command.label(), "() npm run build");
    }
}
