#![deny(clippy::all)]

//! Terminal output plumbing: color configuration, per-task prefixes, and
//! the sink/client pair that keeps interleaved or grouped task output
//! coherent.

mod color_selector;
mod output;
mod prefixed;

pub use color_selector::ColorSelector;
use console::{Style, StyledObject};
use convoypath::AbsoluteSystemPath;
pub use output::{OutputClient, OutputClientBehavior, OutputSink, OutputWriter};
pub use prefixed::{PrefixedUI, PrefixedWriter};
use thiserror::Error;

pub use console::Style as UiStyle;

#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot read logs: {0}")]
    CannotReadLogs(#[source] std::io::Error),
    #[error("cannot write logs: {0}")]
    CannotWriteLogs(#[source] std::io::Error),
}

/// Whether and how much styling lands in the output stream. Decided once by
/// the caller (tty detection, `CI`, `TERM`); everything downstream just
/// applies it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColorConfig {
    pub should_strip_ansi: bool,
}

impl ColorConfig {
    pub fn new(should_strip_ansi: bool) -> Self {
        Self { should_strip_ansi }
    }

    /// Infers color support from the environment. `CI` keeps color,
    /// `TERM=dumb` drops it.
    pub fn infer() -> Self {
        let dumb_term = std::env::var("TERM").is_ok_and(|term| term == "dumb");
        Self {
            should_strip_ansi: dumb_term,
        }
    }

    pub fn apply(&self, styled: StyledObject<impl std::fmt::Display>) -> String {
        if self.should_strip_ansi {
            styled.force_styling(false).to_string()
        } else {
            styled.to_string()
        }
    }
}

pub fn bold() -> Style {
    Style::new().bold()
}

pub fn bold_green() -> Style {
    Style::new().green().bold()
}

pub fn bold_red() -> Style {
    Style::new().red().bold()
}

pub fn yellow() -> Style {
    Style::new().yellow()
}

pub fn grey() -> Style {
    Style::new().dim()
}

/// Replays a task's captured log file into `writer`, byte for byte. The
/// log file holds exactly what the task wrote; prefixing, if any, comes
/// from the writer.
pub fn replay_logs<W: std::io::Write>(
    mut writer: W,
    log_file: &AbsoluteSystemPath,
) -> Result<(), Error> {
    let bytes = log_file.read().map_err(|err| match err {
        convoypath::PathError::IO(io) => Error::CannotReadLogs(io),
        other => Error::CannotReadLogs(std::io::Error::new(
            std::io::ErrorKind::Other,
            other.to_string(),
        )),
    })?;
    writer.write_all(&bytes).map_err(Error::CannotWriteLogs)?;
    writer.flush().map_err(Error::CannotWriteLogs)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use convoypath::AbsoluteSystemPathBuf;

    use super::*;

    #[test]
    fn test_replay_logs_byte_exact() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let root = AbsoluteSystemPathBuf::try_from(dir.path())?;
        let log_file = root.join_component("convoy-build.log");
        log_file.create_with_contents(b"line one\nline two\n")?;

        let mut replayed = Vec::new();
        replay_logs(&mut replayed, &log_file)?;
        assert_eq!(replayed, b"line one\nline two\n");
        Ok(())
    }

    #[test]
    fn test_replay_missing_log_errors() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let root = AbsoluteSystemPathBuf::try_from(dir.path())?;
        let log_file = root.join_component("absent.log");

        let mut replayed = Vec::new();
        assert!(replay_logs(&mut replayed, &log_file).is_err());
        Ok(())
    }

    #[test]
    fn test_color_config_strip() {
        let config = ColorConfig::new(true);
        let styled = console::Style::new().red().force_styling(true).apply_to("x");
        assert_eq!(config.apply(styled), "x");
    }
}
