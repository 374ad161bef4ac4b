use std::{fmt::Display, io::Write};

use console::StyledObject;
use tracing::error;

use crate::ColorConfig;

/// Writes structured task messages (status lines, warnings, errors) with
/// the task's prefix applied.
pub struct PrefixedUI<W> {
    color_config: ColorConfig,
    output_prefix: Option<StyledObject<String>>,
    warn_prefix: Option<StyledObject<String>>,
    error_prefix: Option<StyledObject<String>>,
    out: W,
    err: W,
}

impl<W: Write> PrefixedUI<W> {
    pub fn new(color_config: ColorConfig, out: W, err: W) -> Self {
        Self {
            color_config,
            out,
            err,
            output_prefix: None,
            warn_prefix: None,
            error_prefix: None,
        }
    }

    pub fn with_output_prefix(mut self, output_prefix: StyledObject<String>) -> Self {
        self.output_prefix = Some(output_prefix);
        self
    }

    pub fn with_warn_prefix(mut self, warn_prefix: StyledObject<String>) -> Self {
        self.warn_prefix = Some(warn_prefix);
        self
    }

    pub fn with_error_prefix(mut self, error_prefix: StyledObject<String>) -> Self {
        self.error_prefix = Some(error_prefix);
        self
    }

    pub fn output(&mut self, message: impl Display) {
        self.write_line(message, Command::Output)
    }

    pub fn warn(&mut self, message: impl Display) {
        self.write_line(message, Command::Warn)
    }

    pub fn error(&mut self, message: impl Display) {
        self.write_line(message, Command::Error)
    }

    fn write_line(&mut self, message: impl Display, command: Command) {
        let prefix = match command {
            Command::Output => &self.output_prefix,
            Command::Warn => &self.warn_prefix,
            Command::Error => &self.error_prefix,
        }
        .as_ref()
        .map(|prefix| self.color_config.apply(prefix.clone()))
        .unwrap_or_default();

        let writer = match command {
            Command::Output => &mut self.out,
            Command::Warn | Command::Error => &mut self.err,
        };

        // Fallible terminal writes shouldn't take the run down
        if let Err(err) = writeln!(writer, "{prefix}{message}") {
            error!("cannot write to terminal: {err}");
        }
    }

    /// A raw writer that applies the output prefix to every line; used for
    /// replaying cached logs through the same formatting path.
    pub fn output_prefixed_writer(&mut self) -> PrefixedWriter<&mut W> {
        PrefixedWriter::new(
            self.color_config,
            self.output_prefix.clone().unwrap_or_else(|| {
                console::Style::new().apply_to(String::new())
            }),
            &mut self.out,
        )
    }
}

#[derive(Debug, Clone, Copy)]
enum Command {
    Output,
    Warn,
    Error,
}

/// A `Write` adapter that inserts a prefix at the start of every line.
/// Partial writes are tracked so a line split across multiple writes is
/// prefixed exactly once.
pub struct PrefixedWriter<W> {
    prefix: String,
    writer: W,
    at_line_start: bool,
}

impl<W: Write> PrefixedWriter<W> {
    pub fn new(
        color_config: ColorConfig,
        prefix: StyledObject<String>,
        writer: W,
    ) -> Self {
        Self {
            prefix: color_config.apply(prefix),
            writer,
            at_line_start: true,
        }
    }
}

impl<W: Write> Write for PrefixedWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        for chunk in buf.split_inclusive(|b| *b == b'\n') {
            if self.at_line_start && !self.prefix.is_empty() {
                self.writer.write_all(self.prefix.as_bytes())?;
            }
            self.writer.write_all(chunk)?;
            self.at_line_start = chunk.ends_with(b"\n");
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }
}
