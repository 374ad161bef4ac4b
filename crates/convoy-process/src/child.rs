use std::{sync::Arc, time::Duration};

use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::Command as TokioCommand,
    sync::{mpsc, watch, Mutex},
};
use tracing::debug;

use crate::Command;

/// How a stop request escalates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownStyle {
    /// Polite signal, then a hard kill after the grace period.
    Graceful(Duration),
    Kill,
}

/// The terminal state of a child process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildExit {
    Finished(Option<i32>),
    /// Killed by this process after a stop request.
    Killed,
    /// Terminated by something outside of our control.
    KilledExternal,
    Failed,
}

#[derive(Debug)]
enum ChildCommand {
    Stop,
    Kill,
}

/// A handle on a spawned child. The process itself is owned by a monitor
/// task; handles only carry channels, so they clone freely and every clone
/// observes the same exit status.
#[derive(Clone, Debug)]
pub struct Child {
    pid: Option<u32>,
    command_channel: mpsc::Sender<ChildCommand>,
    exit_channel: watch::Receiver<Option<ChildExit>>,
    stdout: Arc<Mutex<Option<tokio::process::ChildStdout>>>,
    stderr: Arc<Mutex<Option<tokio::process::ChildStderr>>>,
    label: String,
}

impl Child {
    /// Spawns the command and a monitor task that owns the process handle,
    /// translating stop requests into the configured shutdown style.
    pub fn spawn(command: Command, shutdown_style: ShutdownStyle) -> std::io::Result<Self> {
        let label = command.label();
        let mut builder: TokioCommand = command.into();
        builder.kill_on_drop(true);

        let mut child = builder.spawn()?;
        let pid = child.id();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let (command_tx, mut command_rx) = mpsc::channel::<ChildCommand>(1);
        let (exit_tx, exit_rx) = watch::channel(None);

        tokio::spawn(async move {
            let exit = tokio::select! {
                status = child.wait() => translate_status(status),
                command = command_rx.recv() => {
                    match command {
                        Some(ChildCommand::Stop) => match shutdown_style {
                            ShutdownStyle::Graceful(grace) => {
                                graceful_shutdown(&mut child, grace).await
                            }
                            ShutdownStyle::Kill => kill_child(&mut child).await,
                        },
                        Some(ChildCommand::Kill) | None => kill_child(&mut child).await,
                    }
                }
            };
            // Receivers may be gone if nobody is waiting; that's fine
            exit_tx.send(Some(exit)).ok();
        });

        Ok(Self {
            pid,
            command_channel: command_tx,
            exit_channel: exit_rx,
            stdout: Arc::new(Mutex::new(stdout)),
            stderr: Arc::new(Mutex::new(stderr)),
            label,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Waits for the child to reach a terminal state. `None` means the
    /// monitor task disappeared without reporting, which should not happen.
    pub async fn wait(&mut self) -> Option<ChildExit> {
        let mut exit = self.exit_channel.clone();
        loop {
            if let Some(status) = *exit.borrow() {
                return Some(status);
            }
            if exit.changed().await.is_err() {
                return *exit.borrow();
            }
        }
    }

    /// Requests a stop (polite signal + grace + kill) and waits for the
    /// exit.
    pub async fn stop(&mut self) -> Option<ChildExit> {
        // An error means the monitor already exited, so the child is done
        if self.command_channel.send(ChildCommand::Stop).await.is_err() {
            debug!("child {} already exited before stop", self.label);
        }
        self.wait().await
    }

    /// Immediate kill, no grace.
    pub async fn kill(&mut self) -> Option<ChildExit> {
        if self.command_channel.send(ChildCommand::Kill).await.is_err() {
            debug!("child {} already exited before kill", self.label);
        }
        self.wait().await
    }

    /// Copies the child's stdout and stderr into the provided writers,
    /// line-buffered, then waits for exit. Carriage-return progress bars
    /// are treated as line terminators so they stream promptly.
    pub async fn wait_with_piped_outputs<W: std::io::Write>(
        &mut self,
        mut stdout_writer: W,
        mut stderr_writer: W,
    ) -> Result<Option<ChildExit>, std::io::Error> {
        let stdout = self.stdout.lock().await.take();
        let stderr = self.stderr.lock().await.take();

        let stdout_fut = pipe_lines(stdout, &mut stdout_writer);
        let stderr_fut = pipe_lines(stderr, &mut stderr_writer);

        let (stdout_result, stderr_result) = tokio::join!(stdout_fut, stderr_fut);
        stdout_result?;
        stderr_result?;

        Ok(self.wait().await)
    }
}

async fn pipe_lines<R, W>(reader: Option<R>, writer: &mut W) -> Result<(), std::io::Error>
where
    R: tokio::io::AsyncRead + Unpin,
    W: std::io::Write,
{
    let Some(reader) = reader else {
        return Ok(());
    };
    let mut reader = BufReader::new(reader);
    let mut buffer = Vec::new();
    loop {
        buffer.clear();
        let read = reader.read_until(b'\n', &mut buffer).await?;
        if read == 0 {
            break;
        }
        writer.write_all(&buffer)?;
    }
    writer.flush()?;
    Ok(())
}

fn translate_status(status: std::io::Result<std::process::ExitStatus>) -> ChildExit {
    match status {
        Ok(status) => match status.code() {
            Some(code) => ChildExit::Finished(Some(code)),
            // No exit code means an external signal took the process down
            None => ChildExit::KilledExternal,
        },
        Err(_) => ChildExit::Failed,
    }
}

async fn graceful_shutdown(child: &mut tokio::process::Child, grace: Duration) -> ChildExit {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            // SIGINT matches what the task would receive from a ctrl-c in
            // an interactive shell
            unsafe {
                libc::kill(pid as i32, libc::SIGINT);
            }
        } else {
            return kill_child(child).await;
        }

        match tokio::time::timeout(grace, child.wait()).await {
            Ok(status) => {
                let exit = translate_status(status);
                // The polite signal worked, but the stop was still ours
                match exit {
                    ChildExit::Finished(_) | ChildExit::KilledExternal => ChildExit::Killed,
                    other => other,
                }
            }
            Err(_) => kill_child(child).await,
        }
    }
    #[cfg(not(unix))]
    {
        let _ = grace;
        kill_child(child).await
    }
}

async fn kill_child(child: &mut tokio::process::Child) -> ChildExit {
    match child.kill().await {
        Ok(()) => ChildExit::Killed,
        Err(_) => ChildExit::Failed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    fn shell(script: &str) -> Command {
        let mut command = Command::new("sh");
        command.args(["-c", script]);
        command
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exit_code() {
        let mut child = Child::spawn(shell("exit 3"), ShutdownStyle::Kill).unwrap();
        assert_eq!(child.wait().await, Some(ChildExit::Finished(Some(3))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_piped_outputs() {
        let mut child = Child::spawn(
            shell("echo out; echo err >&2"),
            ShutdownStyle::Kill,
        )
        .unwrap();
        let mut out = Vec::new();
        let mut err = Vec::new();
        let exit = child
            .wait_with_piped_outputs(&mut out, &mut err)
            .await
            .unwrap();
        assert_eq!(exit, Some(ChildExit::Finished(Some(0))));
        assert_eq!(out, b"out\n");
        assert_eq!(err, b"err\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_kills_stubborn_child() {
        // The trap swallows SIGINT, forcing the kill path
        let mut child = Child::spawn(
            shell("trap '' INT; sleep 60"),
            ShutdownStyle::Graceful(Duration::from_millis(50)),
        )
        .unwrap();
        // Give the shell a beat to install the trap
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(child.stop().await, Some(ChildExit::Killed));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_clones_observe_same_exit() {
        let mut child = Child::spawn(shell("exit 0"), ShutdownStyle::Kill).unwrap();
        let mut clone = child.clone();
        assert_eq!(child.wait().await, Some(ChildExit::Finished(Some(0))));
        assert_eq!(clone.wait().await, Some(ChildExit::Finished(Some(0))));
    }
}
