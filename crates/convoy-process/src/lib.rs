#![deny(clippy::all)]

//! Child process management.
//!
//! [`ProcessManager`] tracks every child spawned for a run so that
//! cancellation can fan out: a polite signal first, a grace period, then a
//! hard kill. [`Child`] wraps a `tokio` child with a monitor task owning
//! the process handle; handles are cheap to clone and every clone observes
//! the same exit.

mod child;
mod command;

pub use child::{Child, ChildExit, ShutdownStyle};
pub use command::Command;
use futures::future::join_all;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

/// The default time between the polite stop signal and the hard kill.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

struct ProcessManagerState {
    is_closing: bool,
    children: Vec<Child>,
}

/// Spawns children on behalf of the scheduler and owns shutdown fan-out.
#[derive(Clone)]
pub struct ProcessManager {
    state: Arc<Mutex<ProcessManagerState>>,
}

impl ProcessManager {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ProcessManagerState {
                is_closing: false,
                children: Vec::new(),
            })),
        }
    }

    /// Spawns a child. Returns `None` once the manager has begun closing;
    /// new work is refused during shutdown.
    pub fn spawn(
        &self,
        command: Command,
        stop_grace: Duration,
    ) -> Option<std::io::Result<Child>> {
        let mut state = self.state.lock().expect("process manager lock poisoned");
        if state.is_closing {
            return None;
        }
        let child = Child::spawn(command, ShutdownStyle::Graceful(stop_grace));
        if let Ok(child) = &child {
            state.children.push(child.clone());
        }
        Some(child)
    }

    /// Stops every tracked child: polite signal, grace, kill. New spawns
    /// are refused from this point on.
    pub async fn stop(&self) {
        let children = {
            let mut state = self.state.lock().expect("process manager lock poisoned");
            state.is_closing = true;
            state.children.drain(..).collect::<Vec<_>>()
        };

        debug!("stopping {} children", children.len());
        join_all(children.into_iter().map(|mut child| async move {
            child.stop().await;
        }))
        .await;
    }

    /// Waits for every tracked child to exit on its own. Used on the happy
    /// path where tasks have already finished or are persistent tasks being
    /// wound down.
    pub async fn close(&self) {
        let children = {
            let mut state = self.state.lock().expect("process manager lock poisoned");
            state.is_closing = true;
            state.children.drain(..).collect::<Vec<_>>()
        };

        join_all(children.into_iter().map(|mut child| async move {
            child.wait().await;
        }))
        .await;
    }

    pub fn is_closed(&self) -> bool {
        self.state
            .lock()
            .expect("process manager lock poisoned")
            .is_closing
    }
}

impl Default for ProcessManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sleep_command(seconds: u32) -> Command {
        let mut command = Command::new("sleep");
        command.args([seconds.to_string()]);
        command
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_and_wait() {
        let manager = ProcessManager::new();
        let mut child = manager
            .spawn(sleep_command(0), Duration::from_millis(100))
            .unwrap()
            .unwrap();
        let exit = child.wait().await;
        assert_eq!(exit, Some(ChildExit::Finished(Some(0))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_refuses_new_spawns() {
        let manager = ProcessManager::new();
        manager.stop().await;
        assert!(manager
            .spawn(sleep_command(1), Duration::from_millis(100))
            .is_none());
        assert!(manager.is_closed());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_terminates_children() {
        let manager = ProcessManager::new();
        let mut child = manager
            .spawn(sleep_command(60), Duration::from_millis(100))
            .unwrap()
            .unwrap();
        manager.stop().await;
        let exit = child.wait().await;
        assert!(matches!(
            exit,
            Some(ChildExit::Killed) | Some(ChildExit::Finished(_))
        ));
    }
}
