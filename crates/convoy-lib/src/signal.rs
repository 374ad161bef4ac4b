use std::{
    fmt::Debug,
    future::Future,
    sync::{Arc, Mutex},
};

use futures::{stream::FuturesUnordered, StreamExt};
use tokio::sync::{mpsc, oneshot};

/// Fans a termination signal out to registered subscribers and waits for
/// each of them to finish its cleanup.
///
/// Components subscribe while they have in-flight work worth protecting;
/// the guard a subscriber receives on `listen` is how it tells the handler
/// it is done unwinding.
#[derive(Debug, Clone)]
pub struct SignalHandler {
    state: Arc<Mutex<HandlerState>>,
    close: mpsc::Sender<()>,
}

#[derive(Debug, Default)]
struct HandlerState {
    subscribers: Vec<oneshot::Sender<oneshot::Sender<()>>>,
    is_closing: bool,
}

pub struct SignalSubscriber(oneshot::Receiver<oneshot::Sender<()>>);

/// Held by a subscriber while it processes the signal; dropping it reports
/// completion.
pub struct SubscriberGuard(#[allow(dead_code)] oneshot::Sender<()>);

impl SignalHandler {
    /// Constructs a handler that alerts subscribers when `signal_source`
    /// completes or `close` is called, whichever happens first.
    pub fn new(signal_source: impl Future<Output = Option<()>> + Send + 'static) -> Self {
        let state = Arc::new(Mutex::new(HandlerState::default()));
        let worker_state = state.clone();
        let (close, mut rx) = mpsc::channel::<()>(1);
        tokio::spawn(async move {
            tokio::select! {
                // Whether we got a signal or lost the ability to receive
                // them, shut down either way.
                _ = signal_source => {},
                // Same story for an explicit close or all handles dropping.
                _ = rx.recv() => {}
            }

            let mut callbacks = {
                let mut state = worker_state.lock().expect("signal handler lock poisoned");
                // Refuse new subscribers from this point on
                state.is_closing = true;
                state
                    .subscribers
                    .drain(..)
                    .rev()
                    .filter_map(|callback| {
                        let (tx, rx) = oneshot::channel();
                        // A subscriber that went away has nothing to clean up
                        callback.send(tx).ok()?;
                        Some(rx)
                    })
                    .collect::<FuturesUnordered<_>>()
            };

            // Dropped guards and explicit completions look the same here
            while let Some(_result) = callbacks.next().await {}
        });

        Self { state, close }
    }

    /// A handler with no signal source; only an explicit `close` triggers
    /// it. Useful for tests and for embedding in larger programs that do
    /// their own signal handling.
    pub fn without_signal_source() -> Self {
        Self::new(std::future::pending())
    }

    /// Registers a subscriber. `None` once shutdown has begun.
    pub fn subscribe(&self) -> Option<SignalSubscriber> {
        self.state
            .lock()
            .expect("signal handler lock poisoned")
            .add_subscriber()
            .map(SignalSubscriber)
    }

    /// Starts the shutdown and waits for every subscriber to finish.
    pub async fn close(&self) {
        if self.close.send(()).await.is_err() {
            // The worker already shut down
            return;
        }
        self.done().await;
    }

    /// Waits until the handler is finished and subscribers have unwound.
    pub async fn done(&self) {
        // The worker owns the receiver; it closing means the worker is done
        self.close.closed().await;
    }

    #[cfg(test)]
    fn is_done(&self) -> bool {
        self.close.is_closed()
    }
}

impl SignalSubscriber {
    /// Resolves when the signal fires. The returned guard must be held for
    /// the duration of cleanup.
    pub async fn listen(self) -> SubscriberGuard {
        let callback = self
            .0
            .await
            .expect("signal handler worker exited without alerting subscribers");
        SubscriberGuard(callback)
    }
}

impl HandlerState {
    fn add_subscriber(&mut self) -> Option<oneshot::Receiver<oneshot::Sender<()>>> {
        (!self.is_closing).then(|| {
            let (tx, rx) = oneshot::channel();
            self.subscribers.push(tx);
            rx
        })
    }
}

/// The process signal stream the run subscribes to: SIGINT and SIGTERM on
/// unix, ctrl-c elsewhere.
pub async fn get_signal() -> Result<impl Future<Output = Option<()>>, std::io::Error> {
    #[cfg(unix)]
    {
        use tokio::signal::unix;
        let mut sigint = unix::signal(unix::SignalKind::interrupt())?;
        let mut sigterm = unix::signal(unix::SignalKind::terminate())?;
        Ok(async move {
            tokio::select! {
                result = sigint.recv() => result,
                result = sigterm.recv() => result,
            }
        })
    }
    #[cfg(not(unix))]
    {
        Ok(async move { tokio::signal::ctrl_c().await.ok() })
    }
}
