use std::sync::{Arc, Mutex};

use convoy_graph_utils::Walker;
use convoy_task_id::TaskId;
use futures::{stream::FuturesUnordered, StreamExt};
use tokio::sync::{mpsc, oneshot, Semaphore};
use tracing::debug;

use crate::{Engine, TaskNode};

/// A unit of work handed to the visitor, paired with the callback the
/// visitor uses to report the outcome.
pub struct Message<T, U> {
    pub info: T,
    pub callback: oneshot::Sender<U>,
}

impl<T, U> Message<T, U> {
    pub fn new(info: T) -> (Self, oneshot::Receiver<U>) {
        let (callback, receiver) = oneshot::channel();
        (Self { info, callback }, receiver)
    }
}

type VisitorData = TaskId<'static>;
type VisitorResult = Result<(), StopExecution>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionOptions {
    parallel: bool,
    concurrency: usize,
}

impl ExecutionOptions {
    pub fn new(parallel: bool, concurrency: usize) -> Self {
        Self {
            parallel,
            concurrency,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExecuteError {
    #[error("Semaphore closed before all tasks finished")]
    Semaphore(#[from] tokio::sync::AcquireError),
    #[error("Engine visitor closed channel before walk finished")]
    Visitor,
}

impl From<mpsc::error::SendError<Message<VisitorData, VisitorResult>>> for ExecuteError {
    fn from(
        _: mpsc::error::SendError<Message<TaskId<'static>, Result<(), StopExecution>>>,
    ) -> Self {
        ExecuteError::Visitor
    }
}

/// Sentinel returned by a visitor to stop the scheduling of further tasks.
/// Tasks already running are unaffected.
#[derive(Debug, Clone, Copy)]
pub struct StopExecution;

impl Engine {
    /// Walks the task graph in dependency order, sending each ready task to
    /// the visitor while honoring the concurrency limit. A visitor callback
    /// returning `StopExecution` cancels the walk; a dropped callback counts
    /// as successful completion.
    pub async fn execute(
        self: Arc<Self>,
        options: ExecutionOptions,
        visitor: mpsc::Sender<Message<VisitorData, VisitorResult>>,
    ) -> Result<(), ExecuteError> {
        let ExecutionOptions {
            parallel,
            concurrency,
        } = options;
        let sema = Arc::new(Semaphore::new(concurrency));
        let mut tasks: FuturesUnordered<tokio::task::JoinHandle<Result<(), ExecuteError>>> =
            FuturesUnordered::new();

        let (walker, mut nodes) = Walker::walk(&self.task_graph);
        let walker = Arc::new(Mutex::new(walker));

        while let Some((node_id, done)) = nodes.recv().await {
            let visitor = visitor.clone();
            let sema = sema.clone();
            let walker = walker.clone();
            let this = self.clone();

            tasks.push(tokio::spawn(async move {
                let TaskNode::Task(task_id) = this
                    .task_graph
                    .node_weight(node_id)
                    .expect("walker yields indices from this graph")
                else {
                    // The root node has nothing to do
                    if done.send(()).is_err() {
                        debug!("walk done callback receiver dropped before root completed");
                    }
                    return Ok(());
                };

                // Acquire a permit unless the caller asked for unbounded
                // parallelism
                let _permit = match parallel {
                    false => Some(sema.acquire().await?),
                    true => None,
                };

                let (message, result) = Message::new(task_id.clone());
                visitor.send(message).await?;

                if let Err(StopExecution) = result.await.unwrap_or_else(|_| {
                    // A dropped callback means the task finished
                    tracing::trace!("visitor dropped callback sender without sending result");
                    Ok(())
                }) {
                    if walker
                        .lock()
                        .expect("walker lock poisoned")
                        .cancel()
                        .is_err()
                    {
                        debug!("unable to cancel graph walk");
                    }
                }
                if done.send(()).is_err() {
                    debug!("walk done receiver dropped before node finished");
                }
                Ok(())
            }));
        }

        while let Some(res) = tasks.next().await {
            res.expect("unable to join task")?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::{Building, TaskDefinition};

    fn two_level_engine() -> Engine {
        // app#build and docs#build both depend on util#build
        let mut engine: Engine<Building> = Engine::new();
        let util = TaskId::new("util", "build").into_owned();
        let app = TaskId::new("app", "build").into_owned();
        let docs = TaskId::new("docs", "build").into_owned();

        for id in [&util, &app, &docs] {
            engine.get_index(id);
            engine.add_definition(id.clone(), TaskDefinition::default());
        }
        let util_index = engine.get_index(&util);
        let app_index = engine.get_index(&app);
        let docs_index = engine.get_index(&docs);
        engine.task_graph_mut().add_edge(app_index, util_index, ());
        engine
            .task_graph_mut()
            .add_edge(docs_index, util_index, ());
        engine.connect_to_root(&util);
        engine.seal()
    }

    #[tokio::test]
    async fn test_execute_serial_is_deterministic() {
        let engine = Arc::new(two_level_engine());
        let (tx, mut rx) = mpsc::channel(1);

        let execute = tokio::spawn(engine.execute(ExecutionOptions::new(false, 1), tx));

        let mut order = Vec::new();
        while let Some(Message { info, callback }) = rx.recv().await {
            order.push(info.to_string());
            callback.send(Ok(())).unwrap();
        }
        execute.await.unwrap().unwrap();

        assert_eq!(order, vec!["util#build", "app#build", "docs#build"]);
    }

    #[tokio::test]
    async fn test_stop_execution_prevents_new_tasks() {
        let engine = Arc::new(two_level_engine());
        let (tx, mut rx) = mpsc::channel(1);

        let execute = tokio::spawn(engine.execute(ExecutionOptions::new(false, 1), tx));

        let mut visited: HashMap<String, ()> = HashMap::new();
        while let Some(Message { info, callback }) = rx.recv().await {
            visited.insert(info.to_string(), ());
            // Fail the first task; nothing downstream should be scheduled
            callback.send(Err(StopExecution)).unwrap();
        }
        execute.await.unwrap().unwrap();

        assert_eq!(visited.len(), 1);
        assert!(visited.contains_key("util#build"));
    }
}
