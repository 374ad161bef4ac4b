use std::collections::{BinaryHeap, HashMap};

use futures::{stream::FuturesUnordered, StreamExt};
use petgraph::{graph::NodeIndex, Direction, Graph};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::trace;

/// A node handed out by the walker together with the callback the consumer
/// must fire (or drop) once the node has terminated.
pub type WalkMessage = (NodeIndex, oneshot::Sender<()>);

/// Walks a dependency graph in topological order, releasing a node only
/// after every node it points at (its dependencies, following `Outgoing`
/// edges) has been marked done.
///
/// Ready nodes are emitted in ascending node-weight order so a consumer that
/// processes one node at a time observes a deterministic total order.
pub struct Walker {
    cancel: watch::Sender<bool>,
}

#[derive(Debug, thiserror::Error)]
#[error("walk has already finished")]
pub struct CancelError;

impl Walker {
    /// Starts the walk. Returns the control handle and the stream of ready
    /// nodes. Dropping a message's done callback counts as completion.
    pub fn walk<N: Ord, E>(graph: &Graph<N, E>) -> (Walker, mpsc::UnboundedReceiver<WalkMessage>) {
        let (node_tx, node_rx) = mpsc::unbounded_channel();
        let (cancel, mut cancel_rx) = watch::channel(false);

        // Emission order within a wave follows node weights.
        let mut order: Vec<NodeIndex> = graph.node_indices().collect();
        order.sort_by(|a, b| graph[*a].cmp(&graph[*b]));
        let rank: HashMap<NodeIndex, usize> =
            order.iter().enumerate().map(|(i, idx)| (*idx, i)).collect();

        let mut deps_remaining: HashMap<NodeIndex, usize> = HashMap::new();
        let mut dependents: HashMap<NodeIndex, Vec<NodeIndex>> = HashMap::new();
        for index in graph.node_indices() {
            let count = graph.neighbors_directed(index, Direction::Outgoing).count();
            deps_remaining.insert(index, count);
            for dependency in graph.neighbors_directed(index, Direction::Outgoing) {
                dependents.entry(dependency).or_default().push(index);
            }
        }

        let mut ready: BinaryHeap<std::cmp::Reverse<(usize, NodeIndex)>> = deps_remaining
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(index, _)| std::cmp::Reverse((rank[index], *index)))
            .collect();

        tokio::spawn(async move {
            let mut in_flight: FuturesUnordered<_> = FuturesUnordered::new();
            let mut cancelled = false;

            loop {
                if !cancelled {
                    while let Some(std::cmp::Reverse((_, index))) = ready.pop() {
                        let (done_tx, done_rx) = oneshot::channel();
                        if node_tx.send((index, done_tx)).is_err() {
                            // Receiver gone; stop issuing work
                            cancelled = true;
                            break;
                        }
                        in_flight.push(async move {
                            // A dropped callback still counts as done
                            done_rx.await.ok();
                            index
                        });
                    }
                }

                if in_flight.is_empty() {
                    break;
                }

                tokio::select! {
                    Some(index) = in_flight.next() => {
                        trace!("node {index:?} finished");
                        for dependent in dependents.get(&index).map(Vec::as_slice).unwrap_or_default() {
                            let count = deps_remaining
                                .get_mut(dependent)
                                .expect("dependent was registered");
                            *count -= 1;
                            if *count == 0 {
                                ready.push(std::cmp::Reverse((rank[dependent], *dependent)));
                            }
                        }
                    }
                    result = cancel_rx.changed(), if !cancelled => {
                        if result.is_err() || *cancel_rx.borrow() {
                            trace!("walk cancelled; draining in-flight nodes");
                            cancelled = true;
                        }
                    }
                }
            }
        });

        (Walker { cancel }, node_rx)
    }

    /// Stops the emission of new nodes. Nodes already handed out are still
    /// awaited by the walk task.
    pub fn cancel(&mut self) -> Result<(), CancelError> {
        self.cancel.send(true).map_err(|_| CancelError)
    }
}
