use std::fmt;

use chrono::{DateTime, Duration, Local};
use convoy_task_id::TaskId;
use serde::{ser::SerializeStruct, Serialize, Serializer};
use tokio::sync::mpsc;

fn serialize_datetime<S: Serializer>(
    date_time: &DateTime<Local>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_i64(date_time.timestamp_millis())
}

fn serialize_optional_datetime<S: Serializer>(
    date_time: &Option<DateTime<Local>>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    let millis = date_time
        .map(|dt| dt.timestamp_millis())
        .unwrap_or_default();
    serializer.serialize_i64(millis)
}

/// The run-wide execution tally, serialized into the run summary.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSummary {
    pub command: String,
    pub success: usize,
    pub failed: usize,
    pub cached: usize,
    pub attempted: usize,
    #[serde(serialize_with = "serialize_datetime")]
    pub start_time: DateTime<Local>,
    #[serde(serialize_with = "serialize_optional_datetime")]
    pub end_time: Option<DateTime<Local>>,
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub interrupted: bool,
}

/// Counts task outcomes as they arrive from trackers. One actor owns the
/// counters; producers send events through a channel, which keeps the tally
/// consistent without a lock on the task hot path.
pub struct ExecutionTracker {
    state_thread: tokio::task::JoinHandle<SummaryState>,
    sender: mpsc::Sender<Event>,
    start_time: DateTime<Local>,
}

/// The final states of all task executions.
#[derive(Debug, Default, Clone, Copy)]
pub struct SummaryState {
    pub attempted: usize,
    pub failed: usize,
    pub cached: usize,
    pub success: usize,
}

impl SummaryState {
    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Building => self.attempted += 1,
            Event::BuildFailed => self.failed += 1,
            Event::Cached => self.cached += 1,
            Event::Built => self.success += 1,
        }
    }
}

/// Created per task; reports the task's lifecycle back to the tally.
pub struct TaskTracker<T> {
    sender: mpsc::Sender<Event>,
    started_at: T,
    task_id: TaskId<'static>,
}

#[derive(Debug, Clone, Copy, Serialize)]
enum Event {
    Building,
    BuildFailed,
    Cached,
    Built,
}

/// The terminal state of one task execution.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum ExecutionState {
    Canceled,
    Built { exit_code: i32 },
    Cached,
    BuildFailed { exit_code: Option<i32>, err: String },
    Skipped { reason: SkipReason },
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SkipReason {
    UpstreamFailed,
}

#[derive(Debug, Clone)]
pub struct TaskExecutionSummary {
    pub started_at: DateTime<Local>,
    pub ended_at: DateTime<Local>,
    pub state: ExecutionState,
}

impl Serialize for TaskExecutionSummary {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("TaskExecutionSummary", 3)?;
        state.serialize_field("startedAt", &self.started_at.timestamp_millis())?;
        state.serialize_field("endedAt", &self.ended_at.timestamp_millis())?;
        state.serialize_field("execution", &self.state)?;
        state.end()
    }
}

impl TaskExecutionSummary {
    pub fn exit_code(&self) -> Option<i32> {
        match &self.state {
            ExecutionState::BuildFailed { exit_code, .. } => *exit_code,
            ExecutionState::Built { exit_code } => Some(*exit_code),
            _ => None,
        }
    }

    pub fn duration(&self) -> Duration {
        self.ended_at.signed_duration_since(self.started_at)
    }
}

impl ExecutionTracker {
    pub fn new(start_time: DateTime<Local>) -> Self {
        // Messages are one byte; a generous buffer means trackers never
        // block on the tally.
        let (sender, mut receiver) = mpsc::channel(128);
        let state_thread = tokio::spawn(async move {
            let mut state = SummaryState::default();
            while let Some(event) = receiver.recv().await {
                state.handle_event(event);
            }
            state
        });

        Self {
            state_thread,
            sender,
            start_time,
        }
    }

    pub fn start_time(&self) -> DateTime<Local> {
        self.start_time
    }

    pub fn tracker(&self, task_id: TaskId<'static>) -> TaskTracker<()> {
        TaskTracker {
            sender: self.sender.clone(),
            task_id,
            started_at: (),
        }
    }

    pub async fn finish(self) -> Result<SummaryState, tokio::task::JoinError> {
        let Self {
            state_thread,
            sender,
            ..
        } = self;
        // Dropping the sender closes the channel once the last in-flight
        // tracker finishes; an explicit close would race them.
        drop(sender);

        state_thread.await
    }
}

impl TaskTracker<()> {
    pub async fn start(self) -> TaskTracker<DateTime<Local>> {
        let TaskTracker {
            sender, task_id, ..
        } = self;
        let started_at = Local::now();
        sender
            .send(Event::Building)
            .await
            .expect("execution tracker channel closed during run");
        TaskTracker {
            sender,
            started_at,
            task_id,
        }
    }

    /// A task skipped because something upstream failed never starts; it
    /// still counts as attempted.
    pub async fn skipped(self) -> TaskExecutionSummary {
        let now = Local::now();
        self.sender
            .send(Event::Building)
            .await
            .expect("execution tracker channel closed during run");
        TaskExecutionSummary {
            started_at: now,
            ended_at: now,
            state: ExecutionState::Skipped {
                reason: SkipReason::UpstreamFailed,
            },
        }
    }

    pub fn task_id(&self) -> &TaskId<'static> {
        &self.task_id
    }
}

impl TaskTracker<DateTime<Local>> {
    /// Milliseconds since the task started; recorded as the entry's
    /// duration when the outputs are cached.
    pub fn elapsed_ms(&self) -> u64 {
        Local::now()
            .signed_duration_since(self.started_at)
            .num_milliseconds()
            .max(0) as u64
    }

    pub fn cancel(self) -> TaskExecutionSummary {
        let Self { started_at, .. } = self;
        TaskExecutionSummary {
            started_at,
            ended_at: Local::now(),
            state: ExecutionState::Canceled,
        }
    }

    pub async fn cached(self) -> TaskExecutionSummary {
        let Self {
            sender, started_at, ..
        } = self;
        sender
            .send(Event::Cached)
            .await
            .expect("execution tracker channel closed during run");

        TaskExecutionSummary {
            started_at,
            ended_at: Local::now(),
            state: ExecutionState::Cached,
        }
    }

    pub async fn build_succeeded(self, exit_code: i32) -> TaskExecutionSummary {
        let Self {
            sender, started_at, ..
        } = self;
        sender
            .send(Event::Built)
            .await
            .expect("execution tracker channel closed during run");
        TaskExecutionSummary {
            started_at,
            ended_at: Local::now(),
            state: ExecutionState::Built { exit_code },
        }
    }

    pub async fn build_failed(
        self,
        exit_code: Option<i32>,
        error: impl fmt::Display,
    ) -> TaskExecutionSummary {
        let Self {
            sender, started_at, ..
        } = self;
        sender
            .send(Event::BuildFailed)
            .await
            .expect("execution tracker channel closed during run");
        TaskExecutionSummary {
            started_at,
            ended_at: Local::now(),
            state: ExecutionState::BuildFailed {
                exit_code,
                err: error.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tally_across_tasks() {
        let tracker = ExecutionTracker::new(Local::now());
        let mut tasks = Vec::new();
        {
            let task = tracker.tracker(TaskId::new("foo", "build").into_owned());
            tasks.push(tokio::spawn(async move {
                let task = task.start().await;
                let summary = task.build_succeeded(0).await;
                assert_eq!(summary.exit_code(), Some(0));
            }));
        }
        {
            let task = tracker.tracker(TaskId::new("bar", "build").into_owned());
            tasks.push(tokio::spawn(async move {
                let task = task.start().await;
                let summary = task.cached().await;
                assert_eq!(summary.exit_code(), None);
            }));
        }
        {
            let task = tracker.tracker(TaskId::new("baz", "build").into_owned());
            tasks.push(tokio::spawn(async move {
                let task = task.start().await;
                let summary = task.build_failed(Some(1), "big bad error").await;
                assert_eq!(summary.exit_code(), Some(1));
            }));
        }
        {
            let task = tracker.tracker(TaskId::new("boo", "build").into_owned());
            tasks.push(tokio::spawn(async move {
                let task = task.start().await;
                let summary = task.cancel();
                assert_eq!(summary.exit_code(), None);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        let state = tracker.finish().await.unwrap();
        assert_eq!(state.attempted, 4);
        assert_eq!(state.cached, 1);
        assert_eq!(state.failed, 1);
        assert_eq!(state.success, 1);
    }

    #[tokio::test]
    async fn test_skipped_counts_as_attempted() {
        let tracker = ExecutionTracker::new(Local::now());
        let task = tracker.tracker(TaskId::new("foo", "build").into_owned());
        let summary = task.skipped().await;
        assert!(matches!(summary.state, ExecutionState::Skipped { .. }));

        let state = tracker.finish().await.unwrap();
        assert_eq!(state.attempted, 1);
        assert_eq!(state.success, 0);
        assert_eq!(state.failed, 0);
    }

    #[tokio::test]
    async fn test_timing() {
        let tracker = ExecutionTracker::new(Local::now());
        let task = tracker.tracker(TaskId::new("foo", "build").into_owned());
        let post_construction_time = Local::now();
        let sleep_duration = Duration::milliseconds(5);
        tokio::time::sleep(sleep_duration.to_std().unwrap()).await;

        let task = task.start().await;

        tokio::time::sleep(sleep_duration.to_std().unwrap()).await;
        let summary = task.build_succeeded(0).await;
        assert!(
            post_construction_time < summary.started_at,
            "tracking starts when start is called"
        );
        assert!(
            sleep_duration <= summary.duration(),
            "duration should cover the time between calls"
        );
    }
}
