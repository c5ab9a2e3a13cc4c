//! Deferred execution of reconciliations and message sends.
//!
//! Tasks are queued on a channel and executed by a single worker which runs each
//! attempt as its own tokio task, so different lists progress concurrently. A task
//! that fails with a retryable error is queued again after a fixed delay. Tasks for
//! the same list are not serialized.
use crate::config::TaskConfig;
use crate::directory::DirectoryError;
use crate::metrics_defs::{TASK_FAILURES, TASK_RETRIES, TASKS_IN_FLIGHT};
use crate::reconciler::Reconciler;
use crate::types::Membership;
use shared::{counter, gauge};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tracing::Instrument;

#[derive(Clone, Debug, PartialEq)]
pub enum Task {
    Reconcile {
        list_id: String,
        list_title: String,
        should_exist: bool,
        members: Membership,
    },
    SendMessage {
        list_id: String,
        list_title: String,
        recipients: Vec<String>,
        subject: String,
        body: String,
    },
}

impl Task {
    pub fn list_id(&self) -> &str {
        match self {
            Task::Reconcile { list_id, .. } | Task::SendMessage { list_id, .. } => list_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Task::Reconcile { .. } => "reconcile",
            Task::SendMessage { .. } => "send_message",
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum TaskError {
    #[error("task failed: {0}")]
    Failed(#[source] DirectoryError),
    #[error("task failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: DirectoryError,
    },
    #[error("the task runner is shut down")]
    Closed,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    pub delay: Duration,
    /// `None` retries until the task succeeds
    pub max_retries: Option<u32>,
}

impl RetryPolicy {
    // `attempt` is 1 for the first execution.
    fn allows_retry(&self, attempt: u32) -> bool {
        self.max_retries.is_none_or(|max| attempt <= max)
    }
}

impl From<&TaskConfig> for RetryPolicy {
    fn from(config: &TaskConfig) -> Self {
        RetryPolicy {
            delay: config.retry_delay(),
            max_retries: config.max_retries,
        }
    }
}

type Completion = oneshot::Sender<Result<(), TaskError>>;

struct Envelope {
    task: Task,
    attempt: u32,
    done: Option<Completion>,
}

impl Envelope {
    fn finish(self, result: Result<(), TaskError>) {
        if let Some(done) = self.done {
            // The submitter may have stopped waiting
            let _ = done.send(result);
        }
    }
}

enum Command {
    Run(Envelope),
    Shutdown,
}

pub struct TaskRunner {
    tx: mpsc::Sender<Command>,
    handle: JoinHandle<()>,
}

impl TaskRunner {
    /// Spawns the worker. Must be called from within a tokio runtime.
    pub fn start(reconciler: Arc<Reconciler>, policy: RetryPolicy, queue_size: usize) -> Self {
        let (tx, rx) = mpsc::channel::<Command>(queue_size);

        let worker = Worker {
            reconciler,
            policy,
            tx: tx.downgrade(),
        };
        let handle = tokio::spawn(worker.run(rx));

        TaskRunner { tx, handle }
    }

    /// Queues a task without waiting for it to execute.
    pub async fn submit(&self, task: Task) -> Result<(), TaskError> {
        self.send(task, None).await
    }

    /// Queues a task and waits for its final outcome, after any retries.
    pub async fn run(&self, task: Task) -> Result<(), TaskError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.send(task, Some(done_tx)).await?;
        done_rx.await.map_err(|_| TaskError::Closed)?
    }

    async fn send(&self, task: Task, done: Option<Completion>) -> Result<(), TaskError> {
        let envelope = Envelope {
            task,
            attempt: 1,
            done,
        };
        self.tx
            .send(Command::Run(envelope))
            .await
            .map_err(|_| TaskError::Closed)
    }

    /// Stops accepting tasks and waits for running attempts to finish. Retries that
    /// are still waiting for their delay are abandoned and reported as `Closed`.
    pub async fn shutdown(self) {
        let _ = self.tx.send(Command::Shutdown).await;
        if let Err(e) = self.handle.await {
            tracing::error!("Task worker panicked: {e}");
        }
    }
}

#[derive(Clone)]
struct Worker {
    reconciler: Arc<Reconciler>,
    policy: RetryPolicy,
    // Weak so that dropping the runner stops the worker
    tx: mpsc::WeakSender<Command>,
}

impl Worker {
    async fn run(self, mut rx: mpsc::Receiver<Command>) {
        let mut in_flight = JoinSet::new();

        loop {
            tokio::select! {
                command = rx.recv() => match command {
                    Some(Command::Run(envelope)) => {
                        let span = tracing::info_span!(
                            "task",
                            kind = envelope.task.kind(),
                            list_id = envelope.task.list_id(),
                            attempt = envelope.attempt,
                        );
                        in_flight.spawn(self.clone().attempt(envelope).instrument(span));
                    }
                    Some(Command::Shutdown) | None => break,
                },
                Some(result) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(e) = result {
                        tracing::error!("Task panicked: {e}");
                    }
                }
            }
        }

        rx.close();
        // Commands queued before shutdown are dropped, which resolves their waiters as closed.
        while let Ok(command) = rx.try_recv() {
            if let Command::Run(envelope) = command {
                envelope.finish(Err(TaskError::Closed));
            }
        }

        while let Some(result) = in_flight.join_next().await {
            if let Err(e) = result {
                tracing::error!("Task panicked: {e}");
            }
        }
        tracing::debug!("Task worker stopped");
    }

    async fn execute(&self, task: &Task) -> Result<(), DirectoryError> {
        match task {
            Task::Reconcile {
                list_id,
                list_title,
                should_exist,
                members,
            } => {
                self.reconciler
                    .reconcile(list_id, list_title, *should_exist, members)
                    .await
            }
            Task::SendMessage {
                list_id,
                list_title,
                recipients,
                subject,
                body,
            } => {
                self.reconciler
                    .notifier()
                    .send_message(list_id, list_title, recipients, subject, body)
                    .await
            }
        }
    }

    async fn attempt(self, envelope: Envelope) {
        gauge!(TASKS_IN_FLIGHT).increment(1.0);
        let result = self.execute(&envelope.task).await;
        gauge!(TASKS_IN_FLIGHT).decrement(1.0);

        let err = match result {
            Ok(()) => {
                envelope.finish(Ok(()));
                return;
            }
            Err(err) => err,
        };

        if err.is_retryable() && self.policy.allows_retry(envelope.attempt) {
            tracing::warn!(
                error = %err,
                delay_secs = self.policy.delay.as_secs_f64(),
                "Task failed, scheduling retry"
            );
            counter!(TASK_RETRIES, "kind" => envelope.task.kind()).increment(1);
            self.schedule_retry(envelope);
            return;
        }

        tracing::error!(error = %err, "Task failed permanently");
        counter!(TASK_FAILURES, "kind" => envelope.task.kind()).increment(1);
        let failure = if err.is_retryable() {
            TaskError::RetriesExhausted {
                attempts: envelope.attempt,
                source: err,
            }
        } else {
            TaskError::Failed(err)
        };
        envelope.finish(Err(failure));
    }

    fn schedule_retry(&self, mut envelope: Envelope) {
        envelope.attempt += 1;
        let delay = self.policy.delay;
        let tx = self.tx.clone();

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            let Some(tx) = tx.upgrade() else {
                envelope.finish(Err(TaskError::Closed));
                return;
            };
            if let Err(mpsc::error::SendError(Command::Run(envelope))) =
                tx.send(Command::Run(envelope)).await
            {
                envelope.finish(Err(TaskError::Closed));
            }
        });
    }
}
