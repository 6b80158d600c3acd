//! In-process saga client.
//!
//! Starts named saga instances as tokio tasks and routes updates to them over
//! their mailboxes. Instances live only as long as the process.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{Instrument, info, info_span};

use crate::ledger::Ledger;
use crate::model::Update;
use crate::saga::{Envelope, SagaError, SagaOptions, SagaReport, TransferSaga, UpdateError, UpdateHandle};

/// Task queue used when the caller does not name one.
pub const DEFAULT_TASK_QUEUE: &str = "demo-tq";

const MAILBOX_CAPACITY: usize = 16;

#[derive(Debug, Error)]
pub enum StartError {
    #[error("saga {0} already exists")]
    AlreadyExists(String),
}

/// How to start a saga instance.
#[derive(Debug, Clone, PartialEq)]
pub struct StartOptions {
    pub id: String,
    pub task_queue: String,
    /// Overrides [`SagaOptions::run_timeout`] for this instance.
    pub run_timeout: Option<Duration>,
}

impl StartOptions {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            task_queue: DEFAULT_TASK_QUEUE.to_string(),
            run_timeout: None,
        }
    }

    pub fn task_queue(mut self, task_queue: impl Into<String>) -> Self {
        self.task_queue = task_queue.into();
        self
    }

    pub fn run_timeout(mut self, run_timeout: Duration) -> Self {
        self.run_timeout = Some(run_timeout);
        self
    }
}

struct Inner {
    ledger: Arc<dyn Ledger>,
    options: SagaOptions,
    instances: Mutex<HashMap<String, mpsc::Sender<Envelope>>>,
}

/// Front door to the running saga instances. Cheap to clone.
#[derive(Clone)]
pub struct SagaClient {
    inner: Arc<Inner>,
}

impl SagaClient {
    pub fn new(ledger: Arc<dyn Ledger>, options: SagaOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                ledger,
                options,
                instances: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn options(&self) -> &SagaOptions {
        &self.inner.options
    }

    /// Start a new transfer saga under `options.id`.
    ///
    /// An id can be reused once the previous instance stopped accepting
    /// updates.
    pub async fn start_transfer(&self, options: StartOptions) -> Result<SagaHandle, StartError> {
        let mut instances = self.inner.instances.lock().await;
        instances.retain(|_, sender| !sender.is_closed());
        if instances.contains_key(&options.id) {
            return Err(StartError::AlreadyExists(options.id));
        }

        let (sender, receiver) = mpsc::channel(MAILBOX_CAPACITY);
        let saga = TransferSaga::new(
            options.id.clone(),
            Arc::clone(&self.inner.ledger),
            self.inner.options.clone(),
        );
        let run_timeout = options.run_timeout.or(self.inner.options.run_timeout);
        let span = info_span!("saga", saga_id = %options.id, task_queue = %options.task_queue);

        let task = tokio::spawn(
            async move {
                let run = saga.run(ReceiverStream::new(receiver));
                match run_timeout {
                    Some(limit) => tokio::time::timeout(limit, run)
                        .await
                        .unwrap_or_else(|_| Err(SagaError::RunTimedOut(limit))),
                    None => run.await,
                }
            }
            .instrument(span),
        );

        info!(saga_id = %options.id, task_queue = %options.task_queue, "saga started");
        instances.insert(options.id.clone(), sender.clone());

        Ok(SagaHandle {
            id: options.id,
            sender,
            task,
            inner: Arc::clone(&self.inner),
        })
    }

    /// Deliver `update` to the instance `id` and wait for its verdict.
    pub async fn update(&self, id: &str, update: Update) -> Result<UpdateHandle, UpdateError> {
        let sender = self
            .inner
            .instances
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| UpdateError::NotFound(id.to_string()))?;
        deliver(&sender, update).await
    }

    /// Deliver `update` and wait until it finished executing.
    pub async fn update_and_wait(&self, id: &str, update: Update) -> Result<(), UpdateError> {
        self.update(id, update).await?.outcome().await
    }
}

/// Handle on one started saga instance.
pub struct SagaHandle {
    id: String,
    sender: mpsc::Sender<Envelope>,
    task: JoinHandle<Result<SagaReport, SagaError>>,
    inner: Arc<Inner>,
}

impl SagaHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn update(&self, update: Update) -> Result<UpdateHandle, UpdateError> {
        deliver(&self.sender, update).await
    }

    pub async fn update_and_wait(&self, update: Update) -> Result<(), UpdateError> {
        self.update(update).await?.outcome().await
    }

    /// Wait for the instance to terminate.
    ///
    /// The instance is no longer reachable through the client afterwards, so
    /// one that never received a transfer ends with [`SagaError::Abandoned`].
    pub async fn result(self) -> Result<SagaReport, SagaError> {
        let Self {
            id,
            sender,
            task,
            inner,
        } = self;
        {
            let mut instances = inner.instances.lock().await;
            if instances.get(&id).is_some_and(|s| s.same_channel(&sender)) {
                instances.remove(&id);
            }
        }
        drop(sender);
        match task.await {
            Ok(result) => result,
            Err(e) => Err(SagaError::Crashed(e.to_string())),
        }
    }
}

async fn deliver(sender: &mpsc::Sender<Envelope>, update: Update) -> Result<UpdateHandle, UpdateError> {
    let (envelope, verdict) = Envelope::new(update);
    sender.send(envelope).await.map_err(|_| UpdateError::Closed)?;
    verdict.await.map_err(|_| UpdateError::Closed)?
}
