use std::fmt;
use std::future::Future;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::client::{QueueClient, SqsQueueClient};
use crate::dispatcher::QueueMessageDispatcher;
use crate::errors::SqsListenerError;
use crate::handler::MessageHandler;
use crate::queue::{QueueRef, QueueResolver};

pub mod config;
mod functions;
mod poller;

pub use config::{
    BackoffConfig, DeadLetterConfig, DeletionPolicy, DispatchMode, ListenerConfig,
    PoisonMessagePolicy,
};
pub use functions::{AsyncFnHandler, JsonFnHandler};
pub use poller::{DEAD_LETTER_REASON_ATTRIBUTE, DEAD_LETTER_SOURCE_ATTRIBUTE};

use poller::QueuePoller;

/// Lifecycle of a [`SqsListenerContainer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Created,
    /// Queues are resolved and polling tasks are being spawned.
    Started,
    /// Polling tasks are active.
    Running,
    /// `stop` is waiting for polling tasks to finish.
    Stopping,
    Stopped,
}

impl ContainerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerState::Created => "created",
            ContainerState::Started => "started",
            ContainerState::Running => "running",
            ContainerState::Stopping => "stopping",
            ContainerState::Stopped => "stopped",
        }
    }

    fn accepts_changes(&self) -> bool {
        matches!(self, ContainerState::Created | ContainerState::Stopped)
    }
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct ListenerRegistration {
    queue: QueueRef,
    config: ListenerConfig,
}

/// Owns the listener registrations and one polling task per registered queue.
///
/// Handlers are registered before [`start`](Self::start); the container then
/// validates the configuration, resolves every queue and spawns the polling
/// tasks. [`stop`](Self::stop) lets in-flight receives complete and waits for
/// every task to finish.
///
/// # Example
///
/// ```rust,no_run
/// use rs_sqs_listener::client::create_sqs_client_from_env;
/// use rs_sqs_listener::receiver::SqsListenerContainer;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let client = create_sqs_client_from_env().await;
///     let mut container = SqsListenerContainer::from_sqs_client(client);
///
///     container.register_fn(
///         "orders",
///         |message: String, prefix: String| async move {
///             tracing::info!("{prefix}: {message}");
///             Ok(())
///         },
///         "order".to_string(),
///         None,
///     )?;
///
///     container.start().await?;
///     tokio::signal::ctrl_c().await?;
///     container.stop().await;
///     Ok(())
/// }
/// ```
pub struct SqsListenerContainer {
    client: Arc<dyn QueueClient>,
    resolver: QueueResolver,
    dispatcher: QueueMessageDispatcher,
    listeners: Vec<ListenerRegistration>,
    default_config: ListenerConfig,
    state: ContainerState,
    shutdown: Option<watch::Sender<bool>>,
    tasks: Vec<(String, JoinHandle<()>)>,
}

impl SqsListenerContainer {
    pub fn new(client: Arc<dyn QueueClient>) -> Self {
        Self::with_dispatcher(client, QueueMessageDispatcher::new())
    }

    /// Creates a container around a dispatcher that may already hold handlers.
    /// Queues registered only on the dispatcher use the default configuration.
    pub fn with_dispatcher(client: Arc<dyn QueueClient>, dispatcher: QueueMessageDispatcher) -> Self {
        SqsListenerContainer {
            resolver: QueueResolver::new(client.clone()),
            client,
            dispatcher,
            listeners: Vec::new(),
            default_config: ListenerConfig::default(),
            state: ContainerState::Created,
            shutdown: None,
            tasks: Vec::new(),
        }
    }

    /// Wraps an AWS SDK client without buffering.
    pub fn from_sqs_client(sqs_client: aws_sdk_sqs::Client) -> Self {
        Self::new(Arc::new(SqsQueueClient::new(sqs_client)))
    }

    /// Configuration used by registrations that pass `None`.
    pub fn with_default_config(mut self, config: ListenerConfig) -> Self {
        self.default_config = config;
        self
    }

    pub fn state(&self) -> ContainerState {
        self.state
    }

    /// The client shared by every polling task.
    pub fn client(&self) -> &Arc<dyn QueueClient> {
        &self.client
    }

    /// Number of polling tasks currently owned by the container.
    pub fn active_tasks(&self) -> usize {
        self.tasks.len()
    }

    /// Registers `handler` for `queue`.
    ///
    /// # Arguments
    ///
    /// * `queue` - Queue name or URL
    /// * `handler` - The handler invoked for every message of the queue
    /// * `config` - Listener configuration; `None` uses the container default
    ///
    /// A second handler for the same queue is accepted here and reported as
    /// [`SqsListenerError::DuplicateHandler`] by [`start`](Self::start).
    /// Registering while the container is running fails with
    /// [`SqsListenerError::InvalidState`].
    pub fn register<H>(
        &mut self,
        queue: impl Into<QueueRef>,
        handler: H,
        config: Option<ListenerConfig>,
    ) -> Result<(), SqsListenerError>
    where
        H: MessageHandler + 'static,
    {
        if !self.state.accepts_changes() {
            return Err(SqsListenerError::InvalidState {
                expected: "created or stopped",
                actual: self.state.as_str(),
            });
        }

        let queue = queue.into();
        let config = config.unwrap_or_else(|| self.default_config.clone());
        self.dispatcher
            .register(queue.clone(), Arc::new(handler), config.payload_format);
        self.listeners.push(ListenerRegistration { queue, config });
        Ok(())
    }

    /// Registers an async function that receives the message body as text and
    /// a clone of `shared_resources`.
    ///
    /// # Example
    ///
    /// ```rust
    /// use std::sync::Arc;
    /// use rs_sqs_listener::client::InMemoryQueueClient;
    /// use rs_sqs_listener::receiver::SqsListenerContainer;
    ///
    /// let mut container = SqsListenerContainer::new(Arc::new(InMemoryQueueClient::new()));
    /// container
    ///     .register_fn(
    ///         "orders",
    ///         |message: String, _shared: ()| async move {
    ///             assert!(!message.is_empty());
    ///             Ok(())
    ///         },
    ///         (),
    ///         None,
    ///     )
    ///     .unwrap();
    /// ```
    pub fn register_fn<RFn, Fut, TShared>(
        &mut self,
        queue: impl Into<QueueRef>,
        rv_fn: RFn,
        shared_resources: TShared,
        config: Option<ListenerConfig>,
    ) -> Result<(), SqsListenerError>
    where
        RFn: Fn(String, TShared) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), SqsListenerError>> + Send + 'static,
        TShared: Send + Sync + Clone + 'static,
    {
        self.register(queue, AsyncFnHandler::new(rv_fn, shared_resources), config)
    }

    /// Registers an async function that receives the payload deserialized into `T`.
    ///
    /// Payloads that do not deserialize into `T` are treated as malformed messages.
    pub fn register_json_fn<T, RFn, Fut, TShared>(
        &mut self,
        queue: impl Into<QueueRef>,
        rv_fn: RFn,
        shared_resources: TShared,
        config: Option<ListenerConfig>,
    ) -> Result<(), SqsListenerError>
    where
        T: DeserializeOwned + Send + 'static,
        RFn: Fn(T, TShared) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), SqsListenerError>> + Send + 'static,
        TShared: Send + Sync + Clone + 'static,
    {
        self.register(queue, JsonFnHandler::new(rv_fn, shared_resources), config)
    }

    /// Validates the registrations, resolves every queue and spawns one
    /// polling task per queue.
    ///
    /// Configuration problems (invalid values, duplicate handlers, missing
    /// queues) are returned here and no task is spawned.
    pub async fn start(&mut self) -> Result<(), SqsListenerError> {
        if !self.state.accepts_changes() {
            return Err(SqsListenerError::InvalidState {
                expected: "created or stopped",
                actual: self.state.as_str(),
            });
        }

        // The state only changes once preparation is complete, so a cancelled
        // or failed start leaves the container as it was.
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let pollers = match self.prepare(shutdown_rx).await {
            Ok(pollers) => pollers,
            Err(e) => {
                error!(error = %e, "Listener container failed to start");
                return Err(e);
            }
        };

        self.state = ContainerState::Started;
        for poller in pollers {
            let queue_url = poller.queue_url.clone();
            self.tasks.push((queue_url, tokio::spawn(poller.run())));
        }
        self.shutdown = Some(shutdown_tx);
        self.state = ContainerState::Running;
        info!(queues = self.tasks.len(), "Listener container running");
        Ok(())
    }

    async fn prepare(
        &self,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Vec<QueuePoller>, SqsListenerError> {
        for listener in &self.listeners {
            listener.config.validate()?;
        }
        self.default_config.validate()?;
        self.dispatcher.validate()?;

        let mut dispatcher = self.dispatcher.clone();
        let mut plans = Vec::with_capacity(dispatcher.len());
        let queues: Vec<QueueRef> = dispatcher.queues().cloned().collect();
        for queue in queues {
            let config = self.config_for(&queue);
            let queue_url = self.resolver.resolve(&queue).await?;
            dispatcher.bind(&queue, &queue_url)?;
            let dead_letter_url = match &config.dead_letter {
                Some(dead_letter) => Some(self.resolver.resolve(&dead_letter.queue).await?),
                None => None,
            };
            info!(queue = %queue, url = %queue_url, "Resolved listener queue");
            plans.push((queue_url, dead_letter_url, config));
        }

        let dispatcher = Arc::new(dispatcher);
        Ok(plans
            .into_iter()
            .map(|(queue_url, dead_letter_url, config)| QueuePoller {
                queue_url,
                dead_letter_url,
                config,
                client: self.client.clone(),
                dispatcher: dispatcher.clone(),
                shutdown: shutdown.clone(),
            })
            .collect())
    }

    fn config_for(&self, queue: &QueueRef) -> ListenerConfig {
        self.listeners
            .iter()
            .find(|listener| &listener.queue == queue)
            .map(|listener| listener.config.clone())
            .unwrap_or_else(|| self.default_config.clone())
    }

    /// Signals every polling task to exit after its current receive call and
    /// waits for all of them. Does nothing unless the container is running.
    pub async fn stop(&mut self) {
        if self.state != ContainerState::Running {
            return;
        }
        self.state = ContainerState::Stopping;
        info!("Stopping listener container");

        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(true);
        }
        for (queue_url, task) in self.tasks.drain(..) {
            if let Err(e) = task.await {
                error!(queue = %queue_url, error = %e, "Polling task terminated abnormally");
            }
        }

        self.state = ContainerState::Stopped;
        info!("Listener container stopped");
    }

    /// Starts the container, runs until `shutdown_signal` resolves, then stops.
    ///
    /// The container is stopped on every path, including a failed start.
    pub async fn run_until<F>(&mut self, shutdown_signal: F) -> Result<(), SqsListenerError>
    where
        F: Future<Output = ()>,
    {
        if let Err(e) = self.start().await {
            self.stop().await;
            return Err(e);
        }
        shutdown_signal.await;
        self.stop().await;
        Ok(())
    }
}

impl Drop for SqsListenerContainer {
    fn drop(&mut self) {
        // Tasks observe the signal and exit on their own.
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(true);
        }
    }
}
