//! Wiring of client, buffering, dispatcher and container into a runnable listener.

use std::future::Future;
use std::sync::Arc;

use tracing::info;

use crate::client::{
    BufferConfig, BufferedQueueClient, ClientSettings, QueueClient, SqsQueueClient,
    create_sqs_client,
};
use crate::dispatcher::QueueMessageDispatcher;
use crate::errors::SqsListenerError;
use crate::receiver::{ListenerConfig, SqsListenerContainer};

#[derive(Debug, Clone)]
enum Buffering {
    /// Buffer only the client the builder creates itself.
    Default,
    Enabled(BufferConfig),
    Disabled,
}

/// Builds an [`SqsListener`].
///
/// Without overrides the builder creates an AWS SDK client from the
/// environment, wraps it in a [`BufferedQueueClient`] and uses
/// [`ListenerConfig::default`] for every registration that does not carry its
/// own configuration. A client passed with [`client`](Self::client) is used
/// as-is unless [`buffering`](Self::buffering) is requested explicitly.
///
/// # Example
///
/// ```rust,no_run
/// use rs_sqs_listener::bootstrap::SqsListenerBuilder;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let mut listener = SqsListenerBuilder::new().build().await?;
///     listener.container_mut().register_fn(
///         "orders",
///         |message: String, _: ()| async move {
///             tracing::info!(%message, "order received");
///             Ok(())
///         },
///         (),
///         None,
///     )?;
///
///     listener
///         .run_until(async {
///             let _ = tokio::signal::ctrl_c().await;
///         })
///         .await?;
///     Ok(())
/// }
/// ```
#[derive(Default)]
pub struct SqsListenerBuilder {
    client: Option<Arc<dyn QueueClient>>,
    settings: ClientSettings,
    buffering: Option<Buffering>,
    dispatcher: Option<QueueMessageDispatcher>,
    default_config: Option<ListenerConfig>,
}

impl SqsListenerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses `client` instead of creating one from [`ClientSettings`].
    pub fn client(mut self, client: Arc<dyn QueueClient>) -> Self {
        self.client = Some(client);
        self
    }

    /// Region, credentials and endpoint for the client the builder creates.
    /// Ignored when a client is supplied.
    pub fn settings(mut self, settings: ClientSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Batches deletes and visibility changes with `config`.
    pub fn buffering(mut self, config: BufferConfig) -> Self {
        self.buffering = Some(Buffering::Enabled(config));
        self
    }

    pub fn without_buffering(mut self) -> Self {
        self.buffering = Some(Buffering::Disabled);
        self
    }

    /// Starts from a dispatcher that may already hold handlers.
    pub fn dispatcher(mut self, dispatcher: QueueMessageDispatcher) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn default_config(mut self, config: ListenerConfig) -> Self {
        self.default_config = Some(config);
        self
    }

    /// Creates the client stack and the container. Must run inside a tokio
    /// runtime since buffering spawns its flusher task.
    pub async fn build(self) -> Result<SqsListener, SqsListenerError> {
        let default_config = self.default_config.unwrap_or_default();
        default_config.validate()?;

        let supplied = self.client.is_some();
        let inner: Arc<dyn QueueClient> = match self.client {
            Some(client) => client,
            None => Arc::new(SqsQueueClient::new(create_sqs_client(&self.settings).await)),
        };

        let buffer_config = match self.buffering.unwrap_or(Buffering::Default) {
            Buffering::Enabled(config) => Some(config),
            Buffering::Default if !supplied => Some(BufferConfig::default()),
            Buffering::Default | Buffering::Disabled => None,
        };

        let buffered = buffer_config
            .map(|config| Arc::new(BufferedQueueClient::new(inner.clone(), config)));
        let client: Arc<dyn QueueClient> = match &buffered {
            Some(buffered) => buffered.clone(),
            None => inner,
        };
        info!(
            supplied_client = supplied,
            buffered = buffered.is_some(),
            "Built SQS listener"
        );

        let container = SqsListenerContainer::with_dispatcher(
            client,
            self.dispatcher.unwrap_or_default(),
        )
        .with_default_config(default_config);

        Ok(SqsListener {
            container,
            buffered,
        })
    }
}

/// A listener container together with the buffered client it owns.
pub struct SqsListener {
    container: SqsListenerContainer,
    buffered: Option<Arc<BufferedQueueClient>>,
}

impl SqsListener {
    pub fn container(&self) -> &SqsListenerContainer {
        &self.container
    }

    /// Registration happens through the container.
    pub fn container_mut(&mut self) -> &mut SqsListenerContainer {
        &mut self.container
    }

    pub fn is_buffered(&self) -> bool {
        self.buffered.is_some()
    }

    pub async fn start(&mut self) -> Result<(), SqsListenerError> {
        self.container.start().await
    }

    /// Stops the container, then flushes pending acknowledgements.
    pub async fn shutdown(&mut self) {
        self.container.stop().await;
        if let Some(buffered) = &self.buffered {
            buffered.shutdown().await;
        }
    }

    /// Starts, waits for `shutdown_signal`, then shuts down. Shutdown also
    /// runs when starting fails.
    pub async fn run_until<F>(&mut self, shutdown_signal: F) -> Result<(), SqsListenerError>
    where
        F: Future<Output = ()>,
    {
        let started = self.start().await;
        if started.is_ok() {
            shutdown_signal.await;
        }
        self.shutdown().await;
        started
    }
}
