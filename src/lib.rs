//! # AWS SQS Listener
//!
//! An asynchronous AWS SQS listener container. Handlers are registered per
//! queue; the container runs one polling task per queue, dispatches every
//! received message to its handler and acknowledges it according to the
//! configured deletion policy.
//!
//! ## Features
//!
//! - One long-polling tokio task per registered queue with cooperative shutdown
//! - Exactly one handler per queue, checked when the container starts
//! - Text or JSON payload conversion with typed handlers
//! - Deletion policies, explicit nack via visibility change and dead-letter routing
//! - Exponential backoff on transient service errors
//! - Buffered, batched deletes and visibility changes flushed on shutdown
//! - An in-memory queue client for tests
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use rs_sqs_listener::bootstrap::SqsListenerBuilder;
//! use serde::Deserialize;
//!
//! #[derive(Deserialize)]
//! struct Order {
//!     id: u64,
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut listener = SqsListenerBuilder::new().build().await?;
//!
//!     listener.container_mut().register_json_fn(
//!         "orders",
//!         |order: Order, prefix: String| async move {
//!             println!("{prefix}: processing order {}", order.id);
//!             Ok(())
//!         },
//!         "shop".to_string(),
//!         None,
//!     )?;
//!
//!     listener
//!         .run_until(async {
//!             let _ = tokio::signal::ctrl_c().await;
//!         })
//!         .await?;
//!     Ok(())
//! }
//! ```

pub mod bootstrap;
pub mod client;
pub mod converter;
pub mod dispatcher;
pub mod errors;
pub mod handler;
pub mod message;
pub mod queue;
pub mod receiver;

pub use bootstrap::{SqsListener, SqsListenerBuilder};
pub use client::QueueClient;
pub use errors::SqsListenerError;
pub use handler::{HandlerContext, MessageHandler};
pub use receiver::{ContainerState, ListenerConfig, SqsListenerContainer};
