use std::future::Future;
use std::marker::PhantomData;

use async_trait::async_trait;
use serde::de::DeserializeOwned;

use crate::converter::Payload;
use crate::errors::SqsListenerError;
use crate::handler::{HandlerContext, MessageHandler};

/// [`MessageHandler`] that wraps a plain async function and a shared resource.
///
/// The function receives the message body as text together with a clone of
/// the shared resource, so database pools, HTTP clients or counters can be
/// reused across messages.
///
/// # Type Parameters
///
/// * `RFn` - The message handler function type
/// * `Fut` - The future returned by the handler function
/// * `TShared` - The type of shared resources passed to the handler
pub struct AsyncFnHandler<RFn, Fut, TShared>
where
    RFn: Fn(String, TShared) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), SqsListenerError>> + Send + 'static,
    TShared: Send + Sync + Clone + 'static,
{
    rv_fn: RFn,
    shared_resources: TShared,
    _future: PhantomData<fn() -> Fut>,
}

impl<RFn, Fut, TShared> AsyncFnHandler<RFn, Fut, TShared>
where
    RFn: Fn(String, TShared) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), SqsListenerError>> + Send + 'static,
    TShared: Send + Sync + Clone + 'static,
{
    /// Creates a new function handler.
    ///
    /// # Arguments
    ///
    /// * `rv_fn` - The message handler function
    /// * `shared_resources` - Resources shared between message processing calls
    pub fn new(rv_fn: RFn, shared_resources: TShared) -> Self {
        AsyncFnHandler {
            rv_fn,
            shared_resources,
            _future: PhantomData,
        }
    }
}

#[async_trait]
impl<RFn, Fut, TShared> MessageHandler for AsyncFnHandler<RFn, Fut, TShared>
where
    RFn: Fn(String, TShared) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), SqsListenerError>> + Send + 'static,
    TShared: Send + Sync + Clone + 'static,
{
    async fn handle(
        &self,
        payload: Payload,
        _context: &HandlerContext,
    ) -> Result<(), SqsListenerError> {
        (self.rv_fn)(payload.to_text(), self.shared_resources.clone()).await
    }
}

/// [`MessageHandler`] that deserializes the payload into `T` before calling
/// the wrapped function.
///
/// A payload that does not deserialize into `T` fails with
/// [`SqsListenerError::DeserializationError`] and the function is not called.
pub struct JsonFnHandler<T, RFn, Fut, TShared>
where
    T: DeserializeOwned + Send + 'static,
    RFn: Fn(T, TShared) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), SqsListenerError>> + Send + 'static,
    TShared: Send + Sync + Clone + 'static,
{
    rv_fn: RFn,
    shared_resources: TShared,
    _signature: PhantomData<fn(T) -> Fut>,
}

impl<T, RFn, Fut, TShared> JsonFnHandler<T, RFn, Fut, TShared>
where
    T: DeserializeOwned + Send + 'static,
    RFn: Fn(T, TShared) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), SqsListenerError>> + Send + 'static,
    TShared: Send + Sync + Clone + 'static,
{
    pub fn new(rv_fn: RFn, shared_resources: TShared) -> Self {
        JsonFnHandler {
            rv_fn,
            shared_resources,
            _signature: PhantomData,
        }
    }
}

#[async_trait]
impl<T, RFn, Fut, TShared> MessageHandler for JsonFnHandler<T, RFn, Fut, TShared>
where
    T: DeserializeOwned + Send + 'static,
    RFn: Fn(T, TShared) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), SqsListenerError>> + Send + 'static,
    TShared: Send + Sync + Clone + 'static,
{
    async fn handle(
        &self,
        payload: Payload,
        _context: &HandlerContext,
    ) -> Result<(), SqsListenerError> {
        let value: T = payload.deserialize()?;
        (self.rv_fn)(value, self.shared_resources.clone()).await
    }
}
