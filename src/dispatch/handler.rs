//! Handler trait and adapters.
//!
//! Every registered route and every pending correlation holds an
//! `Arc<dyn Handler>`. Two adapters build one from a plain async closure:
//!
//! - [`handler_fn`] - receives the raw [`Envelope`]
//! - [`typed`] - deserializes `request` into `T` and wraps the returned `R`
//!   in a success reply

use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::CallContext;
use crate::envelope::Envelope;
use crate::error::Result;

/// Result of a handler invocation: an optional reply envelope.
///
/// `Ok(None)` sends nothing. `Ok(Some(reply))` is sent back on the same
/// connection; a reply with an empty id inherits the call's id.
pub type HandlerResult = Result<Option<Envelope>>;

/// Boxed future for handler results.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A unit of application logic bound to a route or a pending call.
pub trait Handler: Send + Sync + 'static {
    /// Handle one envelope.
    fn call(&self, envelope: Envelope, ctx: CallContext) -> BoxFuture<'static, HandlerResult>;
}

/// Adapter for closures taking the raw envelope.
pub struct FnHandler<F> {
    f: F,
}

impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(Envelope, CallContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn call(&self, envelope: Envelope, ctx: CallContext) -> BoxFuture<'static, HandlerResult> {
        Box::pin((self.f)(envelope, ctx))
    }
}

/// Wrap an async closure as a shared handler.
///
/// ```
/// use simplerpc::dispatch::{handler_fn, Handler};
/// use simplerpc::Envelope;
///
/// let echo = handler_fn(|env: Envelope, _ctx| async move {
///     Ok(Some(Envelope::success("echo").with_request(env.request)))
/// });
/// # let _ = echo;
/// ```
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn Handler>
where
    F: Fn(Envelope, CallContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(FnHandler { f })
}

/// Wrapper that deserializes `request` before calling the handler and
/// serializes its output into a success reply.
pub struct TypedHandler<F, T, R, Fut>
where
    F: Fn(T, CallContext) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    Fut: Future<Output = Result<R>> + Send + 'static,
{
    handler: F,
    _phantom: PhantomData<fn(T) -> (R, Fut)>,
}

impl<F, T, R, Fut> TypedHandler<F, T, R, Fut>
where
    F: Fn(T, CallContext) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    Fut: Future<Output = Result<R>> + Send + 'static,
{
    /// Create a new typed handler.
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            _phantom: PhantomData,
        }
    }
}

impl<F, T, R, Fut> Handler for TypedHandler<F, T, R, Fut>
where
    F: Fn(T, CallContext) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    Fut: Future<Output = Result<R>> + Send + 'static,
{
    fn call(&self, envelope: Envelope, ctx: CallContext) -> BoxFuture<'static, HandlerResult> {
        let parsed: T = match serde_json::from_value(envelope.request) {
            Ok(v) => v,
            Err(e) => return Box::pin(async move { Err(e.into()) }),
        };

        let fut = (self.handler)(parsed, ctx);
        Box::pin(async move {
            let output = serde_json::to_value(fut.await?)?;
            Ok(Some(Envelope::success("").with_request(output)))
        })
    }
}

/// Wrap a typed async closure as a shared handler.
pub fn typed<F, T, R, Fut>(handler: F) -> Arc<dyn Handler>
where
    F: Fn(T, CallContext) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    Fut: Future<Output = Result<R>> + Send + 'static,
{
    Arc::new(TypedHandler::new(handler))
}
