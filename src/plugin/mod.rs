pub mod cache;
pub mod forward;
pub mod log;
pub mod prometheus;
pub mod store;

use anyhow::Result;
use futures::future::BoxFuture;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::message::{Request, Response};

/// A step in a query's handler chain.
///
/// Call `next.run(req, res)` to continue the chain. Returning without calling
/// it stops the chain; the server then falls back to its default handler if
/// the response is still unfinished.
#[async_trait::async_trait]
pub trait Handler: Send + Sync {
    fn name(&self) -> &str;
    async fn handle(&self, req: &Request, res: &mut Response, next: Next<'_>) -> Result<()>;
}

/// Continuation handed to each handler.
pub struct Next<'a> {
    handlers: &'a [Arc<dyn Handler>],
    position: usize,
    entered: &'a AtomicUsize,
    error: Option<anyhow::Error>,
}

impl<'a> Next<'a> {
    /// Error forwarded by the previous handler, if it failed.
    pub fn error(&self) -> Option<&anyhow::Error> { self.error.as_ref() }

    pub fn take_error(&mut self) -> Option<anyhow::Error> { self.error.take() }

    /// Whether any handler is left after this point.
    pub fn is_last(&self) -> bool { self.position >= self.handlers.len() }

    /// Invokes the rest of the chain. Returns an error that reached the end unhandled.
    pub async fn run(self, req: &Request, res: &mut Response) -> Result<()> {
        dispatch(self.handlers, self.position, self.entered, None, req, res).await
    }

    /// Invokes the rest of the chain, forwarding `err` to the next handler.
    pub async fn fail(self, err: anyhow::Error, req: &Request, res: &mut Response) -> Result<()> {
        dispatch(self.handlers, self.position, self.entered, Some(err), req, res).await
    }
}

fn dispatch<'r>(
    handlers: &'r [Arc<dyn Handler>],
    index: usize,
    entered: &'r AtomicUsize,
    error: Option<anyhow::Error>,
    req: &'r Request,
    res: &'r mut Response,
) -> BoxFuture<'r, Result<()>> {
    Box::pin(async move {
        let Some(handler) = handlers.get(index) else {
            return error.map_or(Ok(()), Err);
        };
        entered.fetch_max(index, Ordering::AcqRel);

        let next = Next { handlers, position: index + 1, entered, error };
        match handler.handle(req, res, next).await {
            Ok(()) => Ok(()),
            // The handler already continued the chain; the error belongs to the caller.
            Err(err) if entered.load(Ordering::Acquire) > index => Err(err),
            Err(err) => {
                tracing::debug!("[{}] handler failed for TxID {:#06x}, forwarding: {:#}", handler.name(), req.id(), err);
                dispatch(handlers, index + 1, entered, Some(err), req, res).await
            }
        }
    })
}

/// A flat, ordered list of handlers resolved for one query.
#[derive(Clone, Default)]
pub struct Chain {
    handlers: Vec<Arc<dyn Handler>>,
}

impl Chain {
    pub fn new(handlers: Vec<Arc<dyn Handler>>) -> Self { Self { handlers } }

    pub fn len(&self) -> usize { self.handlers.len() }

    pub fn is_empty(&self) -> bool { self.handlers.is_empty() }

    pub fn names(&self) -> Vec<&str> { self.handlers.iter().map(|h| h.name()).collect() }

    pub fn push(&mut self, handler: Arc<dyn Handler>) { self.handlers.push(handler); }

    pub async fn run(&self, req: &Request, res: &mut Response) -> Result<()> {
        let entered = AtomicUsize::new(0);
        dispatch(&self.handlers, 0, &entered, None, req, res).await
    }
}
