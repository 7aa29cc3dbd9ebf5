//! Await callback-style middleware.
//!
//! Some middleware is written against a `(request, response, done)` calling
//! convention: it does its work and signals completion by calling `done`,
//! possibly from another task. [`run_middleware`] hands such a function a
//! [`Done`] handle and resolves once the handle is used.
//!
//! | Completion            | Result                            |
//! |-----------------------|-----------------------------------|
//! | `done.next()`         | `Ok(None)`                        |
//! | `done.skip()`         | `Ok(None)`                        |
//! | `done.value(v)`       | `Ok(Some(v))`                     |
//! | `done.error(e)`       | `Err(MiddlewareError::Failed(e))` |
//! | `done` dropped unused | `Err(MiddlewareError::Abandoned)` |
//!
//! There is no timeout; wrap the future in `tokio::time::timeout` if the
//! middleware may stall.

use thiserror::Error;
use tokio::sync::oneshot;

/// How a middleware finished.
#[derive(Debug)]
pub enum Completion<T> {
    /// Continue with the next middleware
    Continue,
    /// Skip the remaining handlers of the current route
    Skip,
    Value(T),
    Error(anyhow::Error),
}

#[derive(Debug, Error)]
pub enum MiddlewareError {
    #[error(transparent)]
    Failed(anyhow::Error),

    #[error("middleware dropped its completion handle without completing")]
    Abandoned,
}

/// One-shot completion handle passed to a middleware.
///
/// Every method consumes the handle, so a middleware completes at most once.
#[derive(Debug)]
pub struct Done<T> {
    tx: oneshot::Sender<Completion<T>>,
}

impl<T> Done<T> {
    pub fn next(self) {
        self.complete(Completion::Continue);
    }

    pub fn skip(self) {
        self.complete(Completion::Skip);
    }

    pub fn value(self, value: T) {
        self.complete(Completion::Value(value));
    }

    pub fn error(self, error: impl Into<anyhow::Error>) {
        self.complete(Completion::Error(error.into()));
    }

    pub fn complete(self, completion: Completion<T>) {
        // The receiver is gone only if the caller stopped waiting.
        let _ = self.tx.send(completion);
    }
}

/// Run `middleware` with `req`, `res` and a fresh [`Done`] handle and wait
/// for it to complete.
///
/// ```rust,ignore
/// let user = run_middleware(&mut req, &mut headers, |req, _res, done| {
///     match req.headers().get("x-user") {
///         Some(v) => done.value(v.clone()),
///         None => done.next(),
///     }
/// })
/// .await?;
/// ```
///
/// # Errors
///
/// Returns `MiddlewareError::Failed` with the error the middleware passed to
/// [`Done::error`], or `MiddlewareError::Abandoned` if the handle was dropped.
pub async fn run_middleware<Req, Res, T, F>(
    req: Req,
    res: Res,
    middleware: F,
) -> Result<Option<T>, MiddlewareError>
where
    F: FnOnce(Req, Res, Done<T>),
{
    let (tx, rx) = oneshot::channel();
    middleware(req, res, Done { tx });

    match rx.await {
        Ok(Completion::Continue | Completion::Skip) => Ok(None),
        Ok(Completion::Value(value)) => Ok(Some(value)),
        Ok(Completion::Error(error)) => Err(MiddlewareError::Failed(error)),
        Err(_) => Err(MiddlewareError::Abandoned),
    }
}
