//! Caller-side cancellation and deadlines.
//!
//! A [`RequestContext`] travels with each `get_resource` call. Every
//! suspension point (the lease wait loop, limiter admission, the backend
//! call) races against it and bails out with
//! [`Cancelled`](crate::FleetCacheError::Cancelled) or
//! [`DeadlineExceeded`](crate::FleetCacheError::DeadlineExceeded).
//!
//! ```rust
//! # use fleetcache::context::{cancel_pair, RequestContext};
//! # use std::time::Duration;
//! let (handle, signal) = cancel_pair();
//! let ctx = RequestContext::background()
//!     .with_cancel(signal)
//!     .with_timeout(Duration::from_secs(5));
//! handle.cancel();
//! assert!(ctx.check().is_err());
//! ```

use std::future::{Future, pending};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use crate::{FleetCacheError, Result};

/// Create a linked cancel handle and signal.
pub fn cancel_pair() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelSignal { rx })
}

/// Fires the paired [`CancelSignal`]s.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    /// Another signal tied to this handle.
    pub fn signal(&self) -> CancelSignal {
        CancelSignal {
            rx: self.tx.subscribe(),
        }
    }
}

/// Observes cancellation. Dropping the handle without cancelling means the
/// signal never fires.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once cancelled. Pends forever if the handle is dropped first.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                // Handle dropped. Re-check in case it cancelled on the way out.
                if *rx.borrow() {
                    return;
                }
                pending::<()>().await;
            }
        }
    }
}

/// Cancellation signal plus optional deadline for one request.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    cancel: Option<CancelSignal>,
    deadline: Option<Instant>,
}

impl RequestContext {
    /// A context that never cancels and has no deadline.
    pub fn background() -> Self {
        Self::default()
    }

    pub fn with_cancel(mut self, signal: CancelSignal) -> Self {
        self.cancel = Some(signal);
        self
    }

    /// Set the deadline to `timeout` from now.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Set an absolute deadline. An earlier existing deadline wins.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        });
        self
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Fail fast if the context has already ended.
    pub fn check(&self) -> Result<()> {
        if self.cancel.as_ref().is_some_and(CancelSignal::is_cancelled) {
            return Err(FleetCacheError::Cancelled);
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(FleetCacheError::DeadlineExceeded);
        }
        Ok(())
    }

    /// Resolve with the reason once the context ends.
    pub async fn done(&self) -> FleetCacheError {
        let cancelled = async {
            match &self.cancel {
                Some(signal) => signal.cancelled().await,
                None => pending().await,
            }
        };
        let expired = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => pending().await,
            }
        };
        tokio::select! {
            _ = cancelled => FleetCacheError::Cancelled,
            _ = expired => FleetCacheError::DeadlineExceeded,
        }
    }

    /// Drive `fut` unless the context ends first, in which case `fut` is
    /// dropped.
    pub async fn run<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.check()?;
        tokio::select! {
            biased;
            err = self.done() => Err(err),
            out = fut => out,
        }
    }

    /// Sleep for `duration`, waking early with an error if the context ends.
    pub async fn sleep(&self, duration: Duration) -> Result<()> {
        self.run(async {
            tokio::time::sleep(duration).await;
            Ok(())
        })
        .await
    }
}
