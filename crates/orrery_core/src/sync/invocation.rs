//! # Master Invocations
//!
//! Work queued from any thread for execution on the master thread.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};

use crossbeam_channel::{bounded, Receiver};

/// Payload of a caught panic, carried across threads until it can be re-raised.
pub type PanicPayload = Box<dyn Any + Send + 'static>;

/// A delegate destined for the master thread.
///
/// Blocking invocations report their outcome through a reply channel created
/// with [`MasterInvocation::blocking`]; non-blocking ones are fire-and-forget.
pub struct MasterInvocation {
    action: Box<dyn FnOnce() + Send + 'static>,
    blocking: bool,
}

impl MasterInvocation {
    /// Creates a fire-and-forget invocation.
    ///
    /// A panic raised by `action` is re-raised on the master thread.
    #[must_use]
    pub fn non_blocking<F>(action: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            action: Box::new(action),
            blocking: false,
        }
    }

    /// Creates a blocking invocation and the receiver its caller waits on.
    ///
    /// The receiver yields the closure's result, or the payload of its panic.
    /// If the invocation is discarded without running (disposal), the
    /// receiver disconnects instead.
    #[must_use]
    pub fn blocking<F, T>(action: F) -> (Self, Receiver<std::thread::Result<T>>)
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (reply_tx, reply_rx) = bounded(1);
        let invocation = Self {
            action: Box::new(move || {
                let outcome = panic::catch_unwind(AssertUnwindSafe(action));
                // The caller may have given up waiting; nothing to report then.
                let _ = reply_tx.send(outcome);
            }),
            blocking: true,
        };
        (invocation, reply_rx)
    }

    /// Whether the queuing thread waits for this invocation to finish.
    #[inline]
    #[must_use]
    pub const fn is_blocking(&self) -> bool {
        self.blocking
    }

    /// Runs the delegate on the current thread.
    ///
    /// Blocking invocations forward their own panics to the waiting caller,
    /// so only non-blocking invocations can return `Err`.
    pub(crate) fn run(self) -> Result<(), PanicPayload> {
        panic::catch_unwind(AssertUnwindSafe(self.action))
    }
}

impl fmt::Debug for MasterInvocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MasterInvocation")
            .field("blocking", &self.blocking)
            .finish_non_exhaustive()
    }
}
