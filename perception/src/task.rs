use std::{
    fmt::{self, Debug, Formatter},
    sync::Arc,
    time::Duration,
};

use log::{debug, warn};
use tokio::{
    runtime::{Builder, Runtime},
    time::timeout,
};

use crate::{Error, Result};

/// Default number of attempts before a call is reported as timed out.
pub const DEFAULT_ATTEMPTS: u32 = 2;

/// A retrying, deadline-bounded executor for numeric calls.
///
/// This is a small wrapper around [`tokio::task::spawn_blocking`] and [`tokio::time::timeout`]
/// on an internally owned runtime, mainly for using inside synchronous code to bound how long
/// the caller waits on a possibly stalling operation.
///
/// The deadline bounds waiting only. A worker that never returns keeps its blocking thread
/// until it finishes on its own or the owning [`BoundedCall`] is dropped. [`BoundedCall::call`]
/// blocks the current thread and must not be used from within an async context.
pub struct BoundedCall {
    runtime: Option<Runtime>,
    attempts: u32,
}

impl Debug for BoundedCall {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundedCall")
            .field("attempts", &self.attempts)
            .finish()
    }
}

impl BoundedCall {
    pub fn new() -> Result<Self> {
        let runtime = Builder::new_current_thread()
            .enable_time()
            .thread_name("bounded-call")
            .build()?;

        Ok(Self {
            runtime: Some(runtime),
            attempts: DEFAULT_ATTEMPTS,
        })
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Sets the number of attempts, at least one.
    pub fn set_attempts(&mut self, attempts: u32) {
        self.attempts = attempts.max(1);
    }

    /// Runs `f` on a blocking worker and waits up to `deadline` for each attempt.
    ///
    /// Errors, panics and deadline expiry are retried. Once every attempt failed,
    /// [`Error::Timeout`] is returned carrying the last failure.
    pub fn call<T, F>(&self, name: &'static str, deadline: Duration, f: F) -> Result<T>
    where
        F: Fn() -> anyhow::Result<T> + Send + Sync + 'static,
        T: Send + 'static,
    {
        let runtime = self
            .runtime
            .as_ref()
            .expect("runtime is only taken on drop");
        let f = Arc::new(f);
        let mut last_error = String::new();

        for attempt in 1..=self.attempts {
            let f = f.clone();
            let handle = runtime.spawn_blocking(move || f());
            let outcome = runtime.block_on(async move { timeout(deadline, handle).await });

            match outcome {
                Ok(Ok(Ok(value))) => {
                    if attempt > 1 {
                        debug!(target: "task", "{name} succeeded on attempt {attempt}");
                    }
                    return Ok(value);
                }
                Ok(Ok(Err(err))) => last_error = err.to_string(),
                Ok(Err(join)) => last_error = format!("worker panicked: {join}"),
                Err(_) => last_error = format!("deadline of {deadline:?} elapsed"),
            }
            warn!(target: "task", "{name} attempt {attempt}/{} failed: {last_error}", self.attempts);
        }

        Err(Error::Timeout {
            call: name,
            attempts: self.attempts,
            deadline,
            last_error,
        })
    }
}

impl Drop for BoundedCall {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            // Stalled workers are detached instead of joined
            runtime.shutdown_background();
        }
    }
}
