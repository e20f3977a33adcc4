//! Cancellation signals carrying an abort reason.
//!
//! An [`AbortController`] owns the right to fire; any number of cloned
//! [`AbortSignal`]s observe it. [`abortable`] races an operation against a
//! signal and always drops its wait on the signal when it returns.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use tokio_util::sync::CancellationToken;

use crate::error::{ClientError, Result};

const DEFAULT_REASON: &str = "signal is aborted without reason";

#[derive(Debug, Default)]
struct SignalState {
    token: CancellationToken,
    reason: Mutex<Option<String>>,
    parent: Option<AbortSignal>,
}

/// Read side of an [`AbortController`].
#[derive(Debug, Clone, Default)]
pub struct AbortSignal {
    state: Arc<SignalState>,
}

impl AbortSignal {
    pub fn is_aborted(&self) -> bool {
        self.state.token.is_cancelled()
    }

    /// Reason given to the controller, or inherited from a parent signal.
    pub fn reason(&self) -> Option<String> {
        if !self.is_aborted() {
            return None;
        }
        let own = self
            .state
            .reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        own.or_else(|| self.state.parent.as_ref().and_then(AbortSignal::reason))
            .or_else(|| Some(DEFAULT_REASON.to_string()))
    }

    /// Error reported by operations cancelled through this signal.
    pub fn abort_error(&self) -> ClientError {
        ClientError::Aborted(self.reason().unwrap_or_else(|| DEFAULT_REASON.to_string()))
    }

    /// Fails with the abort error if the signal already fired.
    pub fn check(&self) -> Result<()> {
        if self.is_aborted() {
            return Err(self.abort_error());
        }
        Ok(())
    }

    /// Resolves once the signal fires.
    pub async fn aborted(&self) {
        self.state.token.cancelled().await;
    }
}

/// Write side: fires its signal once.
#[derive(Debug, Default)]
pub struct AbortController {
    signal: AbortSignal,
}

impl AbortController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Controller that also fires when `parent` fires, reporting the parent's reason.
    pub fn child_of(parent: &AbortSignal) -> Self {
        Self {
            signal: AbortSignal {
                state: Arc::new(SignalState {
                    token: parent.state.token.child_token(),
                    reason: Mutex::new(None),
                    parent: Some(parent.clone()),
                }),
            },
        }
    }

    pub fn signal(&self) -> AbortSignal {
        self.signal.clone()
    }

    /// Fire the signal. Later calls keep the first reason.
    pub fn abort(&self, reason: impl Into<String>) {
        let state = &self.signal.state;
        {
            let mut current = state.reason.lock().unwrap_or_else(PoisonError::into_inner);
            if current.is_some() || state.token.is_cancelled() {
                return;
            }
            *current = Some(reason.into());
        }
        state.token.cancel();
    }
}

/// Run `operation` unless `signal` fires first.
///
/// Without a signal the operation runs untouched. An already-fired signal
/// fails immediately without polling the operation.
pub async fn abortable<F, T>(signal: Option<&AbortSignal>, operation: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    let Some(signal) = signal else {
        return operation.await;
    };
    signal.check()?;

    tokio::select! {
        biased;
        () = signal.aborted() => Err(signal.abort_error()),
        result = operation => result,
    }
}
