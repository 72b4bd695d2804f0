//! Completion handles for in-flight requests

use crate::protocol::Response;
use crate::Error;
use std::sync::{Arc, Mutex};

enum FutureState {
    Pending,
    Resolved(Option<Response>),
    Failed(Error),
    /// Outcome already taken; remembers whether it was a success
    Taken(bool),
}

/// A future-like completion handle for a sent request.
///
/// The owning connection resolves or fails the handle from its own poll loop;
/// failures are always delivered here, never raised across the loop. Handles
/// are cheap to clone and all clones observe the same outcome, so one clone
/// can live in the connection's in-flight map while the caller keeps another.
#[derive(Clone)]
pub struct ResponseFuture {
    state: Arc<Mutex<FutureState>>,
}

impl ResponseFuture {
    pub(crate) fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(FutureState::Pending)),
        }
    }

    /// Resolve with a response, or `None` for fire-and-forget requests.
    /// First outcome wins; later calls are ignored.
    pub(crate) fn resolve(&self, response: Option<Response>) {
        let mut state = self.state.lock().expect("future lock poisoned");
        if matches!(*state, FutureState::Pending) {
            *state = FutureState::Resolved(response);
        }
    }

    /// Fail with an error. First outcome wins; later calls are ignored.
    pub(crate) fn fail(&self, error: Error) {
        let mut state = self.state.lock().expect("future lock poisoned");
        if matches!(*state, FutureState::Pending) {
            *state = FutureState::Failed(error);
        }
    }

    /// Whether the request has completed, successfully or not
    pub fn is_done(&self) -> bool {
        !matches!(
            *self.state.lock().expect("future lock poisoned"),
            FutureState::Pending
        )
    }

    /// Whether the request completed successfully
    pub fn succeeded(&self) -> bool {
        matches!(
            *self.state.lock().expect("future lock poisoned"),
            FutureState::Resolved(_) | FutureState::Taken(true)
        )
    }

    /// Whether the request failed
    pub fn failed(&self) -> bool {
        matches!(
            *self.state.lock().expect("future lock poisoned"),
            FutureState::Failed(_) | FutureState::Taken(false)
        )
    }

    /// Take the outcome once the request has completed.
    ///
    /// Returns `None` while the request is still pending, and again after the
    /// outcome has been taken. Fire-and-forget requests yield `Ok(None)`.
    pub fn take(&self) -> Option<Result<Option<Response>, Error>> {
        let mut state = self.state.lock().expect("future lock poisoned");
        match &*state {
            FutureState::Pending | FutureState::Taken(_) => None,
            FutureState::Resolved(_) => {
                match std::mem::replace(&mut *state, FutureState::Taken(true)) {
                    FutureState::Resolved(response) => Some(Ok(response)),
                    _ => unreachable!(),
                }
            }
            FutureState::Failed(_) => {
                match std::mem::replace(&mut *state, FutureState::Taken(false)) {
                    FutureState::Failed(error) => Some(Err(error)),
                    _ => unreachable!(),
                }
            }
        }
    }
}

impl std::fmt::Debug for ResponseFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match *self.state.lock().expect("future lock poisoned") {
            FutureState::Pending => "pending",
            FutureState::Resolved(_) => "resolved",
            FutureState::Failed(_) => "failed",
            FutureState::Taken(_) => "taken",
        };
        f.debug_struct("ResponseFuture").field("state", &state).finish()
    }
}
