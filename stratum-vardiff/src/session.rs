//! Boundary with the Stratum session layer.
//!
//! The connection layer owns sockets and RPC dispatch. The vardiff controller
//! only needs two things from a live connection: mutable access to the
//! difficulty fields of the session record, and a way to push a
//! notification to the miner. [`SessionHandle`] captures exactly that.
//!
//! [`Session`] is a concrete handle for connection tasks built on tokio:
//! notifications go out through a bounded mpsc channel that the connection's
//! writer drains. Sending never waits; if the writer is behind or gone the
//! notification is dropped and logged.
//!
//! # Message Flow
//!
//! ```text
//! connection task              VardiffController
//!   |                                 |
//!   | submit(&session, ...)           |
//!   |-------------------------------->|
//!   |                                 | update_session(difficulty = new)
//!   |   OutboundMessage(SetDifficulty)|
//!   |<--------------------------------|
//!   | write JSON line to the miner    |
//! ```

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{json, Value};
use strum::IntoStaticStr;
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::tracing::prelude::*;

/// Difficulty-related fields of a Stratum session record.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionState {
    /// Difficulty currently assigned to the connection
    pub difficulty: f64,

    /// Difficulty in force before the last retarget, so shares for older
    /// jobs can still be judged against it
    pub prev_difficulty: Option<f64>,

    /// Last job issued under `prev_difficulty`
    pub prev_job_id: Option<String>,
}

impl SessionState {
    pub fn new(difficulty: f64) -> Self {
        Self {
            difficulty,
            prev_difficulty: None,
            prev_job_id: None,
        }
    }
}

/// Server-to-client notifications the controller can issue.
#[derive(Debug, Clone, PartialEq, IntoStaticStr)]
pub enum Notification {
    /// Ask the miner to use a new share difficulty from the next job on.
    #[strum(serialize = "mining.set_difficulty")]
    SetDifficulty(f64),
}

impl Notification {
    /// Stratum method name.
    pub fn method(&self) -> &'static str {
        self.into()
    }

    pub fn params(&self) -> Value {
        match self {
            Notification::SetDifficulty(difficulty) => json!([difficulty]),
        }
    }

    /// JSON-RPC notification object (no reply expected, so `id` is null).
    pub fn to_json(&self) -> Value {
        json!({
            "id": null,
            "method": self.method(),
            "params": self.params(),
        })
    }
}

/// What the controller needs from a live connection.
pub trait SessionHandle: Send + Sync {
    /// Run `f` with exclusive access to the session record.
    fn update_session(&self, f: &mut dyn FnMut(&mut SessionState));

    /// Push a notification to the miner without waiting for delivery.
    fn send_notification(&self, notification: Notification);
}

/// A notification addressed to one session.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub session: String,
    pub notification: Notification,
}

/// Channel-backed [`SessionHandle`].
///
/// Cheap to clone; clones share the same session record.
#[derive(Clone, Debug)]
pub struct Session {
    inner: Arc<SessionInner>,
}

#[derive(Debug)]
struct SessionInner {
    name: String,
    state: Mutex<SessionState>,
    outbound_tx: mpsc::Sender<OutboundMessage>,
}

impl Session {
    /// Create a session starting at `difficulty`.
    pub fn new(
        name: impl Into<String>,
        difficulty: f64,
        outbound_tx: mpsc::Sender<OutboundMessage>,
    ) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                name: name.into(),
                state: Mutex::new(SessionState::new(difficulty)),
                outbound_tx,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Copy of the current session record.
    pub fn state(&self) -> SessionState {
        self.inner.state.lock().clone()
    }

    pub fn difficulty(&self) -> f64 {
        self.inner.state.lock().difficulty
    }
}

impl SessionHandle for Session {
    fn update_session(&self, f: &mut dyn FnMut(&mut SessionState)) {
        let mut state = self.inner.state.lock();
        f(&mut state);
    }

    fn send_notification(&self, notification: Notification) {
        let message = OutboundMessage {
            session: self.inner.name.clone(),
            notification,
        };
        match self.inner.outbound_tx.try_send(message) {
            Ok(()) => {}
            Err(TrySendError::Full(message)) => {
                warn!(
                    session = %self.inner.name,
                    method = message.notification.method(),
                    "Outbound queue full, dropping notification"
                );
            }
            Err(TrySendError::Closed(message)) => {
                debug!(
                    session = %self.inner.name,
                    method = message.notification.method(),
                    "Session writer gone, dropping notification"
                );
            }
        }
    }
}
