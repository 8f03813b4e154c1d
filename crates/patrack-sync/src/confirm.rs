use std::fmt;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::oneshot;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeKind {
    ApplyRemoteChanges { change_count: usize },
    ReplaceLocalEntry { file_name: String },
    AddInstitutions { names: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeRequest {
    pub kind: HandshakeKind,
    /// Localized question to show the operator.
    pub prompt: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Approve,
    Reject,
}

impl Decision {
    pub fn from_bool(approved: bool) -> Self {
        if approved {
            Decision::Approve
        } else {
            Decision::Reject
        }
    }

    pub fn is_approved(self) -> bool {
        self == Decision::Approve
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandshakeError {
    #[error("no decision received within {0:?}")]
    TimedOut(Duration),
    #[error("handshake was cancelled before a decision was made")]
    Cancelled,
}

/// The observer's half of a handshake. Dropping it without responding
/// cancels the handshake.
pub struct HandshakeTicket {
    request: HandshakeRequest,
    reply: oneshot::Sender<Decision>,
}

impl HandshakeTicket {
    pub fn request(&self) -> &HandshakeRequest {
        &self.request
    }

    /// Returns false when the worker stopped waiting.
    pub fn respond(self, decision: Decision) -> bool {
        self.reply.send(decision).is_ok()
    }
}

impl fmt::Debug for HandshakeTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandshakeTicket")
            .field("request", &self.request)
            .finish_non_exhaustive()
    }
}

/// The worker's half of a handshake.
#[derive(Debug)]
pub struct PendingHandshake {
    receiver: oneshot::Receiver<Decision>,
    timeout: Option<Duration>,
}

impl PendingHandshake {
    pub async fn wait(self) -> Result<Decision, HandshakeError> {
        match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, self.receiver).await {
                Ok(Ok(decision)) => Ok(decision),
                Ok(Err(_)) => Err(HandshakeError::Cancelled),
                Err(_) => Err(HandshakeError::TimedOut(limit)),
            },
            None => self.receiver.await.map_err(|_| HandshakeError::Cancelled),
        }
    }
}

/// Creates single-slot handshakes between the worker and its observer.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConfirmationChannel {
    timeout: Option<Duration>,
}

impl ConfirmationChannel {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self { timeout }
    }

    pub fn open(&self, request: HandshakeRequest) -> (HandshakeTicket, PendingHandshake) {
        let (reply, receiver) = oneshot::channel();
        (
            HandshakeTicket { request, reply },
            PendingHandshake {
                receiver,
                timeout: self.timeout,
            },
        )
    }
}
