use crate::common::*;
use crate::runtime::message::MessageKind;

/// Lock mode named in a `LockConflict`.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, serde::Serialize, serde::Deserialize)]
pub enum LockMode {
    Read,
    Write,
}

/// Failure of a request, local or remote. Travels inside error-responses,
/// so a remote failure arrives at the caller as the same variant.
#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error, serde::Serialize, serde::Deserialize)]
pub enum RuntimeError {
    #[error("{from:?} cannot {mode:?} lock {resource:?}: held in an incompatible mode")]
    LockConflict { from: MPO, resource: MPO, mode: LockMode },
    #[error("channel {connection:?} is closed")]
    ChannelClosed { connection: ConnectionId },
    #[error("{logical_thread_id:?} lost connection {connection:?}")]
    Disconnection { logical_thread_id: LogicalThreadId, connection: ConnectionId },
    #[error("no handler for {kind:?}")]
    DispatchFailure { kind: MessageKind },
    #[error("{0}")]
    Fault(String),
    #[error("unknown connection {0:?}")]
    UnknownConnection(ConnectionId),
    #[error("unknown simulation {0:?}")]
    UnknownSimulation(MPO),
    #[error("simulation {mpo:?} failed: {what}")]
    SimulationError { mpo: MPO, what: String },
    #[error("expected {expected:?} got {got:?}")]
    UnexpectedResponse { expected: MessageKind, got: MessageKind },
    #[error("cannot route: {0}")]
    Routing(String),
    #[error("enrolment failed: {0}")]
    Enrolment(String),
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to create poll: {0}")]
    PollInitFailed(std::io::Error),
    #[error("failed to bind {0}: {1}")]
    BindFailed(SocketAddr, std::io::Error),
    #[error("failed to connect {0}: {1}")]
    ConnectFailed(SocketAddr, std::io::Error),
    #[error("reactor thread is gone")]
    ReactorGone,
}

impl RuntimeError {
    // A fault that retires the logical thread, not only the current request.
    pub(crate) fn is_fatal(&self) -> bool {
        matches!(self, RuntimeError::DispatchFailure { .. })
    }
    pub(crate) fn fault(what: impl Display) -> Self {
        RuntimeError::Fault(what.to_string())
    }
}
