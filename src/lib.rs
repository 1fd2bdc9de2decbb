#[macro_use]
mod macros;

mod common;
mod runtime;

pub use common::{ConnectionId, LogicalThreadId, MachineId, OwnerId, Payload, ProcessId, MP, MPO, TimeStamp};
pub use runtime::{
    config::{LogConfig, ProcessConfig},
    endpoints::{NetReactor, VirtualLink},
    error::{LockMode, RuntimeError, TransportError},
    lock::{acquire_in_order, LockTable, Transaction, TransactionRecord},
    logging::{DummyLogger, FileLogger, Logger, SharedLogger, VecLogger},
    message::{decode, encode, MalformedMessage, Message, MessageKind, MsgBody, Request, Response},
    roles::{Daemon, Envelope, Leaf, LeafKind, RequestSender, Root, Route, Router, Target},
    status::Status,
    Connection, DispatchTable, ExternalLogicalThread, LogicalThread, LogicalThreadManager,
    LogicalThreadState, RequestHandler, Sender,
};
