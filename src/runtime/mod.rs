pub mod config;
pub mod endpoints;
pub mod error;
pub mod lock;
pub mod logging;
mod logical_thread;
mod manager;
pub mod message;
pub mod roles;
pub mod status;

#[cfg(test)]
mod tests;

use crate::common::*;
use message::{Message, MessageKind, Request, Response};

pub use logical_thread::{ExternalLogicalThread, LogicalThread, LogicalThreadState};
pub use manager::LogicalThreadManager;

/// One end of a point-to-point, ordered link, held by the process that
/// sends on it. Sends never suspend: every transport queues without bound.
pub trait Sender: Debug + Send + Sync {
    // id of this link within the holding process
    fn connection_id(&self) -> ConnectionId;
    // Err(ChannelClosed) once the peer is gone
    fn send(&self, msg: Message) -> Result<(), RuntimeError>;
}
pub type Connection = Arc<dyn Sender>;

/// Services one kind of inbound request on behalf of a logical thread.
/// Handlers may issue nested requests through `thread`, which services
/// further inbound requests of the same conversation while they wait.
#[async_trait::async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(
        &self,
        thread: &mut LogicalThread,
        request: Request,
    ) -> Result<Response, RuntimeError>;
}

/// Message kind -> handler, built once per process role at startup.
#[derive(Default, Clone)]
pub struct DispatchTable {
    handlers: HashMap<MessageKind, Arc<dyn RequestHandler>>,
}

pub(crate) type DisconnectListener = Arc<dyn Fn(ConnectionId) + Send + Sync>;

////////////////
impl DispatchTable {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn with(mut self, kinds: &[MessageKind], handler: Arc<dyn RequestHandler>) -> Self {
        for &kind in kinds {
            debug_assert!(kind.is_request());
            self.handlers.insert(kind, handler.clone());
        }
        self
    }
    pub fn get(&self, kind: MessageKind) -> Option<Arc<dyn RequestHandler>> {
        self.handlers.get(&kind).cloned()
    }
    pub fn handles(&self, kind: MessageKind) -> bool {
        self.handlers.contains_key(&kind)
    }
}
impl Debug for DispatchTable {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        f.debug_set().entries(self.handlers.keys()).finish()
    }
}

// poisoning only means some holder panicked; the maps stay consistent
pub(crate) fn read_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(std::sync::PoisonError::into_inner)
}
pub(crate) fn write_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(std::sync::PoisonError::into_inner)
}
pub(crate) fn mutex_lock<T>(lock: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    lock.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
