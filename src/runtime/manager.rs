use super::*;
use crate::runtime::logical_thread::Frame;
use std::sync::atomic::{AtomicU64, Ordering::SeqCst};
use tokio::sync::mpsc;

/// Per-process registry of logical threads.
///
/// Routes every inbound message to the conversation it belongs to, starting
/// a new conversation for a request bearing an unknown id. Owns the
/// process's connection table and the single log sink.
pub struct LogicalThreadManager {
    process_name: String,
    own_connection: ConnectionId,
    runtime: tokio::runtime::Handle,
    dispatch_table: Arc<DispatchTable>,
    logger: SharedLogger,
    next_counter: AtomicU64,
    next_instance: AtomicU64,
    registry: RwLock<Registry>,
    connections: RwLock<HashMap<ConnectionId, Connection>>,
    disconnect_listeners: RwLock<Vec<DisconnectListener>>,
    weak_self: Weak<LogicalThreadManager>,
}

#[derive(Default)]
struct Registry {
    logical_threads: HashMap<LogicalThreadId, ThreadEntry>,
    external: Option<LogicalThreadId>,
}

struct ThreadEntry {
    // distinguishes a retiring thread from its successor under the same id
    instance: u64,
    inbox: mpsc::UnboundedSender<Message>,
}

////////////////
impl LogicalThreadManager {
    pub fn new(
        process_name: impl Into<String>,
        runtime: tokio::runtime::Handle,
        dispatch_table: DispatchTable,
        sink: Box<dyn Logger>,
    ) -> Arc<Self> {
        let process_name = process_name.into();
        let own_connection = ConnectionId::fresh();
        let logger = SharedLogger::new(sink).with_prefix(&process_name);
        Arc::new_cyclic(|weak_self| Self {
            process_name,
            own_connection,
            runtime,
            dispatch_table: Arc::new(dispatch_table),
            logger,
            next_counter: AtomicU64::new(0),
            next_instance: AtomicU64::new(0),
            registry: Default::default(),
            connections: Default::default(),
            disconnect_listeners: Default::default(),
            weak_self: weak_self.clone(),
        })
    }
    pub fn process_name(&self) -> &str {
        &self.process_name
    }
    /// The id under which this process originates conversations and
    /// dispatches requests to itself.
    pub fn own_connection(&self) -> ConnectionId {
        self.own_connection
    }
    pub fn runtime(&self) -> &tokio::runtime::Handle {
        &self.runtime
    }
    pub(crate) fn dispatch_table(&self) -> &Arc<DispatchTable> {
        &self.dispatch_table
    }
    pub fn logger(&self) -> SharedLogger {
        self.logger.clone()
    }
    fn this(&self) -> Result<Arc<Self>, RuntimeError> {
        self.weak_self.upgrade().ok_or_else(|| RuntimeError::fault("manager is shutting down"))
    }

    pub fn create_logical_thread_id(&self) -> LogicalThreadId {
        LogicalThreadId::new(self.own_connection, self.next_counter.fetch_add(1, SeqCst))
    }
    fn register(&self, id: LogicalThreadId) -> (u64, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let instance = self.next_instance.fetch_add(1, SeqCst);
        write_lock(&self.registry)
            .logical_threads
            .insert(id, ThreadEntry { instance, inbox: tx });
        (instance, rx)
    }

    /// Registers a fresh conversation originated by this process. The caller
    /// drives it; dropping it retires the conversation.
    pub fn logical_thread_initiated(self: &Arc<Self>) -> LogicalThread {
        let id = self.create_logical_thread_id();
        let (instance, inbox) = self.register(id);
        let mut thread = LogicalThread::new(self, id, instance, inbox);
        thread.request_started(Frame::Origin(self.own_connection));
        log!(self.logger(), "initiated {:?}", id);
        thread
    }
    /// Runs `f` on a freshly initiated conversation as a task of the worker pool.
    pub fn spawn_initiated<F, Fut>(self: &Arc<Self>, f: F) -> tokio::task::JoinHandle<Fut::Output>
    where
        F: FnOnce(LogicalThread) -> Fut,
        Fut: std::future::Future + Send + 'static,
        Fut::Output: Send + 'static,
    {
        let thread = self.logical_thread_initiated();
        self.runtime.spawn(f(thread))
    }
    /// The conversation of the calling OS thread. At most one may exist at a time.
    pub fn external_logical_thread_initiated(
        self: &Arc<Self>,
    ) -> Result<ExternalLogicalThread, RuntimeError> {
        let id = self.create_logical_thread_id();
        let (tx, rx) = mpsc::unbounded_channel();
        let instance = self.next_instance.fetch_add(1, SeqCst);
        {
            let mut registry = write_lock(&self.registry);
            if let Some(existing) = registry.external {
                return Err(RuntimeError::fault(format!(
                    "external logical thread {:?} already exists",
                    existing
                )));
            }
            registry.external = Some(id);
            registry.logical_threads.insert(id, ThreadEntry { instance, inbox: tx });
        }
        Ok(ExternalLogicalThread::new(self, id, instance, rx))
    }

    /// Routes an inbound message, already stamped with the connection it
    /// arrived on, to its conversation.
    pub fn dispatch(&self, msg: Message) {
        let id = msg.logical_thread_id;
        let msg = match read_lock(&self.registry).logical_threads.get(&id) {
            Some(entry) => match entry.inbox.send(msg) {
                Ok(()) => return,
                Err(mpsc::error::SendError(msg)) => msg,
            },
            None => msg,
        };
        if !msg.is_request() {
            log!(self.logger(), "dropping {:?} for unknown {:?}", msg.kind(), id);
            return;
        }
        self.join_logical_thread(msg);
    }
    // starts a conversation to service a request bearing an unknown id
    fn join_logical_thread(&self, msg: Message) {
        let this = match self.this() {
            Ok(this) => this,
            Err(_) => return,
        };
        let id = msg.logical_thread_id;
        let kind = msg.kind();
        let (tx, rx) = mpsc::unbounded_channel();
        let instance = self.next_instance.fetch_add(1, SeqCst);
        {
            let mut registry = write_lock(&self.registry);
            if let Some(entry) = registry.logical_threads.get(&id) {
                // another transport joined it first
                if let Err(mpsc::error::SendError(msg)) = entry.inbox.send(msg) {
                    log!(self.logger(), "dropping {:?} for retired {:?}", msg.kind(), id);
                }
                return;
            }
            // queued before any later message for the same id can be
            let _ = tx.send(msg);
            registry.logical_threads.insert(id, ThreadEntry { instance, inbox: tx });
        }
        log!(self.logger(), "joined {:?} for {:?}", id, kind);
        let thread = LogicalThread::new(&this, id, instance, rx);
        self.runtime.spawn(thread.run());
    }

    // Deregisters a retiring conversation and re-dispatches any request that
    // reached it too late to be serviced.
    pub(crate) fn logical_thread_completed(
        &self,
        id: LogicalThreadId,
        instance: u64,
        inbox: &mut mpsc::UnboundedReceiver<Message>,
        mut leftovers: Vec<Message>,
    ) {
        {
            let mut registry = write_lock(&self.registry);
            if registry.logical_threads.get(&id).map(|entry| entry.instance) == Some(instance) {
                registry.logical_threads.remove(&id);
            }
            if registry.external == Some(id) {
                registry.external = None;
            }
            inbox.close();
        }
        while let Ok(msg) = inbox.try_recv() {
            leftovers.push(msg);
        }
        for msg in leftovers {
            if msg.is_request() {
                self.dispatch(msg);
            }
        }
    }

    /// Tells every conversation that `connection` is gone. Those waiting on
    /// it fail with `Disconnection`; the rest ignore it.
    pub fn on_disconnect(&self, connection: ConnectionId) {
        let removed = write_lock(&self.connections).remove(&connection).is_some();
        log!(self.logger(), "disconnect {:?} known={}", connection, removed);
        for (id, entry) in read_lock(&self.registry).logical_threads.iter() {
            let _ = entry.inbox.send(Message::disconnect(*id, connection));
        }
        let listeners = read_lock(&self.disconnect_listeners).clone();
        for listener in listeners {
            listener(connection);
        }
    }
    pub(crate) fn add_disconnect_listener(&self, listener: DisconnectListener) {
        write_lock(&self.disconnect_listeners).push(listener);
    }

    /// Ids of every live conversation, in ascending order.
    pub fn report_logical_threads(&self) -> Vec<LogicalThreadId> {
        let mut ids: Vec<_> = read_lock(&self.registry).logical_threads.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn connection_established(&self, connection: Connection) {
        let id = connection.connection_id();
        log!(@ENDPT, self.logger(), "connection {:?} established", id);
        write_lock(&self.connections).insert(id, connection);
    }
    pub fn connection(&self, id: ConnectionId) -> Option<Connection> {
        read_lock(&self.connections).get(&id).cloned()
    }
    pub fn connections(&self) -> Vec<Connection> {
        read_lock(&self.connections).values().cloned().collect()
    }
}
impl Debug for LogicalThreadManager {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        f.debug_struct("LogicalThreadManager")
            .field("process_name", &self.process_name)
            .field("own_connection", &self.own_connection)
            .field("dispatch_table", &self.dispatch_table)
            .finish()
    }
}
