use super::*;
use crate::runtime::message::MsgBody;
use futures_util::FutureExt;
use tokio::sync::mpsc;

/// Where a conversation is, as seen from the task running it.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum LogicalThreadState {
    Idle,
    AwaitingInboundRequest,
    DispatchingRequest,
    AwaitingNestedResponse,
}

// One entry of the nesting stack. Each names the connection the frame
// answers to (inbound) or waits on (outbound).
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub(crate) enum Frame {
    // the conversation was started by this process
    Origin(ConnectionId),
    // servicing a request that arrived on this connection
    Inbound(ConnectionId),
    // waiting for the response to a request sent on this connection
    Outbound(ConnectionId),
}

/// State machine of one conversation within one process.
///
/// Owned exclusively by the task that runs it; the manager holds only the
/// sending half of its inbox. Dropping it retires the conversation.
pub struct LogicalThread {
    id: LogicalThreadId,
    instance: u64,
    manager: Weak<LogicalThreadManager>,
    dispatch_table: Arc<DispatchTable>,
    inbox: mpsc::UnboundedReceiver<Message>,
    pub(crate) logger: SharedLogger,
    stack: Vec<Frame>,
    disconnections: HashSet<ConnectionId>,
    // held back while a nested request is outstanding
    deferred_messages: VecDeque<Message>,
    // released again, consumed before the inbox
    unqueued_messages: VecDeque<Message>,
    receiving: bool,
}

/// A conversation driven from a plain OS thread rather than a task.
///
/// Receives block the calling thread, so it must never be used from within
/// the async runtime. It cannot service inbound requests; any that arrive
/// are answered with an error.
pub struct ExternalLogicalThread {
    id: LogicalThreadId,
    instance: u64,
    manager: Weak<LogicalThreadManager>,
    inbox: mpsc::UnboundedReceiver<Message>,
    logger: SharedLogger,
}

fn panic_description(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("handler panicked: {}", s)
    } else {
        "handler panicked".into()
    }
}

//////////////////////////////
impl Frame {
    fn connection(self) -> ConnectionId {
        match self {
            Frame::Origin(c) | Frame::Inbound(c) | Frame::Outbound(c) => c,
        }
    }
}
impl LogicalThread {
    pub(crate) fn new(
        manager: &Arc<LogicalThreadManager>,
        id: LogicalThreadId,
        instance: u64,
        inbox: mpsc::UnboundedReceiver<Message>,
    ) -> Self {
        Self {
            id,
            instance,
            manager: Arc::downgrade(manager),
            dispatch_table: manager.dispatch_table().clone(),
            inbox,
            logger: manager.logger().with_prefix(id),
            stack: vec![],
            disconnections: Default::default(),
            deferred_messages: Default::default(),
            unqueued_messages: Default::default(),
            receiving: false,
        }
    }
    pub fn id(&self) -> LogicalThreadId {
        self.id
    }
    pub fn state(&self) -> LogicalThreadState {
        use LogicalThreadState as Lts;
        match self.stack.last() {
            Some(Frame::Outbound(_)) => Lts::AwaitingNestedResponse,
            Some(Frame::Inbound(_)) if !self.receiving => Lts::DispatchingRequest,
            _ if self.receiving => Lts::AwaitingInboundRequest,
            _ => Lts::Idle,
        }
    }
    pub fn stack_size(&self) -> usize {
        self.stack.len()
    }
    /// Connection of the innermost frame.
    pub fn stack_connection(&self) -> Option<ConnectionId> {
        self.stack.last().map(|frame| frame.connection())
    }
    /// Connection the request being serviced arrived on.
    pub fn requester(&self) -> Option<ConnectionId> {
        self.stack.iter().rev().find_map(|frame| match frame {
            Frame::Inbound(c) => Some(*c),
            _ => None,
        })
    }
    pub fn manager(&self) -> Result<Arc<LogicalThreadManager>, RuntimeError> {
        self.manager.upgrade().ok_or_else(|| RuntimeError::fault("logical thread manager is gone"))
    }

    /// Sends `request` on `connection` and waits for its response, servicing
    /// inbound requests of this conversation in the meantime.
    pub async fn request(
        &mut self,
        connection: &Connection,
        request: Request,
    ) -> Result<Response, RuntimeError> {
        let connection_id = connection.connection_id();
        log!(self.logger, "request {:?} on {:?}", request.kind(), connection_id);
        connection.send(Message::request(self.id, request))?;
        self.request_started(Frame::Outbound(connection_id));
        let result = self.dispatch_requests_until_response().await;
        self.request_completed();
        result
    }
    /// As `request`, resolving the connection through the manager.
    pub async fn request_on(
        &mut self,
        connection_id: ConnectionId,
        request: Request,
    ) -> Result<Response, RuntimeError> {
        let connection = self
            .manager()?
            .connection(connection_id)
            .ok_or(RuntimeError::ChannelClosed { connection: connection_id })?;
        self.request(&connection, request).await
    }
    /// Services `request` with this process's own handlers, as if it had
    /// arrived from the process itself.
    pub async fn dispatch_local(&mut self, request: Request) -> Result<Response, RuntimeError> {
        let own = self.manager()?.own_connection();
        let depth = self.stack.len();
        self.request_started(Frame::Inbound(own));
        let result = self.dispatch_inbound_request(request).await;
        self.stack.truncate(depth + 1);
        self.request_completed();
        result
    }

    /// Receives until the response to the innermost outbound request
    /// arrives. Inbound requests are dispatched in full on the way.
    pub async fn dispatch_requests_until_response(&mut self) -> Result<Response, RuntimeError> {
        let waiting_on = match self.stack.last() {
            Some(Frame::Outbound(c)) => *c,
            frame => {
                return Err(RuntimeError::fault(format!(
                    "{:?} waits for a response without a request, innermost {:?}",
                    self.id, frame
                )))
            }
        };
        loop {
            self.check_disconnected()?;
            let msg = self.receive_deferred().await?;
            let sender = msg.sender_connection;
            match msg.body {
                MsgBody::Request(..) => self.acknowledge_inbound_request(msg).await?,
                MsgBody::Disconnect => {} // recorded on receipt
                MsgBody::Response(response) if sender == waiting_on => return Ok(response),
                MsgBody::Error(error) if sender == waiting_on => return Err(error),
                body => log!(self.logger, "dropping stray {:?} from {:?}", body, sender),
            }
        }
    }

    // A lost connection anywhere in the stack cancels every frame above it,
    // so the innermost wait fails and the frames unwind one by one.
    fn check_disconnected(&self) -> Result<(), RuntimeError> {
        let lost = self
            .stack
            .iter()
            .rev()
            .map(|frame| frame.connection())
            .find(|connection| self.disconnections.contains(connection));
        match lost {
            Some(connection) => {
                Err(RuntimeError::Disconnection { logical_thread_id: self.id, connection })
            }
            None => Ok(()),
        }
    }

    pub(crate) fn request_started(&mut self, frame: Frame) {
        self.stack.push(frame);
    }
    pub(crate) fn request_completed(&mut self) {
        self.stack.pop();
        let stack = &self.stack;
        self.disconnections.retain(|c| stack.iter().any(|frame| frame.connection() == *c));
        self.unqueue();
    }

    // enabled while the innermost frame is an outbound request nested inside
    // another request frame
    fn queueing_enabled(&self) -> bool {
        let request_frames = self.stack.iter().filter(|f| !matches!(f, Frame::Origin(_))).count();
        matches!(self.stack.last(), Some(Frame::Outbound(_))) && request_frames >= 2
    }
    // Some(msg) when it must be handled now
    fn queue(&mut self, msg: Message) -> Option<Message> {
        if !self.queueing_enabled() || !msg.is_request() {
            return Some(msg);
        }
        if self.stack_connection() == Some(msg.sender_connection) {
            // a callback of the request being waited on
            return Some(msg);
        }
        log!(self.logger, "deferring {:?} from {:?}", msg.kind(), msg.sender_connection);
        self.deferred_messages.push_back(msg);
        None
    }
    // releases deferred messages ahead of anything still in the inbox
    fn unqueue(&mut self) {
        while let Some(msg) = self.deferred_messages.pop_back() {
            self.unqueued_messages.push_front(msg);
        }
    }

    async fn receive_deferred(&mut self) -> Result<Message, RuntimeError> {
        loop {
            let msg = match self.unqueued_messages.pop_front() {
                Some(msg) => msg,
                None => {
                    self.receiving = true;
                    let received = self.inbox.recv().await;
                    self.receiving = false;
                    received.ok_or(RuntimeError::ChannelClosed {
                        connection: self.id.owning_connection,
                    })?
                }
            };
            if let MsgBody::Disconnect = msg.body {
                self.note_disconnect(msg.sender_connection);
            }
            if let Some(msg) = self.queue(msg) {
                return Ok(msg);
            }
        }
    }
    fn note_disconnect(&mut self, connection: ConnectionId) {
        if self.stack.iter().any(|frame| frame.connection() == connection) {
            log!(self.logger, "lost {:?} with stack {:?}", connection, self.stack);
            self.disconnections.insert(connection);
        }
    }

    async fn dispatch_inbound_request(&mut self, request: Request) -> Result<Response, RuntimeError> {
        let kind = request.kind();
        let handler =
            self.dispatch_table.get(kind).ok_or(RuntimeError::DispatchFailure { kind })?;
        match std::panic::AssertUnwindSafe(handler.handle(self, request)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => Err(RuntimeError::Fault(panic_description(&*panic))),
        }
    }

    // Services one inbound request and answers it. Only a fatal error is
    // returned; any other failure becomes the error-response.
    async fn acknowledge_inbound_request(&mut self, msg: Message) -> Result<(), RuntimeError> {
        let requester = msg.sender_connection;
        let request = match msg.body {
            MsgBody::Request(request) => request,
            body => return Err(RuntimeError::fault(format!("not a request: {:?}", body))),
        };
        let kind = request.kind();
        log!(self.logger, "servicing {:?} from {:?}", kind, requester);
        let depth = self.stack.len();
        self.request_started(Frame::Inbound(requester));
        let result = self.dispatch_inbound_request(request).await;
        // a handler that panicked mid-request leaves its frames behind
        self.stack.truncate(depth + 1);
        let fatal = match &result {
            Err(error) if error.is_fatal() => Some(error.clone()),
            _ => None,
        };
        let reply = match result {
            Ok(response) => Message::response(self.id, response),
            Err(error) => {
                log!(self.logger, "{:?} from {:?} failed: {}", kind, requester, error);
                Message::error(self.id, error)
            }
        };
        self.send_to(requester, reply);
        self.request_completed();
        match fatal {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn send_to(&mut self, connection_id: ConnectionId, msg: Message) {
        let connection = self.manager.upgrade().and_then(|m| m.connection(connection_id));
        let result = match connection {
            Some(connection) => connection.send(msg),
            None => Err(RuntimeError::UnknownConnection(connection_id)),
        };
        if let Err(error) = result {
            log!(self.logger, "reply to {:?} lost: {}", connection_id, error);
        }
    }

    /// One receive and full dispatch cycle.
    pub async fn run_one(&mut self) -> Result<(), RuntimeError> {
        self.unqueue();
        let msg = self.receive_deferred().await?;
        match msg.body {
            MsgBody::Request(..) => self.acknowledge_inbound_request(msg).await,
            MsgBody::Disconnect => Ok(()),
            body => {
                log!(self.logger, "dropping stray {:?} from {:?}", body, msg.sender_connection);
                Ok(())
            }
        }
    }
    /// Entry point of a joined conversation: services inbound requests until
    /// nothing is left, then retires.
    pub(crate) async fn run(mut self) {
        loop {
            if let Err(error) = self.run_one().await {
                log!(self.logger, "retiring after {}", error);
                break;
            }
            if self.stack.is_empty()
                && self.deferred_messages.is_empty()
                && self.unqueued_messages.is_empty()
            {
                break;
            }
        }
    }
}
impl Drop for LogicalThread {
    fn drop(&mut self) {
        let leftovers: Vec<Message> =
            self.unqueued_messages.drain(..).chain(self.deferred_messages.drain(..)).collect();
        if let Some(manager) = self.manager.upgrade() {
            manager.logical_thread_completed(self.id, self.instance, &mut self.inbox, leftovers);
        }
    }
}
impl Debug for LogicalThread {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        f.debug_struct("LogicalThread")
            .field("id", &self.id)
            .field("stack", &self.stack)
            .field("deferred", &self.deferred_messages.len())
            .field("unqueued", &self.unqueued_messages.len())
            .finish()
    }
}

impl ExternalLogicalThread {
    pub(crate) fn new(
        manager: &Arc<LogicalThreadManager>,
        id: LogicalThreadId,
        instance: u64,
        inbox: mpsc::UnboundedReceiver<Message>,
    ) -> Self {
        Self {
            id,
            instance,
            manager: Arc::downgrade(manager),
            inbox,
            logger: manager.logger().with_prefix(format!("{:?}(ext)", id)),
        }
    }
    pub fn id(&self) -> LogicalThreadId {
        self.id
    }
    /// Sends `request` and blocks the calling OS thread until its response.
    pub fn request_blocking(
        &mut self,
        connection: &Connection,
        request: Request,
    ) -> Result<Response, RuntimeError> {
        let waiting_on = connection.connection_id();
        connection.send(Message::request(self.id, request))?;
        loop {
            let msg = self
                .inbox
                .blocking_recv()
                .ok_or(RuntimeError::ChannelClosed { connection: self.id.owning_connection })?;
            let sender = msg.sender_connection;
            match msg.body {
                MsgBody::Response(response) if sender == waiting_on => return Ok(response),
                MsgBody::Error(error) if sender == waiting_on => return Err(error),
                MsgBody::Disconnect if sender == waiting_on => {
                    return Err(RuntimeError::Disconnection {
                        logical_thread_id: self.id,
                        connection: waiting_on,
                    })
                }
                MsgBody::Request(request) => {
                    log!(self.logger, "refusing {:?} from {:?}", request.kind(), sender);
                    let error =
                        RuntimeError::fault("external logical thread cannot service requests");
                    let connection = self.manager.upgrade().and_then(|m| m.connection(sender));
                    let result = match connection {
                        Some(connection) => connection.send(Message::error(self.id, error)),
                        None => Err(RuntimeError::UnknownConnection(sender)),
                    };
                    if let Err(error) = result {
                        log!(self.logger, "refusal to {:?} lost: {}", sender, error);
                    }
                }
                body => log!(self.logger, "dropping stray {:?} from {:?}", body, sender),
            }
        }
    }
}
impl Drop for ExternalLogicalThread {
    fn drop(&mut self) {
        if let Some(manager) = self.manager.upgrade() {
            manager.logical_thread_completed(self.id, self.instance, &mut self.inbox, vec![]);
        }
    }
}
impl Debug for ExternalLogicalThread {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        f.debug_struct("ExternalLogicalThread").field("id", &self.id).finish()
    }
}
