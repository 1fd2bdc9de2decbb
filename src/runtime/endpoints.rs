//! Transports: in-process virtual links between managers, and TCP sockets
//! driven by a mio reactor on a dedicated OS thread. Both stamp every
//! received message with the receiving side's connection id and hand it to
//! `LogicalThreadManager::dispatch`.

use super::*;
use crate::runtime::message;
use mio::{
    net::{TcpListener, TcpStream},
    Events, Interest, Poll, Token, Waker,
};
use std::sync::atomic::{AtomicBool, Ordering::SeqCst};
use tokio::sync::mpsc;

/// A pair of in-process connections joining two managers.
#[derive(Debug)]
pub struct VirtualLink {
    sides: [(Weak<LogicalThreadManager>, ConnectionId); 2],
    closed: Arc<AtomicBool>,
}

#[derive(Debug)]
struct VirtualSender {
    connection: ConnectionId,
    // the id the peer knows this link by
    peer_connection: ConnectionId,
    peer: Weak<LogicalThreadManager>,
    closed: Arc<AtomicBool>,
}

/// TCP transport of one manager: a listener (optional) and any number of
/// connected streams, multiplexed by one mio poll loop.
pub struct NetReactor {
    manager: Weak<LogicalThreadManager>,
    commands: mpsc::UnboundedSender<Command>,
    waker: Arc<Waker>,
    local_addr: Option<SocketAddr>,
    thread: Option<std::thread::JoinHandle<()>>,
}

#[derive(Debug)]
struct NetSender {
    connection: ConnectionId,
    commands: mpsc::UnboundedSender<Command>,
    waker: Arc<Waker>,
    closed: Arc<AtomicBool>,
}

enum Command {
    Adopt { stream: TcpStream, connection: ConnectionId, closed: Arc<AtomicBool> },
    Send { connection: ConnectionId, bytes: Vec<u8> },
    Close { connection: ConnectionId },
    Shutdown,
}

struct NetEndpoint {
    stream: TcpStream,
    connection: ConnectionId,
    inbox: Vec<u8>,
    outbox: Vec<u8>,
    closed: Arc<AtomicBool>,
}

struct Reactor {
    poll: Poll,
    listener: Option<TcpListener>,
    endpoints: HashMap<Token, NetEndpoint>,
    tokens: HashMap<ConnectionId, Token>,
    next_token: usize,
    commands: mpsc::UnboundedReceiver<Command>,
    command_sender: mpsc::UnboundedSender<Command>,
    waker: Arc<Waker>,
    manager: Weak<LogicalThreadManager>,
    logger: SharedLogger,
}

struct DenseDebugHex<'a>(pub &'a [u8]);

const WAKER: Token = Token(0);
const LISTENER: Token = Token(1);
const FIRST_ENDPOINT: usize = 2;

fn err_would_block(err: &std::io::Error) -> bool {
    err.kind() == std::io::ErrorKind::WouldBlock
}
fn err_interrupted(err: &std::io::Error) -> bool {
    err.kind() == std::io::ErrorKind::Interrupted
}

/////////////////////
impl VirtualLink {
    /// Joins `a` and `b`, registering one sender in each.
    pub fn connect(a: &Arc<LogicalThreadManager>, b: &Arc<LogicalThreadManager>) -> Self {
        let closed = Arc::new(AtomicBool::new(false));
        let (a_side, b_side) = (ConnectionId::fresh(), ConnectionId::fresh());
        a.connection_established(Arc::new(VirtualSender {
            connection: a_side,
            peer_connection: b_side,
            peer: Arc::downgrade(b),
            closed: closed.clone(),
        }));
        b.connection_established(Arc::new(VirtualSender {
            connection: b_side,
            peer_connection: a_side,
            peer: Arc::downgrade(a),
            closed: closed.clone(),
        }));
        Self { sides: [(Arc::downgrade(a), a_side), (Arc::downgrade(b), b_side)], closed }
    }
    /// Id of the link within the first manager passed to `connect`.
    pub fn a_side(&self) -> ConnectionId {
        self.sides[0].1
    }
    /// Id of the link within the second manager passed to `connect`.
    pub fn b_side(&self) -> ConnectionId {
        self.sides[1].1
    }
    /// Severs the link; both managers observe a disconnect. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, SeqCst) {
            return;
        }
        for (manager, connection) in self.sides.iter() {
            if let Some(manager) = manager.upgrade() {
                manager.on_disconnect(*connection);
            }
        }
    }
}
impl Sender for VirtualSender {
    fn connection_id(&self) -> ConnectionId {
        self.connection
    }
    fn send(&self, msg: Message) -> Result<(), RuntimeError> {
        let closed = RuntimeError::ChannelClosed { connection: self.connection };
        if self.closed.load(SeqCst) {
            return Err(closed);
        }
        let peer = self.peer.upgrade().ok_or(closed)?;
        peer.dispatch(msg.received_on(self.peer_connection));
        Ok(())
    }
}

impl NetReactor {
    /// Starts the reactor thread of `manager`, listening on `listen` if given.
    pub fn spawn(
        manager: &Arc<LogicalThreadManager>,
        listen: Option<SocketAddr>,
    ) -> Result<Self, TransportError> {
        use TransportError as Te;
        let poll = Poll::new().map_err(Te::PollInitFailed)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER).map_err(Te::PollInitFailed)?);
        let listener = match listen {
            Some(addr) => {
                let mut listener = TcpListener::bind(addr).map_err(|e| Te::BindFailed(addr, e))?;
                poll.registry()
                    .register(&mut listener, LISTENER, Interest::READABLE)
                    .map_err(|e| Te::BindFailed(addr, e))?;
                Some(listener)
            }
            None => None,
        };
        let local_addr = listener.as_ref().and_then(|listener| listener.local_addr().ok());
        let (command_sender, commands) = mpsc::unbounded_channel();
        let reactor = Reactor {
            poll,
            listener,
            endpoints: Default::default(),
            tokens: Default::default(),
            next_token: FIRST_ENDPOINT,
            commands,
            command_sender: command_sender.clone(),
            waker: waker.clone(),
            manager: Arc::downgrade(manager),
            logger: manager.logger().with_prefix("net"),
        };
        let thread = std::thread::Builder::new()
            .name(format!("{}-net", manager.process_name()))
            .spawn(move || reactor.run())
            .map_err(Te::PollInitFailed)?;
        Ok(Self {
            manager: Arc::downgrade(manager),
            commands: command_sender,
            waker,
            local_addr,
            thread: Some(thread),
        })
    }
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }
    /// Connects to a listening reactor and registers the new connection with
    /// the manager.
    pub fn connect(&self, addr: SocketAddr) -> Result<Connection, TransportError> {
        use TransportError as Te;
        let manager = self.manager.upgrade().ok_or(Te::ReactorGone)?;
        let stream = std::net::TcpStream::connect(addr).map_err(|e| Te::ConnectFailed(addr, e))?;
        stream.set_nonblocking(true).map_err(|e| Te::ConnectFailed(addr, e))?;
        let _ = stream.set_nodelay(true);
        let connection = ConnectionId::fresh();
        let closed = Arc::new(AtomicBool::new(false));
        let adopt =
            Command::Adopt { stream: TcpStream::from_std(stream), connection, closed: closed.clone() };
        self.commands.send(adopt).map_err(|_| Te::ReactorGone)?;
        self.waker.wake().map_err(|_| Te::ReactorGone)?;
        let sender: Connection = Arc::new(NetSender {
            connection,
            commands: self.commands.clone(),
            waker: self.waker.clone(),
            closed,
        });
        manager.connection_established(sender.clone());
        Ok(sender)
    }
    /// Drops the stream of `connection`; both ends observe a disconnect.
    pub fn close(&self, connection: ConnectionId) {
        if self.commands.send(Command::Close { connection }).is_ok() {
            let _ = self.waker.wake();
        }
    }
    /// Closes every stream and stops the reactor thread.
    pub fn shutdown(mut self) {
        self.stop();
    }
    fn stop(&mut self) {
        if self.commands.send(Command::Shutdown).is_ok() {
            let _ = self.waker.wake();
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
impl Drop for NetReactor {
    fn drop(&mut self) {
        self.stop();
    }
}
impl Debug for NetReactor {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        f.debug_struct("NetReactor").field("local_addr", &self.local_addr).finish()
    }
}
impl Sender for NetSender {
    fn connection_id(&self) -> ConnectionId {
        self.connection
    }
    fn send(&self, msg: Message) -> Result<(), RuntimeError> {
        let closed = RuntimeError::ChannelClosed { connection: self.connection };
        if self.closed.load(SeqCst) {
            return Err(closed);
        }
        let bytes = message::encode(&msg)
            .map_err(|_| RuntimeError::fault(format!("cannot encode {:?}", msg.kind())))?;
        self.commands.send(Command::Send { connection: self.connection, bytes }).map_err(|_| closed)?;
        let _ = self.waker.wake();
        Ok(())
    }
}

impl Reactor {
    fn run(mut self) {
        let mut events = Events::with_capacity(64);
        loop {
            if let Err(e) = self.poll.poll(&mut events, None) {
                if err_interrupted(&e) {
                    continue;
                }
                log!(self.logger, "poll failed: {}", e);
                break;
            }
            let ready: Vec<(Token, bool, bool)> = events
                .iter()
                .map(|event| {
                    let readable = event.is_readable() || event.is_read_closed() || event.is_error();
                    (event.token(), readable, event.is_writable())
                })
                .collect();
            for (token, readable, writable) in ready {
                match token {
                    WAKER => {
                        if !self.drain_commands() {
                            return;
                        }
                    }
                    LISTENER => self.accept_all(),
                    token => {
                        if writable {
                            self.flush(token);
                        }
                        if readable {
                            self.receive(token);
                        }
                    }
                }
            }
            if self.manager.upgrade().is_none() {
                break;
            }
        }
        self.close_all();
    }

    // false once told to stop
    fn drain_commands(&mut self) -> bool {
        while let Ok(command) = self.commands.try_recv() {
            match command {
                Command::Adopt { stream, connection, closed } => {
                    self.adopt(stream, connection, closed)
                }
                Command::Send { connection, bytes } => match self.tokens.get(&connection) {
                    Some(&token) => {
                        if let Some(endpoint) = self.endpoints.get_mut(&token) {
                            endpoint.outbox.extend_from_slice(&bytes);
                        }
                        self.flush(token);
                    }
                    None => log!(@ENDPT, self.logger, "send on closed {:?}", connection),
                },
                Command::Close { connection } => {
                    if let Some(&token) = self.tokens.get(&connection) {
                        self.disconnect(token);
                    }
                }
                Command::Shutdown => {
                    self.close_all();
                    return false;
                }
            }
        }
        true
    }

    fn accept_all(&mut self) {
        loop {
            let accepted = match &self.listener {
                Some(listener) => listener.accept(),
                None => return,
            };
            match accepted {
                Ok((stream, peer)) => {
                    let _ = stream.set_nodelay(true);
                    let connection = ConnectionId::fresh();
                    let closed = Arc::new(AtomicBool::new(false));
                    log!(@ENDPT, self.logger, "accepted {:?} from {}", connection, peer);
                    if let Some(manager) = self.manager.upgrade() {
                        manager.connection_established(Arc::new(NetSender {
                            connection,
                            commands: self.command_sender.clone(),
                            waker: self.waker.clone(),
                            closed: closed.clone(),
                        }));
                    }
                    self.adopt(stream, connection, closed);
                }
                Err(e) if err_would_block(&e) => return,
                Err(e) if err_interrupted(&e) => continue,
                Err(e) => {
                    log!(self.logger, "accept failed: {}", e);
                    return;
                }
            }
        }
    }

    fn adopt(&mut self, mut stream: TcpStream, connection: ConnectionId, closed: Arc<AtomicBool>) {
        let token = Token(self.next_token);
        self.next_token += 1;
        let interest = Interest::READABLE.add(Interest::WRITABLE);
        if let Err(e) = self.poll.registry().register(&mut stream, token, interest) {
            log!(self.logger, "cannot register {:?}: {}", connection, e);
            closed.store(true, SeqCst);
            if let Some(manager) = self.manager.upgrade() {
                manager.on_disconnect(connection);
            }
            return;
        }
        self.tokens.insert(connection, token);
        let endpoint = NetEndpoint { stream, connection, inbox: vec![], outbox: vec![], closed };
        self.endpoints.insert(token, endpoint);
        // data may have arrived before registration
        self.receive(token);
    }

    // Reads until the socket would block, then dispatches every complete
    // message in the inbox.
    fn receive(&mut self, token: Token) {
        let endpoint = match self.endpoints.get_mut(&token) {
            Some(endpoint) => endpoint,
            None => return,
        };
        let before_len = endpoint.inbox.len();
        let mut broken = false;
        let mut buf = [0u8; 4096];
        loop {
            match endpoint.stream.read(&mut buf) {
                Ok(0) => {
                    broken = true;
                    break;
                }
                Ok(n) => endpoint.inbox.extend_from_slice(&buf[..n]),
                Err(e) if err_would_block(&e) => break,
                Err(e) if err_interrupted(&e) => continue,
                Err(_) => {
                    broken = true;
                    break;
                }
            }
        }
        log!(
            @ENDPT,
            self.logger,
            "{:?} inbox [{:?}| {:?}]",
            endpoint.connection,
            DenseDebugHex(&endpoint.inbox[..before_len]),
            DenseDebugHex(&endpoint.inbox[before_len..]),
        );
        let mut received = vec![];
        loop {
            match message::decode(&endpoint.inbox) {
                Ok(Some((msg, msg_size))) => {
                    endpoint.inbox.drain(..msg_size);
                    received.push(msg.received_on(endpoint.connection));
                }
                Ok(None) => break,
                Err(message::MalformedMessage) => {
                    log!(self.logger, "malformed message on {:?}", endpoint.connection);
                    broken = true;
                    break;
                }
            }
        }
        if let Some(manager) = self.manager.upgrade() {
            for msg in received {
                manager.dispatch(msg);
            }
        }
        if broken {
            self.disconnect(token);
        }
    }

    fn flush(&mut self, token: Token) {
        let endpoint = match self.endpoints.get_mut(&token) {
            Some(endpoint) => endpoint,
            None => return,
        };
        let mut broken = false;
        while !endpoint.outbox.is_empty() {
            match endpoint.stream.write(&endpoint.outbox) {
                Ok(0) => {
                    broken = true;
                    break;
                }
                Ok(n) => {
                    endpoint.outbox.drain(..n);
                }
                Err(e) if err_would_block(&e) => break,
                Err(e) if err_interrupted(&e) => continue,
                Err(_) => {
                    broken = true;
                    break;
                }
            }
        }
        if broken {
            self.disconnect(token);
        }
    }

    fn disconnect(&mut self, token: Token) {
        let mut endpoint = match self.endpoints.remove(&token) {
            Some(endpoint) => endpoint,
            None => return,
        };
        let _ = self.poll.registry().deregister(&mut endpoint.stream);
        let _ = endpoint.stream.shutdown(std::net::Shutdown::Both);
        endpoint.closed.store(true, SeqCst);
        self.tokens.remove(&endpoint.connection);
        log!(@ENDPT, self.logger, "disconnected {:?}", endpoint.connection);
        if let Some(manager) = self.manager.upgrade() {
            manager.on_disconnect(endpoint.connection);
        }
    }
    fn close_all(&mut self) {
        let tokens: Vec<Token> = self.endpoints.keys().copied().collect();
        for token in tokens {
            self.disconnect(token);
        }
    }
}

impl Debug for DenseDebugHex<'_> {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        for b in self.0 {
            write!(f, "{:02X?}", b)?;
        }
        Ok(())
    }
}
