//! Process roles. A root at the top, one daemon per machine below it, and
//! leaf processes (terminals, executors hosting simulations, report
//! servers, tools) below their daemon. Each role is a manager with its own
//! dispatch table plus a `Router` that picks the connection a request for
//! some address leaves on.

use super::*;
use crate::runtime::{config::ProcessConfig, lock::LockTable, status::Status};

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, serde::Serialize, serde::Deserialize)]
pub enum LeafKind {
    Terminal,
    Executor,
    Report,
    Tool,
}

/// Address a request is meant for.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Target {
    Root,
    Daemon,
    Mp(MP),
    Mpo(MPO),
}

/// Routing envelope wrapped around a request addressed beyond the next hop.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Envelope {
    Root(MP),
    Up(MP),
    Down(MP),
    MpoUp(MPO),
    MpoDown(MPO),
}

/// How this process delivers a request for some `Target`.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Route {
    Local,
    Direct(ConnectionId),
    Wrapped { connection: ConnectionId, envelope: Envelope },
}

pub trait Router: Send + Sync {
    fn route(&self, target: Target) -> Result<Route, RuntimeError>;

    fn root_request<'a>(
        &self,
        thread: &'a mut LogicalThread,
    ) -> Result<RequestSender<'a>, RuntimeError> {
        Ok(RequestSender::new(thread, self.route(Target::Root)?))
    }
    fn daemon_request<'a>(
        &self,
        thread: &'a mut LogicalThread,
    ) -> Result<RequestSender<'a>, RuntimeError> {
        Ok(RequestSender::new(thread, self.route(Target::Daemon)?))
    }
    fn mp_request<'a>(
        &self,
        thread: &'a mut LogicalThread,
        mp: MP,
    ) -> Result<RequestSender<'a>, RuntimeError> {
        Ok(RequestSender::new(thread, self.route(Target::Mp(mp))?))
    }
    fn mpo_request<'a>(
        &self,
        thread: &'a mut LogicalThread,
        mpo: MPO,
    ) -> Result<RequestSender<'a>, RuntimeError> {
        Ok(RequestSender::new(thread, self.route(Target::Mpo(mpo))?))
    }
}

/// Stub bound to one address. Every call is a nested request of `thread`
/// and checks that the response is of the kind the request calls for.
pub struct RequestSender<'a> {
    thread: &'a mut LogicalThread,
    route: Route,
}

pub struct Root {
    manager: Arc<LogicalThreadManager>,
    state: Arc<RootState>,
}
pub struct Daemon {
    manager: Arc<LogicalThreadManager>,
    state: Arc<DaemonState>,
}
pub struct Leaf {
    manager: Arc<LogicalThreadManager>,
    state: Arc<LeafState>,
}

#[derive(Debug, Default)]
struct RootState {
    name: String,
    machines: RwLock<BTreeMap<MachineId, ConnectionId>>,
    next_machine: Mutex<U32Stream>,
}
#[derive(Debug, Default)]
struct DaemonState {
    name: String,
    machine: RwLock<Option<MachineId>>,
    root: RwLock<Option<ConnectionId>>,
    leaves: RwLock<BTreeMap<ProcessId, (ConnectionId, LeafKind)>>,
    // process 0 is the daemon itself
    next_process: Mutex<U32Stream>,
}
#[derive(Debug)]
struct LeafState {
    name: String,
    kind: LeafKind,
    mp: RwLock<Option<MP>>,
    daemon: RwLock<Option<ConnectionId>>,
    locks: Option<Arc<LockTable>>,
}

struct RootHandler(Arc<RootState>);
struct DaemonHandler(Arc<DaemonState>);
struct LeafHandler(Arc<LeafState>);

const COMMON_REQUESTS: &[MessageKind] = &[
    MessageKind::PingRequest,
    MessageKind::GetStatusRequest,
    MessageKind::MPRootRequest,
    MessageKind::MPUpRequest,
    MessageKind::MPDownRequest,
    MessageKind::MPODownRequest,
    MessageKind::MPOUpRequest,
];

fn not_enrolled(what: &str) -> RuntimeError {
    RuntimeError::Enrolment(format!("{} is not enrolled", what))
}
fn mismatch(expected: MessageKind, got: &Response) -> RuntimeError {
    RuntimeError::UnexpectedResponse { expected, got: got.kind() }
}
fn pong(name: &str, text: String) -> Response {
    Response::Ping(format!("{} pong {}", name, text))
}
// Each child's status is gathered with a nested request; one unreachable
// child shows up in the tree rather than failing the whole query.
async fn gather_statuses(
    thread: &mut LogicalThread,
    children: Vec<(String, ConnectionId)>,
    gathered: &mut Vec<Status>,
) {
    for (what, connection) in children {
        match thread.request_on(connection, Request::GetStatus(vec![])).await {
            Ok(Response::Status(status)) => gathered.push(status),
            Ok(other) => gathered.push(Status::new(format!("{}: unexpected {:?}", what, other.kind()))),
            Err(error) => gathered.push(Status::new(format!("{}: {}", what, error))),
        }
    }
}
// sends `request` wherever `route` says, as the servicing step of an envelope
async fn forward(
    thread: &mut LogicalThread,
    route: Route,
    request: Request,
) -> Result<Response, RuntimeError> {
    RequestSender::new(thread, route).send(request).await
}

////////////////
impl Envelope {
    pub fn wrap(self, request: Request) -> Request {
        let request = Box::new(request);
        match self {
            Envelope::Root(mp) => Request::MPRoot { request, mp },
            Envelope::Up(mp) => Request::MPUp { request, mp },
            Envelope::Down(mp) => Request::MPDown { request, mp },
            Envelope::MpoUp(mpo) => Request::MPOUp { request, mpo },
            Envelope::MpoDown(mpo) => Request::MPODown { request, mpo },
        }
    }
}

impl<'a> RequestSender<'a> {
    pub fn new(thread: &'a mut LogicalThread, route: Route) -> Self {
        Self { thread, route }
    }
    pub fn route(&self) -> Route {
        self.route
    }
    pub async fn send(&mut self, request: Request) -> Result<Response, RuntimeError> {
        let expected = request.response_kind();
        let response = match self.route {
            Route::Local => self.thread.dispatch_local(request).await?,
            Route::Direct(connection) => self.thread.request_on(connection, request).await?,
            Route::Wrapped { connection, envelope } => {
                self.thread.request_on(connection, envelope.wrap(request)).await?
            }
        };
        if response.kind() != expected {
            return Err(mismatch(expected, &response));
        }
        Ok(response)
    }
    pub async fn ping(&mut self, text: impl Into<String>) -> Result<String, RuntimeError> {
        match self.send(Request::Ping(text.into())).await? {
            Response::Ping(reply) => Ok(reply),
            other => Err(mismatch(MessageKind::PingResponse, &other)),
        }
    }
    pub async fn get_status(&mut self) -> Result<Status, RuntimeError> {
        match self.send(Request::GetStatus(vec![])).await? {
            Response::Status(status) => Ok(status),
            other => Err(mismatch(MessageKind::GetStatusResponse, &other)),
        }
    }
    pub async fn sim_lock_read(&mut self, from: MPO, to: MPO) -> Result<TimeStamp, RuntimeError> {
        match self.send(Request::SimLockRead { from, to }).await? {
            Response::SimLockRead(timestamp) => Ok(timestamp),
            other => Err(mismatch(MessageKind::SimLockReadResponse, &other)),
        }
    }
    pub async fn sim_lock_write(&mut self, from: MPO, to: MPO) -> Result<TimeStamp, RuntimeError> {
        match self.send(Request::SimLockWrite { from, to }).await? {
            Response::SimLockWrite(timestamp) => Ok(timestamp),
            other => Err(mismatch(MessageKind::SimLockWriteResponse, &other)),
        }
    }
    pub async fn sim_lock_release(
        &mut self,
        from: MPO,
        to: MPO,
        transaction: crate::runtime::lock::Transaction,
    ) -> Result<TimeStamp, RuntimeError> {
        match self.send(Request::SimLockRelease { from, to, transaction }).await? {
            Response::SimLockRelease(timestamp) => Ok(timestamp),
            other => Err(mismatch(MessageKind::SimLockReleaseResponse, &other)),
        }
    }
    pub async fn sim_error_check(&mut self, mpo: MPO) -> Result<(), RuntimeError> {
        match self.send(Request::SimErrorCheck(mpo)).await? {
            Response::SimErrorCheck => Ok(()),
            other => Err(mismatch(MessageKind::SimErrorCheckResponse, &other)),
        }
    }
    pub async fn sim_create(&mut self) -> Result<MPO, RuntimeError> {
        match self.send(Request::SimCreate).await? {
            Response::SimCreate(mpo) => Ok(mpo),
            other => Err(mismatch(MessageKind::SimCreateResponse, &other)),
        }
    }
    pub async fn sim_destroy(&mut self, mpo: MPO) -> Result<(), RuntimeError> {
        match self.send(Request::SimDestroy(mpo)).await? {
            Response::SimDestroy => Ok(()),
            other => Err(mismatch(MessageKind::SimDestroyResponse, &other)),
        }
    }
}

impl RootState {
    fn daemon_of(&self, machine: MachineId) -> Result<ConnectionId, RuntimeError> {
        read_lock(&self.machines)
            .get(&machine)
            .copied()
            .ok_or_else(|| RuntimeError::Routing(format!("no daemon for machine {}", machine)))
    }
}
impl Router for RootState {
    fn route(&self, target: Target) -> Result<Route, RuntimeError> {
        Ok(match target {
            Target::Root => Route::Local,
            Target::Daemon => return Err(RuntimeError::Routing("root has no daemon".into())),
            Target::Mp(mp) => Route::Wrapped {
                connection: self.daemon_of(mp.machine)?,
                envelope: Envelope::Down(mp),
            },
            Target::Mpo(mpo) => Route::Wrapped {
                connection: self.daemon_of(mpo.mp.machine)?,
                envelope: Envelope::MpoDown(mpo),
            },
        })
    }
}
#[async_trait::async_trait]
impl RequestHandler for RootHandler {
    async fn handle(
        &self,
        thread: &mut LogicalThread,
        request: Request,
    ) -> Result<Response, RuntimeError> {
        let state = &self.0;
        match request {
            Request::Ping(text) => Ok(pong(&state.name, text)),
            Request::GetStatus(mut gathered) => {
                let daemons: Vec<_> = read_lock(&state.machines)
                    .iter()
                    .map(|(machine, connection)| (format!("machine {}", machine), *connection))
                    .collect();
                gather_statuses(thread, daemons, &mut gathered).await;
                Ok(Response::Status(Status {
                    logical_thread_ids: thread.manager()?.report_logical_threads(),
                    children: gathered,
                    ..Status::new(format!("root {}", state.name))
                }))
            }
            Request::EnroleDaemon => {
                let requester = thread.requester().ok_or_else(|| not_enrolled("requester"))?;
                let machine = mutex_lock(&state.next_machine)
                    .next()
                    .ok_or_else(|| RuntimeError::Enrolment("machine ids exhausted".into()))?;
                write_lock(&state.machines).insert(machine, requester);
                log!(thread.logger, "machine {} is {:?}", machine, requester);
                Ok(Response::EnroleDaemon(machine))
            }
            Request::MPRoot { request, .. } => thread.dispatch_local(*request).await,
            Request::MPUp { request, mp } | Request::MPDown { request, mp } => {
                let route = state.route(Target::Mp(mp))?;
                forward(thread, route, *request).await
            }
            Request::MPOUp { request, mpo } | Request::MPODown { request, mpo } => {
                let route = state.route(Target::Mpo(mpo))?;
                forward(thread, route, *request).await
            }
            other => Err(RuntimeError::DispatchFailure { kind: other.kind() }),
        }
    }
}

impl DaemonState {
    fn machine(&self) -> Result<MachineId, RuntimeError> {
        read_lock(&self.machine).ok_or_else(|| not_enrolled("daemon"))
    }
    fn root(&self) -> Result<ConnectionId, RuntimeError> {
        read_lock(&self.root).ok_or_else(|| not_enrolled("daemon"))
    }
    fn leaf_of(&self, process: ProcessId) -> Result<ConnectionId, RuntimeError> {
        read_lock(&self.leaves)
            .get(&process)
            .map(|(connection, _)| *connection)
            .ok_or_else(|| RuntimeError::Routing(format!("no process {}", process)))
    }
    fn check_local(&self, mp: MP) -> Result<(), RuntimeError> {
        if mp.machine == self.machine()? {
            Ok(())
        } else {
            Err(RuntimeError::Routing(format!("{} is not on this machine", mp)))
        }
    }
}
impl Router for DaemonState {
    fn route(&self, target: Target) -> Result<Route, RuntimeError> {
        let machine = self.machine()?;
        Ok(match target {
            Target::Root => Route::Direct(self.root()?),
            Target::Daemon => Route::Local,
            Target::Mp(mp) if mp == MP::new(machine, 0) => Route::Local,
            Target::Mp(mp) if mp.machine == machine => Route::Wrapped {
                connection: self.leaf_of(mp.process)?,
                envelope: Envelope::Down(mp),
            },
            Target::Mp(mp) => Route::Wrapped { connection: self.root()?, envelope: Envelope::Up(mp) },
            Target::Mpo(mpo) if mpo.mp == MP::new(machine, 0) => Route::Local,
            Target::Mpo(mpo) if mpo.mp.machine == machine => Route::Wrapped {
                connection: self.leaf_of(mpo.mp.process)?,
                envelope: Envelope::MpoDown(mpo),
            },
            Target::Mpo(mpo) => {
                Route::Wrapped { connection: self.root()?, envelope: Envelope::MpoUp(mpo) }
            }
        })
    }
}
#[async_trait::async_trait]
impl RequestHandler for DaemonHandler {
    async fn handle(
        &self,
        thread: &mut LogicalThread,
        request: Request,
    ) -> Result<Response, RuntimeError> {
        let state = &self.0;
        match request {
            Request::Ping(text) => Ok(pong(&state.name, text)),
            Request::GetStatus(mut gathered) => {
                let leaves: Vec<_> = read_lock(&state.leaves)
                    .iter()
                    .map(|(process, (connection, kind))| {
                        (format!("{:?} process {}", kind, process), *connection)
                    })
                    .collect();
                gather_statuses(thread, leaves, &mut gathered).await;
                Ok(Response::Status(Status {
                    machine: *read_lock(&state.machine),
                    logical_thread_ids: thread.manager()?.report_logical_threads(),
                    children: gathered,
                    ..Status::new(format!("daemon {}", state.name))
                }))
            }
            Request::EnroleLeaf(kind) => {
                let machine = state.machine()?;
                let requester = thread.requester().ok_or_else(|| not_enrolled("requester"))?;
                let process = mutex_lock(&state.next_process)
                    .next()
                    .ok_or_else(|| RuntimeError::Enrolment("process ids exhausted".into()))?;
                write_lock(&state.leaves).insert(process, (requester, kind));
                log!(thread.logger, "{:?} process {} is {:?}", kind, process, requester);
                Ok(Response::EnroleLeaf(MP::new(machine, process)))
            }
            Request::MPRoot { request, mp } => {
                let root = state.root()?;
                thread.request_on(root, Request::MPRoot { request, mp }).await
            }
            Request::MPUp { request, mp } => {
                let route = state.route(Target::Mp(mp))?;
                forward(thread, route, *request).await
            }
            Request::MPDown { request, mp } => {
                state.check_local(mp)?;
                let route = state.route(Target::Mp(mp))?;
                forward(thread, route, *request).await
            }
            Request::MPOUp { request, mpo } => {
                let route = state.route(Target::Mpo(mpo))?;
                forward(thread, route, *request).await
            }
            Request::MPODown { request, mpo } => {
                state.check_local(mpo.mp)?;
                let route = state.route(Target::Mpo(mpo))?;
                forward(thread, route, *request).await
            }
            other => Err(RuntimeError::DispatchFailure { kind: other.kind() }),
        }
    }
}

impl LeafState {
    fn mp(&self) -> Result<MP, RuntimeError> {
        read_lock(&self.mp).ok_or_else(|| not_enrolled("leaf"))
    }
    fn daemon(&self) -> Result<ConnectionId, RuntimeError> {
        read_lock(&self.daemon).ok_or_else(|| not_enrolled("leaf"))
    }
    fn check_local(&self, mp: MP) -> Result<(), RuntimeError> {
        if mp == self.mp()? {
            Ok(())
        } else {
            Err(RuntimeError::Routing(format!("{} is not this process", mp)))
        }
    }
}
impl Router for LeafState {
    fn route(&self, target: Target) -> Result<Route, RuntimeError> {
        let mp = self.mp()?;
        Ok(match target {
            Target::Root => {
                Route::Wrapped { connection: self.daemon()?, envelope: Envelope::Root(mp) }
            }
            Target::Daemon => Route::Direct(self.daemon()?),
            Target::Mp(target) if target == mp => Route::Local,
            Target::Mp(target) => {
                Route::Wrapped { connection: self.daemon()?, envelope: Envelope::Up(target) }
            }
            Target::Mpo(target) if target.mp == mp => Route::Local,
            Target::Mpo(target) => {
                Route::Wrapped { connection: self.daemon()?, envelope: Envelope::MpoUp(target) }
            }
        })
    }
}
#[async_trait::async_trait]
impl RequestHandler for LeafHandler {
    async fn handle(
        &self,
        thread: &mut LogicalThread,
        request: Request,
    ) -> Result<Response, RuntimeError> {
        let state = &self.0;
        match request {
            Request::Ping(text) => Ok(pong(&state.name, text)),
            Request::GetStatus(mut gathered) => {
                if let Some(locks) = &state.locks {
                    gathered.extend(locks.status());
                }
                Ok(Response::Status(Status {
                    mp: *read_lock(&state.mp),
                    logical_thread_ids: thread.manager()?.report_logical_threads(),
                    children: gathered,
                    ..Status::new(format!("{:?} {}", state.kind, state.name))
                }))
            }
            Request::MPRoot { request, mp } => {
                let daemon = state.daemon()?;
                thread.request_on(daemon, Request::MPRoot { request, mp }).await
            }
            Request::MPUp { request, mp } => {
                let route = state.route(Target::Mp(mp))?;
                forward(thread, route, *request).await
            }
            Request::MPOUp { request, mpo } => {
                let route = state.route(Target::Mpo(mpo))?;
                forward(thread, route, *request).await
            }
            Request::MPDown { request, mp } => {
                state.check_local(mp)?;
                thread.dispatch_local(*request).await
            }
            Request::MPODown { request, mpo } => {
                state.check_local(mpo.mp)?;
                thread.dispatch_local(*request).await
            }
            other => Err(RuntimeError::DispatchFailure { kind: other.kind() }),
        }
    }
}

impl Root {
    pub fn new(config: &ProcessConfig, runtime: tokio::runtime::Handle) -> std::io::Result<Self> {
        let state = Arc::new(RootState { name: config.process_name.clone(), ..Default::default() });
        let table = DispatchTable::new()
            .with(COMMON_REQUESTS, Arc::new(RootHandler(state.clone())))
            .with(&[MessageKind::EnroleDaemonRequest], Arc::new(RootHandler(state.clone())));
        let manager =
            LogicalThreadManager::new(&config.process_name, runtime, table, config.make_logger()?);
        let listener_state = state.clone();
        manager.add_disconnect_listener(Arc::new(move |lost| {
            write_lock(&listener_state.machines).retain(|_, connection| *connection != lost);
        }));
        Ok(Self { manager, state })
    }
    pub fn manager(&self) -> &Arc<LogicalThreadManager> {
        &self.manager
    }
    pub fn machines(&self) -> Vec<MachineId> {
        read_lock(&self.state.machines).keys().copied().collect()
    }
}
impl Router for Root {
    fn route(&self, target: Target) -> Result<Route, RuntimeError> {
        self.state.route(target)
    }
}

impl Daemon {
    pub fn new(config: &ProcessConfig, runtime: tokio::runtime::Handle) -> std::io::Result<Self> {
        let state = Arc::new(DaemonState {
            name: config.process_name.clone(),
            next_process: Mutex::new(U32Stream::starting_at(1)),
            ..Default::default()
        });
        let table = DispatchTable::new()
            .with(COMMON_REQUESTS, Arc::new(DaemonHandler(state.clone())))
            .with(&[MessageKind::EnroleLeafRequest], Arc::new(DaemonHandler(state.clone())));
        let manager =
            LogicalThreadManager::new(&config.process_name, runtime, table, config.make_logger()?);
        let listener_state = state.clone();
        manager.add_disconnect_listener(Arc::new(move |lost| {
            write_lock(&listener_state.leaves).retain(|_, (connection, _)| *connection != lost);
            let mut root = write_lock(&listener_state.root);
            if *root == Some(lost) {
                *root = None;
            }
        }));
        Ok(Self { manager, state })
    }
    pub fn manager(&self) -> &Arc<LogicalThreadManager> {
        &self.manager
    }
    pub fn machine(&self) -> Option<MachineId> {
        *read_lock(&self.state.machine)
    }
    pub fn leaves(&self) -> Vec<(MP, LeafKind)> {
        let machine = self.machine().unwrap_or_default();
        read_lock(&self.state.leaves)
            .iter()
            .map(|(process, (_, kind))| (MP::new(machine, *process), *kind))
            .collect()
    }
    /// Registers with the root reachable over `root`, learning this machine's id.
    pub async fn enrole(&self, root: ConnectionId) -> Result<MachineId, RuntimeError> {
        let mut thread = self.manager.logical_thread_initiated();
        let machine = match thread.request_on(root, Request::EnroleDaemon).await? {
            Response::EnroleDaemon(machine) => machine,
            other => return Err(mismatch(MessageKind::EnroleDaemonResponse, &other)),
        };
        *write_lock(&self.state.machine) = Some(machine);
        *write_lock(&self.state.root) = Some(root);
        Ok(machine)
    }
}
impl Router for Daemon {
    fn route(&self, target: Target) -> Result<Route, RuntimeError> {
        self.state.route(target)
    }
}

impl Leaf {
    pub fn new(
        config: &ProcessConfig,
        runtime: tokio::runtime::Handle,
        kind: LeafKind,
    ) -> std::io::Result<Self> {
        let locks = match kind {
            LeafKind::Executor => Some(Arc::new(LockTable::new())),
            _ => None,
        };
        let state = Arc::new(LeafState {
            name: config.process_name.clone(),
            kind,
            mp: Default::default(),
            daemon: Default::default(),
            locks: locks.clone(),
        });
        let mut table = DispatchTable::new().with(COMMON_REQUESTS, Arc::new(LeafHandler(state.clone())));
        if let Some(locks) = locks {
            table = table.with(LockTable::REQUESTS, locks);
        }
        let manager =
            LogicalThreadManager::new(&config.process_name, runtime, table, config.make_logger()?);
        let listener_state = state.clone();
        manager.add_disconnect_listener(Arc::new(move |lost| {
            let mut daemon = write_lock(&listener_state.daemon);
            if *daemon == Some(lost) {
                *daemon = None;
            }
        }));
        Ok(Self { manager, state })
    }
    pub fn manager(&self) -> &Arc<LogicalThreadManager> {
        &self.manager
    }
    pub fn kind(&self) -> LeafKind {
        self.state.kind
    }
    pub fn mp(&self) -> Option<MP> {
        *read_lock(&self.state.mp)
    }
    /// Present on executors only.
    pub fn lock_table(&self) -> Option<&Arc<LockTable>> {
        self.state.locks.as_ref()
    }
    /// Registers with the daemon reachable over `daemon`, learning this
    /// process's address.
    pub async fn enrole(&self, daemon: ConnectionId) -> Result<MP, RuntimeError> {
        let mut thread = self.manager.logical_thread_initiated();
        let mp = match thread.request_on(daemon, Request::EnroleLeaf(self.state.kind)).await? {
            Response::EnroleLeaf(mp) => mp,
            other => return Err(mismatch(MessageKind::EnroleLeafResponse, &other)),
        };
        *write_lock(&self.state.mp) = Some(mp);
        *write_lock(&self.state.daemon) = Some(daemon);
        if let Some(locks) = &self.state.locks {
            locks.set_host(mp);
        }
        Ok(mp)
    }
}
impl Router for Leaf {
    fn route(&self, target: Target) -> Result<Route, RuntimeError> {
        self.state.route(target)
    }
}
