use super::*;
use crate::runtime::{
    config::{LogConfig, ProcessConfig},
    endpoints::{NetReactor, VirtualLink},
    error::LockMode,
    lock::{acquire_in_order, Transaction},
    logging::DummyLogger,
    logical_thread::Frame,
    message::MsgBody,
    roles::{Daemon, Leaf, LeafKind, Root, Router},
};
use crossbeam_utils::thread::scope;

type Events = Arc<Mutex<Vec<String>>>;

fn runtime() -> tokio::runtime::Runtime {
    ProcessConfig::named("test").with_worker_threads(2).build_runtime().unwrap()
}
fn quiet(name: &str) -> ProcessConfig {
    ProcessConfig::named(name).with_log(LogConfig::Disabled)
}
fn new_manager(name: &str, table: DispatchTable) -> Arc<LogicalThreadManager> {
    LogicalThreadManager::new(name, tokio::runtime::Handle::current(), table, Box::new(DummyLogger))
}
fn events_of(events: &Events) -> Vec<String> {
    events.lock().unwrap().clone()
}
fn ping(text: &str) -> Request {
    Request::Ping(text.into())
}
fn pong(text: &str) -> Response {
    Response::Ping(text.into())
}
async fn eventually(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

lazy_static::lazy_static! {
    static ref PING: Vec<MessageKind> = vec![MessageKind::PingRequest];
}

// answers pings, panicking on "panic"
struct Echo {
    name: &'static str,
    events: Events,
}
// answers a ping only after calling the requester back
struct CallBack {
    name: &'static str,
    events: Events,
}
// never answers
struct Sleeper;

// a connection that keeps what is sent on it
#[derive(Debug)]
struct Recorder {
    connection: ConnectionId,
    sent: Mutex<Vec<Message>>,
}

#[async_trait::async_trait]
impl RequestHandler for Echo {
    async fn handle(
        &self,
        _thread: &mut LogicalThread,
        request: Request,
    ) -> Result<Response, RuntimeError> {
        match request {
            Request::Ping(text) => {
                if text == "panic" {
                    panic!("boom");
                }
                self.events.lock().unwrap().push(format!("{} {}", self.name, text));
                Ok(Response::Ping(format!("{}:{}", self.name, text)))
            }
            other => Err(RuntimeError::DispatchFailure { kind: other.kind() }),
        }
    }
}
#[async_trait::async_trait]
impl RequestHandler for CallBack {
    async fn handle(
        &self,
        thread: &mut LogicalThread,
        request: Request,
    ) -> Result<Response, RuntimeError> {
        let text = match request {
            Request::Ping(text) => text,
            other => return Err(RuntimeError::DispatchFailure { kind: other.kind() }),
        };
        self.events.lock().unwrap().push(format!("{} start {}", self.name, text));
        let requester = thread.requester().ok_or_else(|| RuntimeError::fault("no requester"))?;
        let reply = thread.request_on(requester, ping(&format!("callback {}", text))).await?;
        self.events.lock().unwrap().push(format!("{} end", self.name));
        match reply {
            Response::Ping(reply) => Ok(Response::Ping(format!("{} after {}", self.name, reply))),
            other => Err(RuntimeError::fault(format!("unexpected {:?}", other))),
        }
    }
}
#[async_trait::async_trait]
impl RequestHandler for Sleeper {
    async fn handle(
        &self,
        _thread: &mut LogicalThread,
        _request: Request,
    ) -> Result<Response, RuntimeError> {
        tokio::time::sleep(Duration::from_secs(600)).await;
        Err(RuntimeError::fault("woke up"))
    }
}
// a log sink that keeps every byte
#[derive(Debug)]
struct Capture(Arc<Mutex<Vec<u8>>>);

impl Logger for Capture {
    fn line_writer(&mut self) -> Option<&mut dyn Write> {
        Some(self)
    }
}
impl Write for Capture {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(data);
        Ok(data.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
impl Recorder {
    fn new() -> Arc<Self> {
        Arc::new(Self { connection: ConnectionId::fresh(), sent: Default::default() })
    }
    fn bodies(&self) -> Vec<MsgBody> {
        self.sent.lock().unwrap().iter().map(|msg| msg.body.clone()).collect()
    }
}
impl Sender for Recorder {
    fn connection_id(&self) -> ConnectionId {
        self.connection
    }
    fn send(&self, msg: Message) -> Result<(), RuntimeError> {
        self.sent.lock().unwrap().push(msg);
        Ok(())
    }
}

fn echo_table(name: &'static str, events: &Events) -> DispatchTable {
    DispatchTable::new().with(&PING, Arc::new(Echo { name, events: events.clone() }))
}

#[test]
fn nested_callback_completes_before_response() {
    runtime().block_on(async {
        let events = Events::default();
        let a = new_manager("a", echo_table("a", &events));
        let b = new_manager(
            "b",
            DispatchTable::new().with(&PING, Arc::new(CallBack { name: "b", events: events.clone() })),
        );
        let link = VirtualLink::connect(&a, &b);
        let mut thread = a.logical_thread_initiated();
        let reply = thread.request_on(link.a_side(), ping("hi")).await;
        assert_eq!(reply, Ok(pong("b after a:callback hi")));
        assert_eq!(events_of(&events), vec!["b start hi", "a callback hi", "b end"]);
        assert_eq!(thread.stack_size(), 1);
        assert_eq!(thread.state(), LogicalThreadState::Idle);
    });
}

#[test]
fn deferred_requests_replay_in_order() {
    runtime().block_on(async {
        let events = Events::default();
        let m = new_manager("m", echo_table("m", &events));
        let (c, d) = (Recorder::new(), Recorder::new());
        m.connection_established(c.clone());
        m.connection_established(d.clone());
        let mut thread = m.logical_thread_initiated();
        let id = thread.id();
        // servicing some request, so the next outbound request is nested
        thread.request_started(Frame::Inbound(ConnectionId::fresh()));
        for (text, from) in [("d1", &d), ("d2", &d), ("c1", &c)].iter() {
            m.dispatch(Message::request(id, ping(text)).received_on(from.connection));
        }
        m.dispatch(Message::response(id, pong("done")).received_on(c.connection));

        let c_connection: Connection = c.clone();
        let reply = thread.request(&c_connection, ping("outer")).await;
        assert_eq!(reply, Ok(pong("done")));
        // only the callback of the awaited connection ran meanwhile
        assert_eq!(events_of(&events), vec!["m c1"]);

        thread.request_completed();
        thread.run_one().await.unwrap();
        thread.run_one().await.unwrap();
        assert_eq!(events_of(&events), vec!["m c1", "m d1", "m d2"]);
        assert_eq!(
            d.bodies(),
            vec![MsgBody::Response(pong("m:d1")), MsgBody::Response(pong("m:d2"))]
        );
        assert_eq!(
            c.bodies(),
            vec![MsgBody::Request(ping("outer")), MsgBody::Response(pong("m:c1"))]
        );
    });
}

#[test]
fn unnested_request_services_everyone() {
    runtime().block_on(async {
        let events = Events::default();
        let m = new_manager("m", echo_table("m", &events));
        let (c, d) = (Recorder::new(), Recorder::new());
        m.connection_established(c.clone());
        m.connection_established(d.clone());
        let mut thread = m.logical_thread_initiated();
        let id = thread.id();
        m.dispatch(Message::request(id, ping("d1")).received_on(d.connection));
        m.dispatch(Message::response(id, pong("done")).received_on(c.connection));
        let c_connection: Connection = c.clone();
        assert_eq!(thread.request(&c_connection, ping("outer")).await, Ok(pong("done")));
        assert_eq!(events_of(&events), vec!["m d1"]);
    });
}

#[test]
fn disconnect_unblocks_nested_wait() {
    runtime().block_on(async {
        let m = new_manager("m", DispatchTable::new());
        let c = Recorder::new();
        m.connection_established(c.clone());
        let mut thread = m.logical_thread_initiated();
        let id = thread.id();
        let lost = c.connection;
        let m2 = m.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            m2.on_disconnect(lost);
        });
        let c_connection: Connection = c.clone();
        let waited =
            tokio::time::timeout(Duration::from_secs(5), thread.request(&c_connection, ping("?")))
                .await
                .expect("wait was not unblocked");
        assert_eq!(waited, Err(RuntimeError::Disconnection { logical_thread_id: id, connection: lost }));
        assert_eq!(
            thread.request_on(lost, ping("again")).await,
            Err(RuntimeError::ChannelClosed { connection: lost })
        );
    });
}

#[test]
fn lost_outer_peer_cancels_inner_wait() {
    runtime().block_on(async {
        let m = new_manager("m", DispatchTable::new());
        let (b, c) = (Recorder::new(), Recorder::new());
        m.connection_established(b.clone());
        m.connection_established(c.clone());
        let mut thread = m.logical_thread_initiated();
        let id = thread.id();
        // waiting on b while servicing b's callback
        thread.request_started(Frame::Outbound(b.connection));
        thread.request_started(Frame::Inbound(b.connection));
        let lost = b.connection;
        let m2 = m.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            m2.on_disconnect(lost);
        });
        let c_connection: Connection = c.clone();
        let waited =
            tokio::time::timeout(Duration::from_secs(5), thread.request(&c_connection, ping("?")))
                .await
                .expect("wait was not unblocked");
        let expected = Err(RuntimeError::Disconnection { logical_thread_id: id, connection: lost });
        assert_eq!(waited, expected);
        assert_eq!(thread.stack_size(), 3);
        // the outer wait on b fails too once the callback frame is gone
        thread.request_completed();
        assert_eq!(thread.dispatch_requests_until_response().await, expected);
    });
}

#[test]
fn lost_requester_cancels_nested_wait() {
    runtime().block_on(async {
        let m = new_manager("m", DispatchTable::new());
        let (a, c) = (Recorder::new(), Recorder::new());
        m.connection_established(a.clone());
        m.connection_established(c.clone());
        let mut thread = m.logical_thread_initiated();
        let id = thread.id();
        thread.request_started(Frame::Inbound(a.connection));
        let lost = a.connection;
        let m2 = m.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            m2.on_disconnect(lost);
        });
        let c_connection: Connection = c.clone();
        let waited =
            tokio::time::timeout(Duration::from_secs(5), thread.request(&c_connection, ping("?")))
                .await
                .expect("wait was not unblocked");
        assert_eq!(waited, Err(RuntimeError::Disconnection { logical_thread_id: id, connection: lost }));
        assert_eq!(thread.stack_size(), 2);
    });
}

#[test]
fn closed_link_fails_remote_wait() {
    runtime().block_on(async {
        let a = new_manager("a", DispatchTable::new());
        let b = new_manager("b", DispatchTable::new().with(&PING, Arc::new(Sleeper)));
        let link = Arc::new(VirtualLink::connect(&a, &b));
        let mut thread = a.logical_thread_initiated();
        let closer = link.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            closer.close();
        });
        let waited = tokio::time::timeout(
            Duration::from_secs(5),
            thread.request_on(link.a_side(), ping("zzz")),
        )
        .await
        .expect("wait was not unblocked");
        match waited {
            Err(RuntimeError::Disconnection { logical_thread_id, connection }) => {
                assert_eq!(logical_thread_id, thread.id());
                assert_eq!(connection, link.a_side());
            }
            other => panic!("expected disconnection, got {:?}", other),
        }
    });
}

#[test]
fn missing_handler_answers_with_error() {
    runtime().block_on(async {
        let a = new_manager("a", DispatchTable::new());
        let b = new_manager("b", DispatchTable::new());
        let link = VirtualLink::connect(&a, &b);
        let mut thread = a.logical_thread_initiated();
        assert_eq!(
            thread.request_on(link.a_side(), ping("anyone?")).await,
            Err(RuntimeError::DispatchFailure { kind: MessageKind::PingRequest })
        );
        // the conversation retired on b
        eventually(|| b.report_logical_threads().is_empty()).await;
    });
}

#[test]
fn handler_panic_becomes_error_response() {
    runtime().block_on(async {
        let events = Events::default();
        let a = new_manager("a", DispatchTable::new());
        let b = new_manager("b", echo_table("b", &events));
        let link = VirtualLink::connect(&a, &b);
        let mut thread = a.logical_thread_initiated();
        match thread.request_on(link.a_side(), ping("panic")).await {
            Err(RuntimeError::Fault(what)) => assert!(what.contains("boom"), "{}", what),
            other => panic!("expected fault, got {:?}", other),
        }
        assert_eq!(thread.request_on(link.a_side(), ping("ok")).await, Ok(pong("b:ok")));
        let mut other = a.logical_thread_initiated();
        assert_eq!(other.request_on(link.a_side(), ping("still")).await, Ok(pong("b:still")));
    });
}

#[test]
fn report_lists_live_logical_threads() {
    runtime().block_on(async {
        let m = new_manager("m", DispatchTable::new());
        let first = m.logical_thread_initiated();
        let second = m.logical_thread_initiated();
        assert_eq!(m.report_logical_threads(), vec![first.id(), second.id()]);
        let second_id = second.id();
        drop(first);
        assert_eq!(m.report_logical_threads(), vec![second_id]);
        drop(second);
        assert!(m.report_logical_threads().is_empty());
    });
}

#[test]
fn spawned_conversation_runs_on_pool() {
    runtime().block_on(async {
        let events = Events::default();
        let a = new_manager("a", DispatchTable::new());
        let b = new_manager("b", echo_table("b", &events));
        let link = VirtualLink::connect(&a, &b);
        let to = link.a_side();
        let handle = a.spawn_initiated(move |mut thread| async move {
            thread.request_on(to, ping("from task")).await
        });
        assert_eq!(handle.await.unwrap(), Ok(pong("b:from task")));
    });
}

#[test]
fn external_thread_blocks_for_response() {
    let rt = runtime();
    let events = Events::default();
    let (a, b) = {
        let _guard = rt.enter();
        (new_manager("a", DispatchTable::new()), new_manager("b", echo_table("b", &events)))
    };
    let link = VirtualLink::connect(&a, &b);
    let connection = a.connection(link.a_side()).unwrap();
    let mut external = a.external_logical_thread_initiated().unwrap();
    assert!(a.external_logical_thread_initiated().is_err());
    scope(|s| {
        s.spawn(|_| {
            let reply = external.request_blocking(&connection, ping("blocking"));
            assert_eq!(reply, Ok(pong("b:blocking")));
        });
    })
    .unwrap();
    drop(external);
    assert!(a.external_logical_thread_initiated().is_ok());
}

#[test]
fn external_thread_refuses_callbacks() {
    let rt = runtime();
    let events = Events::default();
    let (a, b) = {
        let _guard = rt.enter();
        let b_table =
            DispatchTable::new().with(&PING, Arc::new(CallBack { name: "b", events: events.clone() }));
        (new_manager("a", DispatchTable::new()), new_manager("b", b_table))
    };
    let link = VirtualLink::connect(&a, &b);
    let connection = a.connection(link.a_side()).unwrap();
    let mut external = a.external_logical_thread_initiated().unwrap();
    scope(|s| {
        s.spawn(|_| match external.request_blocking(&connection, ping("hi")) {
            Err(RuntimeError::Fault(what)) => assert!(what.contains("cannot service")),
            other => panic!("expected refusal, got {:?}", other),
        });
    })
    .unwrap();
    assert_eq!(events_of(&events), vec!["b start hi"]);
}

#[cfg(not(feature = "no_logging"))]
#[test]
fn external_refusal_to_unknown_peer_is_logged() {
    let rt = runtime();
    let captured = Arc::new(Mutex::new(vec![]));
    let a = {
        let _guard = rt.enter();
        LogicalThreadManager::new(
            "a",
            tokio::runtime::Handle::current(),
            DispatchTable::new(),
            Box::new(Capture(captured.clone())),
        )
    };
    let c = Recorder::new();
    a.connection_established(c.clone());
    let connection: Connection = c.clone();
    let mut external = a.external_logical_thread_initiated().unwrap();
    let id = external.id();
    // a request from a connection the manager never heard of, then the response
    a.dispatch(Message::request(id, ping("anyone?")).received_on(ConnectionId::fresh()));
    a.dispatch(Message::response(id, pong("done")).received_on(c.connection));
    assert_eq!(external.request_blocking(&connection, ping("hi")), Ok(pong("done")));
    let log = String::from_utf8(captured.lock().unwrap().clone()).unwrap();
    assert!(log.contains("refusal to"), "{}", log);
}

#[cfg(not(feature = "no_logging"))]
#[test]
fn shared_logger_writes_whole_prefixed_lines() {
    let captured = Arc::new(Mutex::new(vec![]));
    let root = SharedLogger::new(Box::new(Capture(captured.clone())));
    let mut logger = root.with_prefix("proc").with_prefix("lt");
    log!(logger, "hello {}", 1);
    log!(root.clone(), "plain");
    assert_eq!(String::from_utf8(captured.lock().unwrap().clone()).unwrap(), "proc lt hello 1\nplain\n");
}

////////////////// full process tree over in-process links //////////////////

struct Cluster {
    root: Root,
    daemon: Daemon,
    executors: [Leaf; 2],
    terminal: Leaf,
    // root-daemon, then one per leaf in enrolment order
    links: Vec<VirtualLink>,
}

async fn enrolled_leaf(
    daemon: &Daemon,
    name: &str,
    kind: LeafKind,
    links: &mut Vec<VirtualLink>,
) -> Leaf {
    let leaf = Leaf::new(&quiet(name), tokio::runtime::Handle::current(), kind).unwrap();
    let link = VirtualLink::connect(daemon.manager(), leaf.manager());
    leaf.enrole(link.b_side()).await.unwrap();
    links.push(link);
    leaf
}

async fn cluster() -> Cluster {
    let handle = tokio::runtime::Handle::current();
    let root = Root::new(&quiet("root"), handle.clone()).unwrap();
    let daemon = Daemon::new(&quiet("daemon"), handle).unwrap();
    let up = VirtualLink::connect(root.manager(), daemon.manager());
    assert_eq!(daemon.enrole(up.b_side()).await, Ok(0));
    let mut links = vec![up];
    let first = enrolled_leaf(&daemon, "exec1", LeafKind::Executor, &mut links).await;
    let second = enrolled_leaf(&daemon, "exec2", LeafKind::Executor, &mut links).await;
    let terminal = enrolled_leaf(&daemon, "terminal", LeafKind::Terminal, &mut links).await;
    Cluster { root, daemon, executors: [first, second], terminal, links }
}

#[test]
fn enrolment_assigns_addresses() {
    runtime().block_on(async {
        let c = cluster().await;
        assert_eq!(c.root.machines(), vec![0]);
        assert_eq!(c.executors[0].mp(), Some(MP::new(0, 1)));
        assert_eq!(c.executors[1].mp(), Some(MP::new(0, 2)));
        assert_eq!(c.terminal.mp(), Some(MP::new(0, 3)));
        assert!(c.terminal.lock_table().is_none());
        assert_eq!(
            c.daemon.leaves(),
            vec![
                (MP::new(0, 1), LeafKind::Executor),
                (MP::new(0, 2), LeafKind::Executor),
                (MP::new(0, 3), LeafKind::Terminal),
            ]
        );
    });
}

#[test]
fn requests_route_through_the_tree() {
    runtime().block_on(async {
        let c = cluster().await;
        let mut t = c.terminal.manager().logical_thread_initiated();
        let reply = c.terminal.root_request(&mut t).unwrap().ping("hello").await.unwrap();
        assert_eq!(reply, "root pong hello");
        let reply = c.terminal.daemon_request(&mut t).unwrap().ping("hi").await.unwrap();
        assert_eq!(reply, "daemon pong hi");
        let exec2 = c.executors[1].mp().unwrap();
        let reply = c.terminal.mp_request(&mut t, exec2).unwrap().ping("yo").await.unwrap();
        assert_eq!(reply, "exec2 pong yo");
        // process 0 of a machine is its daemon
        let reply = c.terminal.mp_request(&mut t, MP::new(0, 0)).unwrap().ping("zero").await.unwrap();
        assert_eq!(reply, "daemon pong zero");

        // downward from the root
        let mut r = c.root.manager().logical_thread_initiated();
        let sim = c.root.mp_request(&mut r, exec2).unwrap().sim_create().await.unwrap();
        assert_eq!(sim, MPO::new(0, 2, 0));
        c.root.mpo_request(&mut r, sim).unwrap().sim_error_check(sim).await.unwrap();
        let reply = c.root.mp_request(&mut r, MP::new(0, 0)).unwrap().ping("down").await.unwrap();
        assert_eq!(reply, "daemon pong down");
        assert!(matches!(
            c.root.mp_request(&mut r, MP::new(9, 1)).err(),
            Some(RuntimeError::Routing(_))
        ));
        assert!(matches!(c.root.daemon_request(&mut r).err(), Some(RuntimeError::Routing(_))));
        // terminals host no simulations
        let own = c.terminal.mp().unwrap();
        assert_eq!(
            c.terminal.mp_request(&mut t, own).unwrap().sim_create().await,
            Err(RuntimeError::DispatchFailure { kind: MessageKind::SimCreateRequest })
        );
    });
}

#[test]
fn remote_lock_conflict_and_stable_read() {
    runtime().block_on(async {
        let c = cluster().await;
        let exec1 = c.executors[0].mp().unwrap();
        let (a, b) = (MPO::new(0, 3, 100), MPO::new(0, 3, 101));
        let mut t = c.terminal.manager().logical_thread_initiated();
        let sim = c.terminal.mp_request(&mut t, exec1).unwrap().sim_create().await.unwrap();
        for i in 0..5u8 {
            let mut sender = c.terminal.mpo_request(&mut t, sim).unwrap();
            assert_eq!(sender.sim_lock_write(b, sim).await, Ok(TimeStamp::new(i as u32 + 1)));
            let tx = Transaction::new().with(0, vec![i]);
            assert_eq!(sender.sim_lock_release(b, sim, tx).await, Ok(TimeStamp::new(i as u32 + 1)));
        }
        let mut sender = c.terminal.mpo_request(&mut t, sim).unwrap();
        assert_eq!(sender.sim_lock_read(a, sim).await, Ok(TimeStamp::new(5)));

        // a second conversation competes for the same simulation
        let mut t2 = c.terminal.manager().logical_thread_initiated();
        let competing = c.terminal.mpo_request(&mut t2, sim).unwrap().sim_lock_write(b, sim).await;
        assert_eq!(
            competing,
            Err(RuntimeError::LockConflict { from: b, resource: sim, mode: LockMode::Write })
        );
        let mut sender = c.terminal.mpo_request(&mut t, sim).unwrap();
        assert_eq!(sender.sim_lock_read(a, sim).await, Ok(TimeStamp::new(5)));

        let locks = c.executors[0].lock_table().unwrap();
        let (timestamp, state) = locks.snapshot(sim).unwrap();
        assert_eq!(timestamp, TimeStamp::new(5));
        assert_eq!(state, maplit::btreemap! { 0 => Payload::from(vec![4u8]) });
        assert_eq!(locks.readers(sim).unwrap(), vec![a]);

        sender.sim_lock_release(a, sim, Transaction::new()).await.unwrap();
        let mut sender = c.terminal.mpo_request(&mut t2, sim).unwrap();
        assert_eq!(sender.sim_lock_write(b, sim).await, Ok(TimeStamp::new(6)));
        assert_eq!(sender.sim_lock_release(b, sim, Transaction::new()).await, Ok(TimeStamp::new(6)));
    });
}

#[test]
fn recorded_simulation_error_reaches_caller() {
    runtime().block_on(async {
        let c = cluster().await;
        let exec1 = c.executors[0].mp().unwrap();
        let mut t = c.terminal.manager().logical_thread_initiated();
        let sim = c.terminal.mp_request(&mut t, exec1).unwrap().sim_create().await.unwrap();
        c.executors[0].lock_table().unwrap().record_error(sim, "diverged").unwrap();
        let checked = c.terminal.mpo_request(&mut t, sim).unwrap().sim_error_check(sim).await;
        assert_eq!(checked, Err(RuntimeError::SimulationError { mpo: sim, what: "diverged".into() }));
        c.terminal.mpo_request(&mut t, sim).unwrap().sim_destroy(sim).await.unwrap();
        assert_eq!(
            c.terminal.mpo_request(&mut t, sim).unwrap().sim_error_check(sim).await,
            Err(RuntimeError::UnknownSimulation(sim))
        );
    });
}

#[test]
fn locks_acquired_in_ascending_order() {
    runtime().block_on(async {
        let c = cluster().await;
        let (exec1, exec2) = (c.executors[0].mp().unwrap(), c.executors[1].mp().unwrap());
        let mut t = c.terminal.manager().logical_thread_initiated();
        let sim1 = c.terminal.mp_request(&mut t, exec1).unwrap().sim_create().await.unwrap();
        let sim2 = c.terminal.mp_request(&mut t, exec2).unwrap().sim_create().await.unwrap();
        let from = MPO::new(0, 3, 7);
        let granted = acquire_in_order(&c.terminal, &mut t, from, &[sim2, sim1, sim2], LockMode::Write)
            .await
            .unwrap();
        assert_eq!(granted, vec![(sim1, TimeStamp::new(1)), (sim2, TimeStamp::new(1))]);
        for (to, _) in granted {
            let mut sender = c.terminal.mpo_request(&mut t, to).unwrap();
            sender.sim_lock_release(from, to, Transaction::new()).await.unwrap();
        }

        let holder = MPO::new(0, 3, 8);
        c.terminal.mpo_request(&mut t, sim2).unwrap().sim_lock_read(holder, sim2).await.unwrap();
        let failed = acquire_in_order(&c.terminal, &mut t, from, &[sim1, sim2], LockMode::Write).await;
        assert!(matches!(failed, Err(RuntimeError::LockConflict { .. })));
        // nothing stays locked after a partial acquisition
        assert_eq!(c.executors[0].lock_table().unwrap().writer(sim1).unwrap(), None);
    });
}

#[test]
fn status_gathers_the_whole_tree() {
    runtime().block_on(async {
        let c = cluster().await;
        let exec1 = c.executors[0].mp().unwrap();
        let reader = MPO::new(0, 3, 1);
        let mut t = c.terminal.manager().logical_thread_initiated();
        let sim = c.terminal.mp_request(&mut t, exec1).unwrap().sim_create().await.unwrap();
        c.terminal.mpo_request(&mut t, sim).unwrap().sim_lock_read(reader, sim).await.unwrap();

        let mut rt = c.root.manager().logical_thread_initiated();
        let status = c.root.root_request(&mut rt).unwrap().get_status().await.unwrap();
        println!("{}", status);
        assert!(status.description.starts_with("root"));
        assert_eq!(status.children.len(), 1);
        assert_eq!(status.children[0].machine, Some(0));
        assert_eq!(status.children[0].children.len(), 3);
        let simulation = status.find_mpo(sim).unwrap();
        assert_eq!(simulation.reads, vec![(reader, TimeStamp::new(0))]);
        assert!(simulation.writes.is_empty());
        // the root's own conversation is live while it gathers
        assert!(status.logical_thread_ids.contains(&rt.id()));
    });
}

#[test]
fn lost_leaf_leaves_routing() {
    runtime().block_on(async {
        let c = cluster().await;
        let exec2 = c.executors[1].mp().unwrap();
        c.links[2].close();
        assert!(c.daemon.leaves().iter().all(|(mp, _)| *mp != exec2));
        let mut t = c.terminal.manager().logical_thread_initiated();
        let lost = c.terminal.mp_request(&mut t, exec2).unwrap().ping("there?").await;
        assert!(matches!(lost, Err(RuntimeError::Routing(_))), "{:?}", lost);
        // and the root forgets a lost daemon
        c.links[0].close();
        assert!(c.root.machines().is_empty());
    });
}

#[test]
fn net_reactor_carries_conversations() {
    runtime().block_on(async {
        let events = Events::default();
        let server = new_manager("server", echo_table("server", &events));
        let client = new_manager("client", DispatchTable::new());
        let listen: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let server_reactor = NetReactor::spawn(&server, Some(listen)).unwrap();
        let client_reactor = NetReactor::spawn(&client, None).unwrap();
        let connection = client_reactor.connect(server_reactor.local_addr().unwrap()).unwrap();

        let mut thread = client.logical_thread_initiated();
        assert_eq!(thread.request(&connection, ping("over tcp")).await, Ok(pong("server:over tcp")));
        assert_eq!(thread.request(&connection, ping("again")).await, Ok(pong("server:again")));
        assert_eq!(events_of(&events), vec!["server over tcp", "server again"]);

        server_reactor.shutdown();
        let id = connection.connection_id();
        eventually(|| client.connection(id).is_none()).await;
        assert_eq!(
            thread.request(&connection, ping("gone")).await,
            Err(RuntimeError::ChannelClosed { connection: id })
        );
    });
}
