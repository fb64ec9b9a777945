//! Tests for connections, dispatch and the pool over in-memory transports.

use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use rand::distributions::Alphanumeric;
use cmdwire::Command;
use cmdwire::FailureReason;
use cmdwire::Request;
use serde::Deserialize;
use serde::Serialize;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::sync::Notify;
use tokio::sync::mpsc;

use crate::builder::CommanderBuilder;
use crate::config::CommanderConfig;
use crate::connection::Connection;
use crate::connection::ConnectionState;
use crate::dispatch::Dispatcher;
use crate::error::Error;
use crate::handler::CommandHandler;
use crate::handler::ConnectionAwareHandler;
use crate::handler::Handler;
use crate::handler::HandlerResult;
use crate::handler::Responder;
use crate::mock_transport;
use crate::pool::ConnectionPool;
use crate::registry::HandlerRegistry;
use crate::registry::RegistryError;

const WAIT: Duration = Duration::from_secs(5);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn within<F: std::future::Future>(f: F) -> F::Output {
    tokio::time::timeout(WAIT, f).await.expect("timed out")
}

// ============================================================================
//  TEST COMMANDS
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
struct Ping {
    n: u32,
}

impl Command for Ping {
    const HANDLER: &'static str = "test.ping";
}

#[derive(Debug, Serialize, Deserialize)]
struct Echo {
    text: String,
}

impl Command for Echo {
    const HANDLER: &'static str = "test.echo";
}

impl Request for Echo {
    type Response = String;
}

/// Same identifier as `Echo`, different shape.
#[derive(Debug, Serialize, Deserialize)]
struct EchoNumber(u64);

impl Command for EchoNumber {
    const HANDLER: &'static str = "test.echo";
}

impl Request for EchoNumber {
    type Response = String;
}

#[derive(Debug, Serialize, Deserialize)]
struct Fail;

impl Command for Fail {
    const HANDLER: &'static str = "test.fail";
}

impl Request for Fail {
    type Response = ();
}

#[derive(Debug, Serialize, Deserialize)]
struct Boom;

impl Command for Boom {
    const HANDLER: &'static str = "test.boom";
}

#[derive(Debug, Serialize, Deserialize)]
struct Grab;

impl Command for Grab {
    const HANDLER: &'static str = "test.grab";
}

#[derive(Debug, Serialize, Deserialize)]
struct Stall;

impl Command for Stall {
    const HANDLER: &'static str = "test.stall";
}

impl Request for Stall {
    type Response = ();
}

#[derive(Debug, Serialize, Deserialize)]
struct WhoAmI;

impl Command for WhoAmI {
    const HANDLER: &'static str = "test.whoami";
}

impl Request for WhoAmI {
    type Response = Option<u64>;
}

// ============================================================================
//  TEST HANDLERS
// ============================================================================

struct Record(mpsc::UnboundedSender<u32>);

#[async_trait]
impl CommandHandler<Ping> for Record {
    async fn run(&self, command: Ping) -> HandlerResult {
        let _ = self.0.send(command.n);
        Ok(())
    }
}

struct EchoBack;

#[async_trait]
impl Responder<Echo> for EchoBack {
    async fn respond(&self, request: Echo) -> HandlerResult<String> {
        Ok(request.text)
    }
}

struct AlwaysFail;

#[async_trait]
impl Responder<Fail> for AlwaysFail {
    async fn respond(&self, _request: Fail) -> HandlerResult<()> {
        anyhow::bail!("refusing on purpose")
    }
}

struct Panic;

#[async_trait]
impl CommandHandler<Boom> for Panic {
    async fn run(&self, _command: Boom) -> HandlerResult {
        panic!("handler exploded");
    }
}

struct GrabConnection(mpsc::UnboundedSender<Connection>);

#[async_trait]
impl ConnectionAwareHandler<Grab> for GrabConnection {
    async fn run(&self, _command: Grab, connection: Connection) -> HandlerResult {
        let _ = self.0.send(connection);
        Ok(())
    }
}

/// Signals that it started, then never finishes.
struct Hang(Arc<Notify>);

#[async_trait]
impl Responder<Stall> for Hang {
    async fn respond(&self, _request: Stall) -> HandlerResult<()> {
        self.0.notify_one();
        std::future::pending::<()>().await;
        Ok(())
    }
}

struct Current;

#[async_trait]
impl Responder<WhoAmI> for Current {
    async fn respond(&self, _request: WhoAmI) -> HandlerResult<Option<u64>> {
        Ok(Connection::current().map(|c| c.id().0))
    }
}

struct Counter(Arc<AtomicUsize>);

#[async_trait]
impl CommandHandler<Ping> for Counter {
    async fn run(&self, _command: Ping) -> HandlerResult {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn empty() -> Dispatcher {
    Dispatcher::new(HandlerRegistry::default())
}

fn recording() -> (Dispatcher, mpsc::UnboundedReceiver<u32>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut registry = HandlerRegistry::builder();
    registry.plain::<Ping, _>(Record(tx)).expect("register");
    registry.responder::<Echo, _>(EchoBack).expect("register");
    registry.responder::<Fail, _>(AlwaysFail).expect("register");
    registry.plain::<Boom, _>(Panic).expect("register");
    registry.responder::<WhoAmI, _>(Current).expect("register");
    (Dispatcher::new(registry.build()), rx)
}

fn pair(left: Dispatcher, right: Dispatcher) -> (Connection, Connection) {
    mock_transport::connected_pair(left, right, &CommanderConfig::default())
}

// ============================================================================
//  DISPATCH
// ============================================================================

#[tokio::test]
async fn test_command_runs_handler_exactly_once() {
    init_tracing();
    let count = Arc::new(AtomicUsize::new(0));
    let mut registry = HandlerRegistry::builder();
    registry.plain::<Ping, _>(Counter(count.clone())).expect("register");
    registry.responder::<Echo, _>(EchoBack).expect("register");
    let (a, _b) = pair(empty(), Dispatcher::new(registry.build()));

    a.send(&Ping { n: 1 }).await.expect("send");
    // Commands are dispatched in order, so the reply proves the ping ran.
    within(a.call(&Echo { text: "sync".into() })).await.expect("call");

    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_commands_arrive_in_order() {
    let (dispatcher, mut rx) = recording();
    let (a, _b) = pair(empty(), dispatcher);

    for n in 0..200 {
        a.send(&Ping { n }).await.expect("send");
    }
    for expected in 0..200 {
        let got = within(rx.recv()).await.expect("handler dropped");
        assert_eq!(got, expected);
    }
}

#[tokio::test]
async fn test_unknown_handler_keeps_connection_open() {
    let mut registry = HandlerRegistry::builder();
    registry.responder::<Echo, _>(EchoBack).expect("register");
    let (a, b) = pair(empty(), Dispatcher::new(registry.build()));

    a.send(&Ping { n: 1 }).await.expect("send");
    let echoed = within(a.call(&Echo { text: "still here".into() })).await.expect("call");

    assert_eq!(echoed, "still here");
    assert!(a.is_live());
    assert!(b.is_live());
}

#[tokio::test]
async fn test_handler_error_and_panic_keep_connection_open() {
    init_tracing();
    let (dispatcher, mut rx) = recording();
    let (a, b) = pair(empty(), dispatcher);

    a.send(&Fail).await.expect("send");
    a.send(&Boom).await.expect("send");
    a.send(&Ping { n: 9 }).await.expect("send");

    assert_eq!(within(rx.recv()).await, Some(9));
    assert!(a.is_live());
    assert!(b.is_live());
}

#[tokio::test]
async fn test_connection_aware_handler_gets_origin() {
    let (grab_tx, mut grab_rx) = mpsc::unbounded_channel();
    let mut server = HandlerRegistry::builder();
    server.connection_aware::<Grab, _>(GrabConnection(grab_tx)).expect("register");
    let (client, mut pings) = recording();

    let (a, b) = pair(client, Dispatcher::new(server.build()));
    a.send(&Grab).await.expect("send");

    let grabbed = within(grab_rx.recv()).await.expect("handler dropped");
    assert_eq!(grabbed.id(), b.id());

    // The grabbed handle talks back to the side that sent `Grab`.
    grabbed.send(&Ping { n: 42 }).await.expect("send back");
    assert_eq!(within(pings.recv()).await, Some(42));
}

#[tokio::test]
async fn test_grabbed_connection_fails_after_close() {
    let (grab_tx, mut grab_rx) = mpsc::unbounded_channel();
    let mut server = HandlerRegistry::builder();
    server.connection_aware::<Grab, _>(GrabConnection(grab_tx)).expect("register");

    let (a, b) = pair(empty(), Dispatcher::new(server.build()));
    a.send(&Grab).await.expect("send");
    let grabbed = within(grab_rx.recv()).await.expect("handler dropped");

    a.close();
    within(b.closed()).await;
    assert!(matches!(grabbed.send(&Ping { n: 1 }).await, Err(Error::Closed)));
}

#[tokio::test]
async fn test_current_connection_inside_handler() {
    let (dispatcher, _rx) = recording();
    let (a, b) = pair(empty(), dispatcher);

    let id = within(a.call(&WhoAmI)).await.expect("call");
    assert_eq!(id, Some(b.id().0));
    assert!(Connection::current().is_none());
}

// ============================================================================
//  REQUEST / RESPONSE
// ============================================================================

#[tokio::test]
async fn test_call_returns_response() {
    let (dispatcher, _rx) = recording();
    let (a, _b) = pair(empty(), dispatcher);

    let reply = within(a.call(&Echo { text: "hello".into() })).await.expect("call");
    assert_eq!(reply, "hello");
}

#[tokio::test]
async fn test_concurrent_calls_are_matched_by_sequence() {
    let (dispatcher, _rx) = recording();
    let (a, _b) = pair(empty(), dispatcher);

    let texts: Vec<String> = {
        let mut rng = rand::thread_rng();
        (0..32)
            .map(|_| {
                let len = rng.gen_range(0..2048);
                (&mut rng).sample_iter(Alphanumeric).take(len).map(char::from).collect()
            })
            .collect()
    };

    let calls: Vec<_> = texts
        .iter()
        .cloned()
        .map(|text| {
            let a = a.clone();
            tokio::spawn(async move { a.call(&Echo { text }).await })
        })
        .collect();
    for (call, expected) in calls.into_iter().zip(&texts) {
        let reply = within(call).await.expect("join");
        assert_eq!(&reply.expect("call"), expected);
    }
}

#[tokio::test]
async fn test_remote_failures_carry_reason() {
    let (dispatcher, _rx) = recording();
    let (a, b) = pair(empty(), dispatcher);

    match within(a.call(&Stall)).await {
        Err(Error::Remote(f)) => assert_eq!(f.reason, FailureReason::UnknownHandler),
        other => panic!("expected unknown handler, got {other:?}"),
    }
    match within(a.call(&Fail)).await {
        Err(Error::Remote(f)) => {
            assert_eq!(f.reason, FailureReason::HandlerFailed);
            assert!(f.message.contains("refusing on purpose"));
        }
        other => panic!("expected handler failure, got {other:?}"),
    }
    match within(a.call(&EchoNumber(7))).await {
        Err(Error::Remote(f)) => assert_eq!(f.reason, FailureReason::BadPayload),
        other => panic!("expected bad payload, got {other:?}"),
    }

    assert!(a.is_live());
    assert!(b.is_live());
}

#[tokio::test]
async fn test_call_times_out() {
    let started = Arc::new(Notify::new());
    let mut registry = HandlerRegistry::builder();
    registry.responder::<Stall, _>(Hang(started.clone())).expect("register");
    let config = CommanderConfig::default().with_call_timeout(Duration::from_millis(100));
    let (a, _b) = mock_transport::connected_pair(empty(), Dispatcher::new(registry.build()), &config);

    let result = within(a.call(&Stall)).await;
    assert!(matches!(result, Err(Error::Timeout)), "got {result:?}");
    assert!(a.is_live());
}

#[tokio::test]
async fn test_pending_call_fails_on_close() {
    let started = Arc::new(Notify::new());
    let mut registry = HandlerRegistry::builder();
    registry.responder::<Stall, _>(Hang(started.clone())).expect("register");
    let (a, _b) = pair(empty(), Dispatcher::new(registry.build()));

    let caller = a.clone();
    let call = tokio::spawn(async move { caller.call(&Stall).await });
    within(started.notified()).await;

    a.close();
    let result = within(call).await.expect("join");
    assert!(matches!(result, Err(Error::Closed)), "got {result:?}");
}

// ============================================================================
//  LIFECYCLE
// ============================================================================

#[tokio::test]
async fn test_close_is_idempotent() {
    let (a, b) = pair(empty(), empty());
    assert_eq!(a.state(), ConnectionState::Active);

    a.close();
    a.close();
    assert!(!a.is_live());

    within(a.closed()).await;
    assert_eq!(a.state(), ConnectionState::Closed);
    a.close();
    assert_eq!(a.state(), ConnectionState::Closed);

    // The peer sees end of stream and closes too.
    within(b.closed()).await;
    assert_eq!(b.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn test_send_after_close_fails() {
    let (a, _b) = pair(empty(), empty());
    a.close();

    assert!(matches!(a.send(&Ping { n: 1 }).await, Err(Error::Closed)));
    assert!(matches!(a.call(&Echo { text: "x".into() }).await, Err(Error::Closed)));
}

#[tokio::test]
async fn test_close_cancels_running_handler() {
    let started = Arc::new(Notify::new());
    let mut registry = HandlerRegistry::builder();
    registry.responder::<Stall, _>(Hang(started.clone())).expect("register");
    let (a, b) = pair(empty(), Dispatcher::new(registry.build()));

    a.send(&Stall).await.expect("send");
    within(started.notified()).await;

    b.close();
    within(b.closed()).await;
    within(a.closed()).await;
}

// ============================================================================
//  PROTOCOL VIOLATIONS
// ============================================================================

#[tokio::test]
async fn test_garbage_frame_closes_connection() {
    init_tracing();
    let (conn, mut peer) = mock_transport::raw(empty(), &CommanderConfig::default());

    // Length 2, unknown frame kind.
    peer.write.write_all(&[2, 0, 0, 0, 0xEE, 0x00]).await.expect("write");
    within(conn.closed()).await;

    let mut rest = Vec::new();
    let n = within(peer.read.read_to_end(&mut rest)).await.expect("read");
    assert_eq!(n, 0);
}

#[tokio::test]
async fn test_oversized_frame_closes_connection() {
    let config = CommanderConfig::default().with_max_frame_len(1024);
    let (conn, mut peer) = mock_transport::raw(empty(), &config);

    peer.write.write_all(&4096u32.to_le_bytes()).await.expect("write");
    within(conn.closed()).await;
    assert_eq!(conn.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn test_truncated_frame_at_eof_closes_connection() {
    let (conn, mut peer) = mock_transport::raw(empty(), &CommanderConfig::default());

    peer.write.write_all(&[10, 0, 0, 0, 0x01]).await.expect("write");
    peer.write.shutdown().await.expect("shutdown");
    within(conn.closed()).await;
}

#[tokio::test]
async fn test_stalled_partial_frame_closes_connection() {
    let config = CommanderConfig::default().with_frame_timeout(Duration::from_millis(50));
    let (conn, mut peer) = mock_transport::raw(empty(), &config);

    // Promise ten bytes, deliver three, then go quiet without closing.
    peer.write.write_all(&[10, 0, 0, 0, 0x01, 0x02, 0x03]).await.expect("write");
    within(conn.closed()).await;
}

#[tokio::test]
async fn test_idle_connection_is_not_stalled() {
    let config = CommanderConfig::default().with_frame_timeout(Duration::from_millis(20));
    let (a, _b) = mock_transport::connected_pair(empty(), empty(), &config);

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(a.is_live());
}

// ============================================================================
//  REGISTRY
// ============================================================================

#[test]
fn test_registry_rejects_duplicates() {
    let (tx, _rx) = mpsc::unbounded_channel();
    let mut registry = HandlerRegistry::builder();
    registry.plain::<Ping, _>(Record(tx.clone())).expect("register");

    let again = registry.plain::<Ping, _>(Record(tx));
    assert_eq!(again.err(), Some(RegistryError::Duplicate("test.ping".into())));

    let frozen = registry.build();
    assert_eq!(frozen.len(), 1);
    assert!(frozen.contains("test.ping"));
    assert!(frozen.resolve("test.echo").is_none());
}

#[test]
fn test_registry_rejects_empty_identifier() {
    let mut registry = HandlerRegistry::builder();
    let err = registry.register("", Handler::responder::<Echo, _>(EchoBack)).err();
    assert_eq!(err, Some(RegistryError::EmptyIdentifier));
}

#[test]
fn test_builder_reports_first_registration_error() {
    let built = CommanderBuilder::new()
        .responder::<Echo, _>(EchoBack)
        .responder::<EchoNumber, _>(EchoBackNumber)
        .handler("", Handler::plain::<Boom, _>(Panic))
        .build();

    match built {
        Err(Error::Registry(RegistryError::Duplicate(id))) => assert_eq!(id, "test.echo"),
        other => panic!("expected duplicate, got {other:?}"),
    }
}

struct EchoBackNumber;

#[async_trait]
impl Responder<EchoNumber> for EchoBackNumber {
    async fn respond(&self, request: EchoNumber) -> HandlerResult<String> {
        Ok(request.0.to_string())
    }
}

// ============================================================================
//  POOL
// ============================================================================

#[tokio::test]
async fn test_pool_replacement_closes_old_connection() {
    let pool = ConnectionPool::new();
    let endpoint = mock_transport::endpoint(9000);
    let (old, _old_peer) = pair(empty(), empty());
    let (new, _new_peer) = pair(empty(), empty());

    pool.register(endpoint, old.clone()).expect("register");
    pool.register(endpoint, new.clone()).expect("register");

    assert!(!old.is_live());
    assert_eq!(pool.lookup(&endpoint).map(|c| c.id()), Some(new.id()));
    assert_eq!(pool.len(), 1);
}

#[tokio::test]
async fn test_pool_drops_connection_on_close() {
    let pool = ConnectionPool::new();
    let endpoint = mock_transport::endpoint(9001);
    let (conn, _peer) = pair(empty(), empty());

    pool.register(endpoint, conn.clone()).expect("register");
    conn.close();

    assert!(pool.lookup(&endpoint).is_none());
    assert!(pool.is_empty());
}

#[tokio::test]
async fn test_pool_rejects_closed_and_reregistered() {
    let pool = ConnectionPool::new();
    let (closed, _p1) = pair(empty(), empty());
    closed.close();
    assert!(matches!(
        pool.register(mock_transport::endpoint(9002), closed),
        Err(Error::Closed)
    ));

    let (conn, _p2) = pair(empty(), empty());
    pool.register(mock_transport::endpoint(9003), conn.clone()).expect("register");
    assert!(matches!(
        pool.register(mock_transport::endpoint(9004), conn),
        Err(Error::AlreadyRegistered)
    ));
}

#[tokio::test]
async fn test_stale_unregister_keeps_replacement() {
    let pool = ConnectionPool::new();
    let endpoint = mock_transport::endpoint(9005);
    let (old, _p1) = pair(empty(), empty());
    let (new, _p2) = pair(empty(), empty());

    pool.register(endpoint, old.clone()).expect("register");
    pool.register(endpoint, new.clone()).expect("register");

    assert!(!pool.unregister(&old));
    assert_eq!(pool.lookup(&endpoint).map(|c| c.id()), Some(new.id()));
    assert!(pool.unregister(&new));
    assert!(pool.lookup(&endpoint).is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_register_leaves_one_live() {
    let pool = ConnectionPool::new();
    let endpoint = mock_transport::endpoint(9006);

    let mut conns = Vec::new();
    let mut peers = Vec::new();
    for _ in 0..16 {
        let (conn, peer) = pair(empty(), empty());
        conns.push(conn);
        peers.push(peer);
    }

    let tasks: Vec<_> = conns
        .iter()
        .cloned()
        .map(|conn| {
            let pool = pool.clone();
            tokio::spawn(async move { pool.register(endpoint, conn) })
        })
        .collect();
    for task in tasks {
        within(task).await.expect("join").expect("register");
    }

    let live: Vec<_> = conns.iter().filter(|c| c.is_live()).collect();
    assert_eq!(live.len(), 1);
    assert_eq!(pool.lookup(&endpoint).map(|c| c.id()), Some(live[0].id()));
}

#[tokio::test]
async fn test_for_each_live_visits_snapshot() {
    let pool = ConnectionPool::new();
    let mut peers = Vec::new();
    for port in 0..4 {
        let (conn, peer) = pair(empty(), empty());
        pool.register(mock_transport::endpoint(9100 + port), conn).expect("register");
        peers.push(peer);
    }

    // Closing from inside the callback must not deadlock on the map.
    let mut visited = 0;
    pool.for_each_live(|conn| {
        visited += 1;
        conn.close();
    });

    assert_eq!(visited, 4);
    assert!(pool.is_empty());
    assert!(pool.connections().is_empty());
}
