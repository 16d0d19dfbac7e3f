// Copyright © 2026 The icep Developers
//
// Test scaffolding: an in-memory duplex pipe speaking the Transceiver
// contract, a deterministic inline thread pool, a manually fired timer, and
// a handful of servants. Tests drive readiness by hand, so every schedule
// is reproducible.

// Each test binary uses a different subset of this module.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use icep::connection::{Connection, ConnectionConfig, State};
use icep::dispatch::{Current, DispatchResult, Responder, Servant, ServantManager};
use icep::transport::{Buffer, SocketOp, ThreadPool, Timer, TimerToken, Transceiver};
use icep::{Error, Identity, InputStream, OperationMode};

// ---------------------------------------------------------------------------
// PIPE
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, PartialEq, Eq)]
enum Side {
  Client,
  Server,
}

#[derive(Default)]
struct WireState {
  to_server: VecDeque<u8>,
  to_client: VecDeque<u8>,
  client_closed: bool,
  server_closed: bool,
  to_server_limit: Option<usize>,
  to_client_limit: Option<usize>,
}

/// The test's view of the wire between the two pipe ends.
#[derive(Clone)]
pub struct Wire {
  state: Arc<Mutex<WireState>>,
}

impl Wire {
  pub fn pending_to_server(&self) -> usize {
    self.state.lock().unwrap().to_server.len()
  }

  pub fn pending_to_client(&self) -> usize {
    self.state.lock().unwrap().to_client.len()
  }

  pub fn peek_to_server(&self) -> Vec<u8> {
    self.state.lock().unwrap().to_server.iter().copied().collect()
  }

  pub fn peek_to_client(&self) -> Vec<u8> {
    self.state.lock().unwrap().to_client.iter().copied().collect()
  }

  /// Caps how many bytes the client→server direction buffers; `None`
  /// removes the cap. Used to force partial writes and queuing.
  pub fn set_limit_to_server(&self, limit: Option<usize>) {
    self.state.lock().unwrap().to_server_limit = limit;
  }

  pub fn capacity_to_server(&self) -> usize {
    let state = self.state.lock().unwrap();
    match state.to_server_limit {
      None => usize::MAX,
      Some(limit) => limit.saturating_sub(state.to_server.len()),
    }
  }

  pub fn client_closed(&self) -> bool {
    self.state.lock().unwrap().client_closed
  }

  pub fn server_closed(&self) -> bool {
    self.state.lock().unwrap().server_closed
  }

  /// Injects raw bytes as if the server had written them.
  pub fn inject_to_client(&self, bytes: &[u8]) {
    self.state.lock().unwrap().to_client.extend(bytes.iter().copied());
  }
}

/// One end of the duplex pipe, implementing the transceiver contract.
pub struct PipeEnd {
  state: Arc<Mutex<WireState>>,
  side: Side,
}

/// An in-memory connected pair: (client end, server end, wire handle).
pub fn pipe() -> (PipeEnd, PipeEnd, Wire) {
  let state: Arc<Mutex<WireState>> = Arc::new(Mutex::new(WireState::default()));
  (
    PipeEnd {
      state: state.clone(),
      side: Side::Client,
    },
    PipeEnd {
      state: state.clone(),
      side: Side::Server,
    },
    Wire { state },
  )
}

impl Transceiver for PipeEnd {
  fn initialize(&mut self, _read: &mut Buffer, _write: &mut Buffer) -> Result<SocketOp, Error> {
    Ok(SocketOp::NONE)
  }

  fn read(&mut self, buf: &mut Buffer) -> Result<SocketOp, Error> {
    let mut state = self.state.lock().unwrap();
    let peer_closed = match self.side {
      Side::Client => state.server_closed,
      Side::Server => state.client_closed,
    };
    let queue = match self.side {
      Side::Client => &mut state.to_client,
      Side::Server => &mut state.to_server,
    };
    while !buf.is_complete() {
      match queue.pop_front() {
        Some(byte) => {
          buf.remaining_mut()[0] = byte;
          buf.advance(1);
        }
        None => {
          if peer_closed {
            return Err(Error::ConnectionLost(String::from("pipe closed by peer")));
          }
          return Ok(SocketOp::READ);
        }
      }
    }
    Ok(SocketOp::NONE)
  }

  fn write(&mut self, buf: &mut Buffer) -> Result<SocketOp, Error> {
    let mut state = self.state.lock().unwrap();
    if match self.side {
      Side::Client => state.server_closed || state.client_closed,
      Side::Server => state.client_closed || state.server_closed,
    } {
      return Err(Error::ConnectionLost(String::from("pipe closed")));
    }
    let limit = match self.side {
      Side::Client => state.to_server_limit,
      Side::Server => state.to_client_limit,
    };
    let queue = match self.side {
      Side::Client => &mut state.to_server,
      Side::Server => &mut state.to_client,
    };
    let capacity: usize = match limit {
      None => usize::MAX,
      Some(limit) => limit.saturating_sub(queue.len()),
    };
    let count: usize = capacity.min(buf.remaining().len());
    queue.extend(buf.remaining()[..count].iter().copied());
    buf.advance(count);
    if buf.is_complete() {
      Ok(SocketOp::NONE)
    } else {
      Ok(SocketOp::WRITE)
    }
  }

  fn closing(&mut self, _initiator: bool, _error: &Error) -> SocketOp {
    SocketOp::NONE
  }

  fn close(&mut self) {
    let mut state = self.state.lock().unwrap();
    match self.side {
      Side::Client => state.client_closed = true,
      Side::Server => state.server_closed = true,
    }
  }

  fn description(&self) -> String {
    match self.side {
      Side::Client => String::from("test-pipe (client side)"),
      Side::Server => String::from("test-pipe (server side)"),
    }
  }
}

// ---------------------------------------------------------------------------
// THREAD POOL
// ---------------------------------------------------------------------------

#[derive(Default)]
struct PoolInner {
  interests: Vec<(Weak<Connection>, SocketOp)>,
  finished: VecDeque<Weak<Connection>>,
}

/// A deterministic inline pool: it records interest, queues finish
/// notifications for the test to drain, and runs dispatch work on the
/// calling thread.
#[derive(Default)]
pub struct TestPool {
  inner: Mutex<PoolInner>,
}

impl TestPool {
  pub fn new() -> Arc<Self> {
    Arc::new(TestPool::default())
  }

  /// The interest currently registered for `connection`.
  pub fn interest(&self, connection: &Arc<Connection>) -> SocketOp {
    let inner = self.inner.lock().unwrap();
    for (weak, interest) in &inner.interests {
      if weak.ptr_eq(&Arc::downgrade(connection)) {
        return *interest;
      }
    }
    SocketOp::NONE
  }

  /// Delivers queued finish notifications; returns how many ran.
  pub fn drain_finished(&self) -> usize {
    let mut count: usize = 0;
    loop {
      let next: Option<Weak<Connection>> = self.inner.lock().unwrap().finished.pop_front();
      match next {
        Some(weak) => {
          if let Some(connection) = weak.upgrade() {
            connection.finished(true);
            count += 1;
          }
        }
        None => return count,
      }
    }
  }
}

impl ThreadPool for TestPool {
  fn register(&self, connection: &Arc<Connection>, interest: SocketOp) {
    let mut inner = self.inner.lock().unwrap();
    let key = Arc::downgrade(connection);
    for (weak, existing) in &mut inner.interests {
      if weak.ptr_eq(&key) {
        *existing |= interest;
        return;
      }
    }
    inner.interests.push((key, interest));
  }

  fn unregister(&self, connection: &Arc<Connection>, interest: SocketOp) {
    let mut inner = self.inner.lock().unwrap();
    let key = Arc::downgrade(connection);
    for (weak, existing) in &mut inner.interests {
      if weak.ptr_eq(&key) {
        *existing = existing.without(interest);
        return;
      }
    }
  }

  fn update(&self, connection: &Arc<Connection>, old: SocketOp, new: SocketOp) {
    let mut inner = self.inner.lock().unwrap();
    let key = Arc::downgrade(connection);
    for (weak, existing) in &mut inner.interests {
      if weak.ptr_eq(&key) {
        *existing = existing.without(old) | new;
        return;
      }
    }
    inner.interests.push((key, new));
  }

  fn finish(&self, connection: &Arc<Connection>) -> bool {
    let mut inner = self.inner.lock().unwrap();
    let key = Arc::downgrade(connection);
    inner.interests.retain(|(weak, _)| !weak.ptr_eq(&key));
    inner.finished.push_back(key);
    false
  }

  fn dispatch_from_this_thread(&self, work: Box<dyn FnOnce() + Send>) {
    work();
  }
}

// ---------------------------------------------------------------------------
// TIMER
// ---------------------------------------------------------------------------

type TimerTask = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct TimerInner {
  next_token: u64,
  tasks: Vec<(u64, Duration, TimerTask)>,
}

/// A timer that never fires on its own; tests fire tasks explicitly.
#[derive(Default)]
pub struct TestTimer {
  inner: Mutex<TimerInner>,
}

impl TestTimer {
  pub fn new() -> Arc<Self> {
    Arc::new(TestTimer::default())
  }

  pub fn task_count(&self) -> usize {
    self.inner.lock().unwrap().tasks.len()
  }

  /// Fires the earliest-scheduled task, if any.
  pub fn fire_next(&self) -> bool {
    let task: Option<TimerTask> = {
      let mut inner = self.inner.lock().unwrap();
      if inner.tasks.is_empty() {
        None
      } else {
        Some(inner.tasks.remove(0).2)
      }
    };
    match task {
      Some(task) => {
        task();
        true
      }
      None => false,
    }
  }
}

impl Timer for TestTimer {
  fn schedule(&self, task: TimerTask, delay: Duration) -> TimerToken {
    let mut inner = self.inner.lock().unwrap();
    inner.next_token += 1;
    let token: u64 = inner.next_token;
    inner.tasks.push((token, delay, task));
    TimerToken(token)
  }

  fn cancel(&self, token: TimerToken) {
    let mut inner = self.inner.lock().unwrap();
    inner.tasks.retain(|(id, _, _)| *id != token.0);
  }
}

// ---------------------------------------------------------------------------
// SERVANTS
// ---------------------------------------------------------------------------

/// Replies to `echo` with its single string argument and to the idempotent
/// `version` with a constant; anything else is operation-not-exist.
pub struct EchoServant;

impl Servant for EchoServant {
  // The metadata a generated dispatch switch would carry.
  fn declared_mode(&self, operation: &str) -> Option<OperationMode> {
    match operation {
      "echo" | "fail" => Some(OperationMode::Normal),
      "version" => Some(OperationMode::Idempotent),
      _ => None,
    }
  }

  fn dispatch(
    &self,
    current: &Current,
    params: &mut InputStream,
    responder: Responder,
  ) -> DispatchResult {
    match current.operation.as_str() {
      "echo" => {
        match params.read_string() {
          Ok(message) => responder.ok(|os| os.write_string(&message)),
          Err(error) => responder.unknown_local_exception(&error.to_string()),
        }
        DispatchResult::Completed
      }
      "version" => {
        responder.ok(|os| os.write_string("1.1"));
        DispatchResult::Completed
      }
      "fail" => {
        responder.user_exception("::test::Boom", |os| {
          os.write_string("boom");
        });
        DispatchResult::Completed
      }
      _ => DispatchResult::OperationNotExist(responder),
    }
  }
}

/// Records the string argument of every `note` call, in arrival order.
#[derive(Default)]
pub struct RecordServant {
  pub seen: Mutex<Vec<String>>,
}

impl Servant for RecordServant {
  fn dispatch(
    &self,
    current: &Current,
    params: &mut InputStream,
    responder: Responder,
  ) -> DispatchResult {
    match current.operation.as_str() {
      "note" => {
        if let Ok(tag) = params.read_string() {
          self.seen.lock().unwrap().push(tag);
        }
        responder.ok(|_| {});
        DispatchResult::Completed
      }
      _ => DispatchResult::OperationNotExist(responder),
    }
  }
}

/// Stashes every responder instead of replying, so tests can hold replies
/// back and release them later.
#[derive(Default)]
pub struct DeferServant {
  pending: Mutex<Vec<Responder>>,
}

impl DeferServant {
  pub fn pending_count(&self) -> usize {
    self.pending.lock().unwrap().len()
  }

  /// Completes every held dispatch with an empty success reply.
  pub fn release_all(&self) {
    let pending: Vec<Responder> = std::mem::take(&mut *self.pending.lock().unwrap());
    for responder in pending {
      responder.ok(|_| {});
    }
  }
}

impl Servant for DeferServant {
  fn dispatch(
    &self,
    _current: &Current,
    _params: &mut InputStream,
    responder: Responder,
  ) -> DispatchResult {
    self.pending.lock().unwrap().push(responder);
    DispatchResult::Deferred
  }
}

/// Servants keyed by identity name; facets are not used by these tests.
#[derive(Default)]
pub struct MapServantManager {
  servants: HashMap<String, Arc<dyn Servant>>,
}

impl MapServantManager {
  pub fn with(name: &str, servant: Arc<dyn Servant>) -> Arc<Self> {
    let mut servants: HashMap<String, Arc<dyn Servant>> = HashMap::new();
    servants.insert(name.to_owned(), servant);
    Arc::new(MapServantManager { servants })
  }
}

impl ServantManager for MapServantManager {
  fn find(&self, identity: &Identity, _facet: &str) -> Option<Arc<dyn Servant>> {
    self.servants.get(&identity.name).cloned()
  }
}

// ---------------------------------------------------------------------------
// LINK
// ---------------------------------------------------------------------------

/// A validated, activated client/server pair over one pipe.
pub struct Link {
  pub client: Arc<Connection>,
  pub server: Arc<Connection>,
  pub wire: Wire,
  pub client_pool: Arc<TestPool>,
  pub server_pool: Arc<TestPool>,
  pub client_timer: Arc<TestTimer>,
  pub server_timer: Arc<TestTimer>,
}

/// Establishes a link with default configurations.
pub fn establish(manager: Arc<dyn ServantManager>) -> Link {
  establish_with(manager, ConnectionConfig::default(), ConnectionConfig::default())
}

pub fn establish_with(
  manager: Arc<dyn ServantManager>,
  client_config: ConnectionConfig,
  server_config: ConnectionConfig,
) -> Link {
  let (client_end, server_end, wire) = pipe();
  let client_pool: Arc<TestPool> = TestPool::new();
  let server_pool: Arc<TestPool> = TestPool::new();
  let client_timer: Arc<TestTimer> = TestTimer::new();
  let server_timer: Arc<TestTimer> = TestTimer::new();

  let server: Arc<Connection> = Connection::new(
    Box::new(server_end),
    server_config,
    server_pool.clone(),
    server_timer.clone(),
    Some(manager),
  );
  let client: Arc<Connection> = Connection::new(
    Box::new(client_end),
    client_config,
    client_pool.clone(),
    client_timer.clone(),
    None,
  );

  // The server writes the validate-connection message; the client reads and
  // checks it. The pipe never blocks here, so both complete inline.
  server.start().expect("server validation failed");
  client.start().expect("client validation failed");
  assert_eq!(server.state(), State::Holding);
  assert_eq!(client.state(), State::Holding);

  server.activate();
  client.activate();

  Link {
    client,
    server,
    wire,
    client_pool,
    server_pool,
    client_timer,
    server_timer,
  }
}

impl Link {
  /// Shuttles readiness between the two ends until nothing moves: pending
  /// bytes are offered to readers, capacity to writers, EOFs to survivors,
  /// and finish notifications are drained. Bounded, so a wedged engine
  /// fails the test instead of hanging it.
  pub fn run(&self) {
    for _ in 0..10_000 {
      let mut progressed: bool = false;

      let server_interest: SocketOp = self.server_pool.interest(&self.server);
      if server_interest.contains(SocketOp::READ)
        && self.server.state() < State::Closed
        && (self.wire.pending_to_server() > 0 || self.wire.client_closed())
      {
        self.server.on_ready(SocketOp::READ);
        progressed = true;
      }
      if server_interest.contains(SocketOp::WRITE) && self.server.state() < State::Closed {
        self.server.on_ready(SocketOp::WRITE);
        progressed = true;
      }

      let client_interest: SocketOp = self.client_pool.interest(&self.client);
      if client_interest.contains(SocketOp::READ)
        && self.client.state() < State::Closed
        && (self.wire.pending_to_client() > 0 || self.wire.server_closed())
      {
        self.client.on_ready(SocketOp::READ);
        progressed = true;
      }
      if client_interest.contains(SocketOp::WRITE)
        && self.client.state() < State::Closed
        && self.wire.capacity_to_server() > 0
      {
        self.client.on_ready(SocketOp::WRITE);
        progressed = true;
      }

      if self.client_pool.drain_finished() > 0 {
        progressed = true;
      }
      if self.server_pool.drain_finished() > 0 {
        progressed = true;
      }

      if !progressed {
        return;
      }
    }
    panic!("link did not quiesce");
  }
}
