// A loopback echo pair: two connections over real TCP sockets, a polling
// reactor standing in for a production thread pool, and a thread-based
// timer. Demonstrates establishment, validation, a twoway invocation, a
// oneway, and a graceful close.

use std::collections::HashSet;
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::Duration;

use icep::connection::{CloseMode, Connection, ConnectionConfig, State};
use icep::dispatch::{Current, DispatchResult, Responder, Servant, ServantManager};
use icep::invocation::Proxy;
use icep::transport::{Buffer, SocketOp, ThreadPool, Timer, TimerToken, Transceiver};
use icep::{Error, Identity, InputStream, OperationMode};

// TCP TRANSCEIVER
//
// Non-blocking stream sockets mapped onto the transceiver contract.
struct TcpTransceiver {
  stream: TcpStream,
  peer: String,
}

impl TcpTransceiver {
  fn new(stream: TcpStream) -> Self {
    stream.set_nonblocking(true).expect("set_nonblocking failed");
    let peer: String = match stream.peer_addr() {
      Ok(addr) => addr.to_string(),
      Err(_) => String::from("<unknown>"),
    };
    TcpTransceiver { stream, peer }
  }
}

impl Transceiver for TcpTransceiver {
  fn initialize(&mut self, _read: &mut Buffer, _write: &mut Buffer) -> Result<SocketOp, Error> {
    Ok(SocketOp::NONE)
  }

  fn read(&mut self, buf: &mut Buffer) -> Result<SocketOp, Error> {
    while !buf.is_complete() {
      match self.stream.read(buf.remaining_mut()) {
        Ok(0) => return Err(Error::ConnectionLost(String::from("connection reset"))),
        Ok(count) => buf.advance(count),
        Err(error) if error.kind() == ErrorKind::WouldBlock => return Ok(SocketOp::READ),
        Err(error) if error.kind() == ErrorKind::Interrupted => continue,
        Err(error) => return Err(Error::ConnectionLost(error.to_string())),
      }
    }
    Ok(SocketOp::NONE)
  }

  fn write(&mut self, buf: &mut Buffer) -> Result<SocketOp, Error> {
    while !buf.is_complete() {
      match self.stream.write(buf.remaining()) {
        Ok(0) => return Err(Error::ConnectionLost(String::from("connection reset"))),
        Ok(count) => buf.advance(count),
        Err(error) if error.kind() == ErrorKind::WouldBlock => return Ok(SocketOp::WRITE),
        Err(error) if error.kind() == ErrorKind::Interrupted => continue,
        Err(error) => return Err(Error::ConnectionLost(error.to_string())),
      }
    }
    Ok(SocketOp::NONE)
  }

  fn closing(&mut self, _initiator: bool, _error: &Error) -> SocketOp {
    SocketOp::NONE
  }

  fn close(&mut self) {
    let _ = self.stream.shutdown(Shutdown::Both);
  }

  fn description(&self) -> String {
    format!("tcp -> {}", self.peer)
  }
}

// POLLING REACTOR
//
// Offers readiness to every registered connection on each poll pass. A
// production deployment would use epoll/kqueue; for a demo, polling the
// non-blocking sockets is enough.
#[derive(Default)]
struct Reactor {
  inner: Mutex<ReactorInner>,
}

#[derive(Default)]
struct ReactorInner {
  interests: Vec<(Weak<Connection>, SocketOp)>,
  finished: Vec<Weak<Connection>>,
}

impl Reactor {
  fn new() -> Arc<Self> {
    Arc::new(Reactor::default())
  }

  // One pass: offer readiness, deliver finish notifications. Returns true
  // while any connection is still registered.
  fn poll(&self) -> bool {
    let interests: Vec<(Weak<Connection>, SocketOp)> =
      self.inner.lock().unwrap().interests.clone();
    for (weak, interest) in interests {
      if let Some(connection) = weak.upgrade() {
        if connection.state() < State::Closed && !interest.is_none() {
          connection.on_ready(interest);
        }
      }
    }
    let finished: Vec<Weak<Connection>> =
      std::mem::take(&mut self.inner.lock().unwrap().finished);
    for weak in finished {
      if let Some(connection) = weak.upgrade() {
        connection.finished(true);
      }
    }
    let inner = self.inner.lock().unwrap();
    !inner.interests.is_empty() || !inner.finished.is_empty()
  }
}

impl ThreadPool for Reactor {
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
    inner.finished.push(key);
    false
  }

  fn dispatch_from_this_thread(&self, work: Box<dyn FnOnce() + Send>) {
    work();
  }
}

// THREAD TIMER
//
// One sleeper thread per scheduled task; canceled tokens are dropped when
// their sleeper wakes.
#[derive(Default)]
struct ThreadTimer {
  next_token: AtomicU64,
  canceled: Arc<Mutex<HashSet<u64>>>,
}

impl Timer for ThreadTimer {
  fn schedule(&self, task: Box<dyn FnOnce() + Send>, delay: Duration) -> TimerToken {
    let token: u64 = self.next_token.fetch_add(1, Ordering::SeqCst) + 1;
    let canceled: Arc<Mutex<HashSet<u64>>> = self.canceled.clone();
    thread::spawn(move || {
      thread::sleep(delay);
      if !canceled.lock().unwrap().remove(&token) {
        task();
      }
    });
    TimerToken(token)
  }

  fn cancel(&self, token: TimerToken) {
    self.canceled.lock().unwrap().insert(token.0);
  }
}

// ECHO SERVANT
struct EchoServant;

impl Servant for EchoServant {
  fn declared_mode(&self, operation: &str) -> Option<OperationMode> {
    match operation {
      "echo" | "log" => Some(OperationMode::Normal),
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
          Ok(message) => {
            println!("server: echoing {message:?}");
            responder.ok(|os| os.write_string(&message));
          }
          Err(error) => responder.unknown_local_exception(&error.to_string()),
        }
        DispatchResult::Completed
      }
      "log" => {
        if let Ok(line) = params.read_string() {
          println!("server: log {line:?}");
        }
        responder.no_response();
        DispatchResult::Completed
      }
      _ => DispatchResult::OperationNotExist(responder),
    }
  }
}

struct EchoManager {
  servant: Arc<dyn Servant>,
}

impl ServantManager for EchoManager {
  fn find(&self, identity: &Identity, _facet: &str) -> Option<Arc<dyn Servant>> {
    if identity.name == "echo" {
      Some(self.servant.clone())
    } else {
      None
    }
  }
}

fn main() {
  let listener: TcpListener = TcpListener::bind("127.0.0.1:0").expect("bind failed");
  let address = listener.local_addr().expect("no local address");
  println!("listening on {address}");

  let client_stream: TcpStream = TcpStream::connect(address).expect("connect failed");
  let (server_stream, _) = listener.accept().expect("accept failed");

  let reactor: Arc<Reactor> = Reactor::new();
  let timer: Arc<ThreadTimer> = Arc::new(ThreadTimer::default());

  let server: Arc<Connection> = Connection::new(
    Box::new(TcpTransceiver::new(server_stream)),
    ConnectionConfig::default(),
    reactor.clone(),
    timer.clone(),
    Some(Arc::new(EchoManager {
      servant: Arc::new(EchoServant),
    })),
  );
  let client: Arc<Connection> = Connection::new(
    Box::new(TcpTransceiver::new(client_stream)),
    ConnectionConfig::default(),
    reactor.clone(),
    timer.clone(),
    None,
  );

  // ESTABLISH
  //
  // The server writes the validation message, the client checks it; the
  // reactor finishes whatever could not complete inline.
  server.start().expect("server start failed");
  client.start().expect("client start failed");
  while client.state() < State::Holding || server.state() < State::Holding {
    reactor.poll();
    thread::sleep(Duration::from_millis(1));
  }
  server.activate();
  client.activate();

  // A reactor thread drives both connections while the main thread plays
  // the application.
  let pump: Arc<Reactor> = reactor.clone();
  let pump_thread = thread::spawn(move || {
    while pump.poll() {
      thread::sleep(Duration::from_millis(1));
    }
  });

  let proxy = Proxy::new(client.clone(), Identity::named("echo"));

  let oneway = proxy
    .invoke_oneway(
      "log",
      OperationMode::Normal,
      None,
      |os| os.write_string("client starting up"),
      None,
    )
    .expect("oneway failed");
  oneway.wait().expect("oneway send failed");

  let future = proxy
    .invoke_twoway(
      "echo",
      OperationMode::Normal,
      None,
      |os| os.write_string("hello, world"),
      None,
    )
    .expect("invoke failed");
  let mut params = future
    .wait()
    .expect("echo failed")
    .ok_params()
    .expect("unexpected reply status");
  println!("client: got {:?}", params.read_string().expect("bad reply"));

  // GRACEFUL CLOSE
  client.close(CloseMode::GracefullyWithWait);
  client.wait_until_finished();
  server.wait_until_finished();
  pump_thread.join().expect("reactor thread panicked");
  println!("closed cleanly");
}
