// Copyright © 2026 The icep Developers
//
// The client path: oneways, batches, cancellation, compression, reply
// statuses, and send-queue ordering under backpressure.

mod support;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use icep::connection::{CloseMode, State};
use icep::invocation::{CompressBatch, InvocationState, Proxy};
use icep::{Error, Identity, OperationMode, ReplyStatus, SendError};

use support::{establish, DeferServant, EchoServant, MapServantManager, RecordServant};

#[test]
fn test_oneway_resolves_on_send() {
  let servant = Arc::new(RecordServant::default());
  let link = establish(MapServantManager::with("rec", servant.clone()));
  let proxy = Proxy::new(link.client.clone(), Identity::named("rec"));

  let future = proxy
    .invoke_oneway(
      "note",
      OperationMode::Normal,
      None,
      |os| os.write_string("ping"),
      None,
    )
    .unwrap();
  // The pipe never blocks, so the oneway was sent synchronously.
  assert_eq!(future.invocation().state(), InvocationState::Sent);
  future.wait().unwrap();

  link.run();
  assert_eq!(*servant.seen.lock().unwrap(), vec!["ping".to_string()]);
  assert_eq!(link.server.pending_dispatches(), 0);
}

#[test]
fn test_batch_flush_carries_all_requests_in_one_frame() {
  let servant = Arc::new(RecordServant::default());
  let link = establish(MapServantManager::with("rec", servant.clone()));
  let proxy = Proxy::new(link.client.clone(), Identity::named("rec"));

  for tag in ["a", "b", "c"] {
    proxy
      .invoke_batch_oneway("note", OperationMode::Normal, None, |os| {
        os.write_string(tag)
      })
      .unwrap();
  }
  // Nothing on the wire until the flush.
  assert_eq!(link.wire.pending_to_server(), 0);

  let future = proxy.flush_batch(CompressBatch::No).unwrap();
  let frame: Vec<u8> = link.wire.peek_to_server();
  assert_eq!(frame[8], 1); // batch-request message type
  future.wait().unwrap();

  link.run();
  assert_eq!(
    *servant.seen.lock().unwrap(),
    vec!["a".to_string(), "b".to_string(), "c".to_string()]
  );
}

#[test]
fn test_flush_of_empty_batch_resolves_immediately() {
  let link = establish(MapServantManager::with("rec", Arc::new(RecordServant::default())));
  let proxy = Proxy::new(link.client.clone(), Identity::named("rec"));
  let future = proxy.flush_batch(CompressBatch::BasedOnProxy).unwrap();
  future.wait().unwrap();
  assert_eq!(link.wire.pending_to_server(), 0);
}

#[test]
fn test_cancellation_before_send_preserves_frame_integrity() {
  let servant = Arc::new(RecordServant::default());
  let link = establish(MapServantManager::with("rec", servant.clone()));
  let proxy = Proxy::new(link.client.clone(), Identity::named("rec"));

  // Choke the wire so the first request sticks mid-frame and the rest
  // queue behind it.
  link.wire.set_limit_to_server(Some(50));

  let sent_order: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));
  let mut futures = Vec::new();
  for index in 0..10usize {
    let order = sent_order.clone();
    let future = proxy
      .invoke_oneway(
        "note",
        OperationMode::Normal,
        None,
        |os| os.write_string(&index.to_string()),
        Some(Box::new(move || order.lock().unwrap().push(index))),
      )
      .unwrap();
    futures.push(future);
  }

  // Cancel the sixth request while it is still queued.
  futures[5].cancel();
  assert_eq!(
    futures[5].invocation().state(),
    InvocationState::Canceled
  );

  // Open the floodgates and let everything drain.
  link.wire.set_limit_to_server(None);
  link.run();

  let expected: Vec<String> = [0, 1, 2, 3, 4, 6, 7, 8, 9]
    .iter()
    .map(|index| index.to_string())
    .collect();
  assert_eq!(*servant.seen.lock().unwrap(), expected);
  assert_eq!(link.wire.pending_to_server(), 0);

  // Sent-callbacks preserve enqueue order, skipping the canceled request.
  assert_eq!(*sent_order.lock().unwrap(), vec![0, 1, 2, 3, 4, 6, 7, 8, 9]);

  for (index, future) in futures.into_iter().enumerate() {
    if index == 5 {
      assert_eq!(future.wait().unwrap_err(), Error::InvocationCanceled);
    } else {
      future.wait().unwrap();
    }
  }
}

#[test]
fn test_wait_timeout_cancels_invocation() {
  let defer = Arc::new(DeferServant::default());
  let link = establish(MapServantManager::with("slow", defer.clone()));
  let proxy = Proxy::new(link.client.clone(), Identity::named("slow"));

  let future = proxy
    .invoke_twoway("wait", OperationMode::Normal, None, |_| {}, None)
    .unwrap();
  link.run();
  assert_eq!(defer.pending_count(), 1);

  let error = future.wait_timeout(Duration::from_millis(50)).unwrap_err();
  assert_eq!(error, Error::InvocationTimeout);
  assert_eq!(link.client.pending_requests(), 0);

  // A late reply for the canceled request is silently discarded.
  defer.release_all();
  link.run();
  assert_eq!(link.client.state(), State::Active);
}

#[test]
fn test_object_not_exist_reply() {
  let link = establish(MapServantManager::with("echo", Arc::new(EchoServant)));
  let proxy = Proxy::new(link.client.clone(), Identity::named("nobody"));

  let future = proxy
    .invoke_twoway("poke", OperationMode::Normal, None, |_| {}, None)
    .unwrap();
  link.run();

  let mut reply = future.wait().unwrap();
  assert_eq!(reply.status, ReplyStatus::ObjectNotExist);
  let identity = Identity::read(&mut reply.stream).unwrap();
  assert_eq!(identity.name, "nobody");
  let facets: Vec<String> = reply.stream.read_seq(|is| is.read_string()).unwrap();
  assert!(facets.is_empty());
  assert_eq!(reply.stream.read_string().unwrap(), "poke");
}

#[test]
fn test_operation_not_exist_reply() {
  let link = establish(MapServantManager::with("echo", Arc::new(EchoServant)));
  let proxy = Proxy::new(link.client.clone(), Identity::named("echo"));

  let future = proxy
    .invoke_twoway("bogus", OperationMode::Normal, None, |_| {}, None)
    .unwrap();
  link.run();

  let reply = future.wait().unwrap();
  assert_eq!(reply.status, ReplyStatus::OperationNotExist);
}

#[test]
fn test_weaker_sent_mode_is_rejected() {
  let link = establish(MapServantManager::with("echo", Arc::new(EchoServant)));
  let proxy = Proxy::new(link.client.clone(), Identity::named("echo"));

  // An idempotent-mode request for the idempotent-declared operation runs.
  let accepted = proxy
    .invoke_twoway("version", OperationMode::Idempotent, None, |_| {}, None)
    .unwrap();
  link.run();
  let mut params = accepted.wait().unwrap().ok_params().unwrap();
  assert_eq!(params.read_string().unwrap(), "1.1");

  // A normal-mode request for the same operation is rejected before the
  // servant runs: the sender does not know the operation may re-execute.
  let rejected = proxy
    .invoke_twoway("version", OperationMode::Normal, None, |_| {}, None)
    .unwrap();
  link.run();
  let reply = rejected.wait().unwrap();
  assert_eq!(reply.status, ReplyStatus::UnknownLocalException);
}

#[test]
fn test_user_exception_reaches_the_caller() {
  let link = establish(MapServantManager::with("echo", Arc::new(EchoServant)));
  let proxy = Proxy::new(link.client.clone(), Identity::named("echo"));

  let future = proxy
    .invoke_twoway("fail", OperationMode::Normal, None, |_| {}, None)
    .unwrap();
  link.run();

  let mut reply = future.wait().unwrap();
  assert_eq!(reply.status, ReplyStatus::UserException);
  reply.stream.start_encaps().unwrap();
  let header = reply.stream.read_slice_header().unwrap();
  assert_eq!(header.type_id.as_deref(), Some("::test::Boom"));
  assert_eq!(reply.stream.read_string().unwrap(), "boom");
}

#[test]
fn test_failed_connection_reports_retriable_send_error() {
  let link = establish(MapServantManager::with("echo", Arc::new(EchoServant)));
  link.client.close(CloseMode::Forcefully);
  link.client_pool.drain_finished();

  let proxy = Proxy::new(link.client.clone(), Identity::named("echo"));
  let error = proxy
    .invoke_twoway("echo", OperationMode::Normal, None, |_| {}, None)
    .unwrap_err();
  assert!(matches!(
    error,
    SendError::Retry(Error::ManuallyClosed { graceful: false })
  ));
}

#[cfg(feature = "bzip2")]
#[test]
fn test_compressed_round_trip() {
  let link = establish(MapServantManager::with("echo", Arc::new(EchoServant)));
  let proxy = Proxy::new(link.client.clone(), Identity::named("echo")).with_compress(true);

  let payload: String = "x".repeat(300);
  let sent: String = payload.clone();
  let future = proxy
    .invoke_twoway(
      "echo",
      OperationMode::Normal,
      None,
      move |os| os.write_string(&sent),
      None,
    )
    .unwrap();

  // The frame on the wire is marked compressed and is smaller than the
  // repetitive payload it carries.
  let frame: Vec<u8> = link.wire.peek_to_server();
  assert_eq!(frame[9], 2);
  assert!(frame.len() < 300);

  link.run();
  let mut params = future.wait().unwrap().ok_params().unwrap();
  assert_eq!(params.read_string().unwrap(), payload);
}

#[test]
fn test_small_compress_eligible_message_stays_plain() {
  let link = establish(MapServantManager::with("echo", Arc::new(EchoServant)));
  let proxy = Proxy::new(link.client.clone(), Identity::named("echo")).with_compress(true);

  let future = proxy
    .invoke_twoway(
      "echo",
      OperationMode::Normal,
      None,
      |os| os.write_string("hi"),
      None,
    )
    .unwrap();

  // Below the compression floor: the status byte only advertises support.
  let frame: Vec<u8> = link.wire.peek_to_server();
  assert_eq!(frame[9], 1);

  link.run();
  let mut params = future.wait().unwrap().ok_params().unwrap();
  assert_eq!(params.read_string().unwrap(), "hi");
}

#[test]
fn test_sent_callback_fires_before_reply() {
  let link = establish(MapServantManager::with("echo", Arc::new(EchoServant)));
  let proxy = Proxy::new(link.client.clone(), Identity::named("echo"));

  let log: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
  let sent_log = log.clone();
  let future = proxy
    .invoke_twoway(
      "echo",
      OperationMode::Normal,
      None,
      |os| os.write_string("hi"),
      Some(Box::new(move || sent_log.lock().unwrap().push("sent"))),
    )
    .unwrap();
  link.run();

  future.wait().unwrap();
  log.lock().unwrap().push("reply");
  assert_eq!(*log.lock().unwrap(), vec!["sent", "reply"]);
}
