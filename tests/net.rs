//! End-to-end scenarios against the platform engine over loopback.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use sio::{
  Addr, AddrFamily, CancelToken, Error, IoService, Protocol, Socket,
  SocketType, open_socket, open_tcp_socket, open_udp_socket,
};

const DEADLINE: Duration = Duration::from_secs(5);

fn localhost() -> Addr {
  Addr::parse("127.0.0.1", 0).unwrap()
}

/// A connected (client, server-side) TCP pair on loopback.
fn tcp_pair(service: &IoService) -> (Socket, Socket) {
  let listener = open_tcp_socket(service).unwrap();
  listener.bind(localhost()).unwrap();
  listener.listen(16).unwrap();
  let addr = listener.local_addr().unwrap();

  let accepted = listener.accept();
  let client = open_tcp_socket(service).unwrap();
  client
    .connect(addr)
    .wait_timeout(DEADLINE)
    .expect("connect timed out")
    .expect("connect failed");
  let server = accepted
    .wait_timeout(DEADLINE)
    .expect("accept timed out")
    .expect("accept failed")
    .into_connection();
  listener.close().unwrap();
  (client, server)
}

#[test]
fn open_then_close_leaves_no_pending_work() {
  let service = IoService::new().unwrap();
  assert_eq!(service.pending_operations(), 0);
  let socket = open_tcp_socket(&service).unwrap();
  assert!(socket.native_handle().is_some());
  socket.close().unwrap();
  // idempotent
  socket.close().unwrap();
  assert!(socket.native_handle().is_none());
  assert_eq!(service.pending_operations(), 0);
}

#[test]
fn operations_on_a_closed_socket_fail_synchronously() {
  let service = IoService::new().unwrap();
  let socket = open_udp_socket(&service).unwrap();
  socket.close().unwrap();
  let task = socket.recv(vec![0u8; 16]);
  // resolved before any dispatch could have run
  assert!(matches!(task.try_result(), Some(Err(Error::Closed))));
  assert!(matches!(socket.bind(localhost()), Err(Error::Closed)));
  assert_eq!(service.pending_operations(), 0);
}

#[test]
fn close_with_pending_recv_delivers_exactly_one_closed_callback() {
  let service = IoService::new().unwrap();
  let socket = open_udp_socket(&service).unwrap();
  socket.bind(localhost()).unwrap();

  let hits = Arc::new(AtomicUsize::new(0));
  let task = socket.recv_from(vec![0u8; 64]);
  {
    let hits = Arc::clone(&hits);
    task.when_done(move |result| {
      assert!(matches!(result, Err(Error::Closed)));
      hits.fetch_add(1, Ordering::SeqCst);
    });
  }
  // let the recv get armed before pulling the handle out from under it
  std::thread::sleep(Duration::from_millis(50));
  assert_eq!(service.pending_operations(), 1);
  socket.close().unwrap();

  let start = Instant::now();
  while hits.load(Ordering::SeqCst) == 0 && start.elapsed() < DEADLINE {
    std::thread::sleep(Duration::from_millis(5));
  }
  // exactly one delivery, even well after the close settled
  std::thread::sleep(Duration::from_millis(100));
  assert_eq!(hits.load(Ordering::SeqCst), 1);
  assert_eq!(service.pending_operations(), 0);
}

#[test]
fn tcp_accept_connect_send_recv() {
  let service = IoService::new().unwrap();
  let listener = open_tcp_socket(&service).unwrap();
  listener.bind(localhost()).unwrap();
  listener.listen(16).unwrap();
  let addr = listener.local_addr().unwrap();
  assert_ne!(addr.port(), 0);

  let accepted = listener.accept();
  let client = open_tcp_socket(&service).unwrap();
  client
    .connect(addr)
    .wait_timeout(DEADLINE)
    .expect("connect timed out")
    .expect("connect failed");
  assert_eq!(client.remote_addr().unwrap(), addr);

  let server = accepted
    .wait_timeout(DEADLINE)
    .expect("accept timed out")
    .expect("accept failed");
  assert_eq!(server.addr(), client.local_addr().unwrap());
  let server = server.into_connection();
  server.set_keepalive(true).unwrap();

  let sent = client
    .send(b"hello".to_vec(), 5)
    .wait_timeout(DEADLINE)
    .expect("send timed out")
    .expect("send failed");
  assert_eq!(sent.size(), 5);
  assert_eq!(sent.buffer(), b"hello");

  let received = server
    .recv(vec![0u8; 64])
    .wait_timeout(DEADLINE)
    .expect("recv timed out")
    .expect("recv failed");
  assert_eq!(received.size(), 5);
  assert_eq!(received.bytes(), b"hello");

  client.close().unwrap();
  server.close().unwrap();
  listener.close().unwrap();
}

#[test]
fn tcp_v6_accept_connect_round_trip() {
  let service = IoService::new().unwrap();
  let listener =
    open_socket(&service, AddrFamily::V6, SocketType::Stream, Protocol::Tcp)
      .unwrap();
  listener.bind(Addr::parse("::1", 0).unwrap()).unwrap();
  listener.listen(16).unwrap();
  let addr = listener.local_addr().unwrap();
  assert_eq!(addr.family(), AddrFamily::V6);

  let accepted = listener.accept();
  let client =
    open_socket(&service, AddrFamily::V6, SocketType::Stream, Protocol::Tcp)
      .unwrap();
  client
    .connect(addr)
    .wait_timeout(DEADLINE)
    .expect("connect timed out")
    .expect("connect failed");
  let server = accepted
    .wait_timeout(DEADLINE)
    .expect("accept timed out")
    .expect("accept failed");
  assert_eq!(server.addr().family(), AddrFamily::V6);
  let server = server.into_connection();

  client
    .send(b"over v6".to_vec(), 7)
    .wait_timeout(DEADLINE)
    .expect("send timed out")
    .expect("send failed");
  let received = server
    .recv(vec![0u8; 32])
    .wait_timeout(DEADLINE)
    .expect("recv timed out")
    .expect("recv failed");
  assert_eq!(received.bytes(), b"over v6");

  client.close().unwrap();
  server.close().unwrap();
  listener.close().unwrap();
}

#[test]
fn udp_round_trip_reports_sender_address() {
  let service = IoService::new().unwrap();
  let sender = open_udp_socket(&service).unwrap();
  sender.bind(localhost()).unwrap();
  let receiver = open_udp_socket(&service).unwrap();
  receiver.bind(localhost()).unwrap();
  let receiver_addr = receiver.local_addr().unwrap();

  let pending = receiver.recv_from(vec![0u8; 64]);
  let sent = sender
    .send_to(receiver_addr, b"ping".to_vec(), 4)
    .wait_timeout(DEADLINE)
    .expect("send_to timed out")
    .expect("send_to failed");
  assert_eq!(sent.size(), 4);

  let received = pending
    .wait_timeout(DEADLINE)
    .expect("recv_from timed out")
    .expect("recv_from failed");
  assert_eq!(received.bytes(), b"ping");
  assert_eq!(received.addr(), Some(sender.local_addr().unwrap()));

  sender.close().unwrap();
  receiver.close().unwrap();
}

#[test]
fn short_reads_are_successful_completions() {
  let service = IoService::new().unwrap();
  let (client, server) = tcp_pair(&service);

  client
    .send(b"0123456789".to_vec(), 10)
    .wait_timeout(DEADLINE)
    .expect("send timed out")
    .expect("send failed");

  // a 4-byte buffer yields a 4-byte success, not an error
  let first = server
    .recv(vec![0u8; 4])
    .wait_timeout(DEADLINE)
    .expect("recv timed out")
    .expect("recv failed");
  assert_eq!(first.bytes(), b"0123");

  let mut rest = Vec::new();
  while rest.len() < 6 {
    let chunk = server
      .recv(vec![0u8; 16])
      .wait_timeout(DEADLINE)
      .expect("recv timed out")
      .expect("recv failed");
    assert!(chunk.size() > 0);
    rest.extend_from_slice(chunk.bytes());
  }
  assert_eq!(rest, b"456789");

  client.close().unwrap();
  server.close().unwrap();
}

#[test]
fn peer_shutdown_completes_recv_with_zero_bytes() {
  let service = IoService::new().unwrap();
  let (client, server) = tcp_pair(&service);
  client.close().unwrap();
  let received = server
    .recv(vec![0u8; 16])
    .wait_timeout(DEADLINE)
    .expect("recv timed out")
    .expect("recv failed");
  assert_eq!(received.size(), 0);
  server.close().unwrap();
}

#[test]
fn second_recv_on_the_same_socket_is_rejected() {
  let service = IoService::new().unwrap();
  let socket = open_udp_socket(&service).unwrap();
  socket.bind(localhost()).unwrap();

  let first = socket.recv_from(vec![0u8; 16]);
  std::thread::sleep(Duration::from_millis(20));
  let second = socket.recv_from(vec![0u8; 16]);
  assert!(matches!(
    second.try_result(),
    Some(Err(Error::ConcurrentOperation))
  ));
  // opposite directions coexist: a send while the recv is parked
  let target = socket.local_addr().unwrap();
  socket
    .send_to(target, b"x".to_vec(), 1)
    .wait_timeout(DEADLINE)
    .expect("send_to timed out")
    .expect("send_to failed");
  let first = first
    .wait_timeout(DEADLINE)
    .expect("recv_from timed out")
    .expect("recv_from failed");
  assert_eq!(first.bytes(), b"x");
  socket.close().unwrap();
}

#[cfg(unix)]
#[test]
fn operation_losing_the_close_race_fails_with_closed() {
  let service = IoService::new().unwrap();

  // the OS handle dies underneath the wrapper, exactly what an operation
  // sees when close() wins the race after the handle was already read
  let socket = open_udp_socket(&service).unwrap();
  socket.bind(localhost()).unwrap();
  unsafe { libc::close(socket.native_handle().unwrap()) };
  let task = socket.recv_from(vec![0u8; 16]);
  assert!(matches!(task.try_result(), Some(Err(Error::Closed))));
  assert_eq!(service.pending_operations(), 0);

  let client = open_tcp_socket(&service).unwrap();
  unsafe { libc::close(client.native_handle().unwrap()) };
  let task = client.connect(localhost().with_port(9));
  assert!(matches!(task.try_result(), Some(Err(Error::Closed))));

  // the raw handles are gone; dropping the wrappers would close whatever
  // fd the OS has recycled into their slots
  std::mem::forget(socket);
  std::mem::forget(client);
}

#[test]
fn close_racing_initiation_always_resolves_the_task() {
  let service = IoService::new().unwrap();
  for _ in 0..20 {
    let socket = open_udp_socket(&service).unwrap();
    socket.bind(localhost()).unwrap();
    let racer = socket.clone();
    let closer = std::thread::spawn(move || racer.close());
    let task = socket.recv_from(vec![0u8; 16]);
    closer.join().unwrap().unwrap();
    // whoever wins, the task resolves exactly once with Closed: nothing
    // arrives on the socket, so success is not a possible outcome
    let result = task.wait_timeout(DEADLINE).expect("task never resolved");
    assert!(matches!(result, Err(Error::Closed)), "got {result:?}");
  }
  assert_eq!(service.pending_operations(), 0);
}

#[test]
fn teardown_with_a_pending_recv_still_delivers_exactly_one_callback() {
  let hits = Arc::new(AtomicUsize::new(0));
  {
    let service = IoService::new().unwrap();
    let socket = open_udp_socket(&service).unwrap();
    socket.bind(localhost()).unwrap();
    let hits2 = Arc::clone(&hits);
    socket.recv_from(vec![0u8; 8]).when_done(move |result| {
      assert!(matches!(result, Err(Error::Closed)));
      hits2.fetch_add(1, Ordering::SeqCst);
    });
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(service.pending_operations(), 1);
    // socket and engine drop here with the recv still armed
  }
  assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[test]
fn connect_to_a_dead_port_fails_with_connect_error() {
  let service = IoService::new().unwrap();
  // grab a port that nothing listens on
  let probe = open_tcp_socket(&service).unwrap();
  probe.bind(localhost()).unwrap();
  let dead = probe.local_addr().unwrap();
  probe.close().unwrap();

  let client = open_tcp_socket(&service).unwrap();
  let result = client
    .connect(dead)
    .wait_timeout(DEADLINE)
    .expect("connect timed out");
  assert!(matches!(result, Err(Error::Connect(_))));
  client.close().unwrap();
}

#[test]
fn binding_a_busy_address_fails_with_bind_error() {
  let service = IoService::new().unwrap();
  let listener = open_tcp_socket(&service).unwrap();
  listener.bind(localhost()).unwrap();
  listener.listen(16).unwrap();
  let busy = listener.local_addr().unwrap();

  let other = open_tcp_socket(&service).unwrap();
  assert!(matches!(other.bind(busy), Err(Error::Bind(_))));
  other.close().unwrap();
  listener.close().unwrap();
}

#[test]
fn recv_until_streams_items_and_stops_on_cancel() {
  let service = IoService::new().unwrap();
  let (client, server) = tcp_pair(&service);

  let collected = Arc::new(Mutex::new(Vec::new()));
  let token = CancelToken::new();
  {
    let collected = Arc::clone(&collected);
    server.recv_until(
      vec![0u8; 32],
      token.clone(),
      move |event| {
        collected.lock().unwrap().extend_from_slice(event.bytes());
      },
      // the final close may fail a still-armed recv
      |err| assert!(matches!(err, Error::Closed), "loop failed: {err}"),
    );
  }

  client
    .send(b"abc".to_vec(), 3)
    .wait_timeout(DEADLINE)
    .expect("send timed out")
    .expect("send failed");
  std::thread::sleep(Duration::from_millis(30));
  client
    .send(b"def".to_vec(), 3)
    .wait_timeout(DEADLINE)
    .expect("send timed out")
    .expect("send failed");

  let start = Instant::now();
  while collected.lock().unwrap().len() < 6 && start.elapsed() < DEADLINE {
    std::thread::sleep(Duration::from_millis(5));
  }
  assert_eq!(*collected.lock().unwrap(), b"abcdef");

  // cancelled: the next arm never happens, so a later send sits unread
  token.cancel();
  std::thread::sleep(Duration::from_millis(50));
  client.close().unwrap();
  server.close().unwrap();
}

#[cfg(unix)]
#[test]
fn send_file_streams_a_whole_file() {
  use std::io::Write;
  use std::os::fd::AsRawFd;

  let payload = b"file payload streamed over a loopback socket".repeat(64);
  let path = std::env::temp_dir()
    .join(format!("sio-sendfile-{}.tmp", fastrand::u64(..)));
  std::fs::File::create(&path)
    .unwrap()
    .write_all(&payload)
    .unwrap();

  let service = IoService::new().unwrap();
  let (client, server) = tcp_pair(&service);
  let file = std::fs::File::open(&path).unwrap();

  let sent = client.send_file(file.as_raw_fd());
  let mut received = Vec::new();
  while received.len() < payload.len() {
    let chunk = server
      .recv(vec![0u8; 16 * 1024])
      .wait_timeout(DEADLINE)
      .expect("recv timed out")
      .expect("recv failed");
    assert!(chunk.size() > 0, "peer stopped early");
    received.extend_from_slice(chunk.bytes());
  }
  sent
    .wait_timeout(DEADLINE)
    .expect("send_file timed out")
    .expect("send_file failed");
  assert_eq!(received, payload);

  client.close().unwrap();
  server.close().unwrap();
  drop(file);
  let _ = std::fs::remove_file(&path);
}

#[test]
fn accept_until_serves_multiple_clients() {
  let service = IoService::new().unwrap();
  let listener = open_tcp_socket(&service).unwrap();
  listener.bind(localhost()).unwrap();
  listener.listen(16).unwrap();
  let addr = listener.local_addr().unwrap();

  let connections = Arc::new(AtomicUsize::new(0));
  let token = CancelToken::new();
  {
    let connections = Arc::clone(&connections);
    listener.accept_until(
      token.clone(),
      move |event| {
        event.connection().close().unwrap();
        connections.fetch_add(1, Ordering::SeqCst);
      },
      // closing the listener fails the still-armed accept
      |err| assert!(matches!(err, Error::Closed), "accept loop failed: {err}"),
    );
  }

  let mut clients = Vec::new();
  for _ in 0..3 {
    let client = open_tcp_socket(&service).unwrap();
    client
      .connect(addr)
      .wait_timeout(DEADLINE)
      .expect("connect timed out")
      .expect("connect failed");
    clients.push(client);
  }

  let start = Instant::now();
  while connections.load(Ordering::SeqCst) < 3 && start.elapsed() < DEADLINE {
    std::thread::sleep(Duration::from_millis(5));
  }
  assert_eq!(connections.load(Ordering::SeqCst), 3);

  token.cancel();
  for client in clients {
    client.close().unwrap();
  }
  listener.close().unwrap();
}
