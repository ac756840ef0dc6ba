//! End-to-end loopback scenarios driving a real bound [`Service`] over TCP
//! and TLS, rather than the `standalone_for_test` sessions the unit tests
//! use.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use weir::{
    Error, Filter, FilterChain, Handler, IdleStatus, Message, ReadController, Service, ServiceConfig, Session,
    SessionId, SessionState,
};

const TEST_CERT_PEM: &[u8] = include_bytes!("fixtures/test-cert.pem");
const TEST_KEY_PEM: &[u8] = include_bytes!("fixtures/test-key.pem");

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Bounces whatever bytes it's given straight back onto the session that
/// produced them, once they've cleared the filter chain.
struct EchoHandler {
    opened: Mutex<Sender<SessionId>>,
}

impl EchoHandler {
    fn new() -> (Self, Receiver<SessionId>) {
        let (tx, rx) = channel();
        (EchoHandler { opened: Mutex::new(tx) }, rx)
    }
}

impl Handler for EchoHandler {
    fn session_opened(&self, session: &Session) {
        let _ = self.opened.lock().unwrap().send(session.id());
    }

    fn message_received(&self, session: &Session, message: Message) {
        if let Some(bytes) = message.downcast_ref::<bytes::Bytes>() {
            session.write(bytes.clone());
        }
    }
}

fn wait_for_id(rx: &Receiver<SessionId>) -> SessionId {
    rx.recv_timeout(Duration::from_secs(2)).expect("session never opened")
}

/// Reads until `want` bytes have arrived or `timeout` elapses.
fn read_exact_within(stream: &mut TcpStream, want: usize, timeout: Duration) -> Vec<u8> {
    stream.set_read_timeout(Some(Duration::from_millis(50))).unwrap();
    let mut out = Vec::new();
    let deadline = Instant::now() + timeout;
    while out.len() < want && Instant::now() < deadline {
        let mut chunk = [0u8; 4096];
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => out.extend_from_slice(&chunk[..n]),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(e) => panic!("read failed: {e}"),
        }
    }
    out
}

fn loopback() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

#[test]
fn echo_roundtrips_unmodified_bytes() {
    init_logging();
    let (handler, opened_rx) = EchoHandler::new();
    let service = Service::new(ServiceConfig::default(), Arc::new(handler), FilterChain::empty());
    let addr = service.bind(loopback()).unwrap();

    let mut client = TcpStream::connect(addr).unwrap();
    wait_for_id(&opened_rx);
    client.write_all(b"ping").unwrap();

    let got = read_exact_within(&mut client, 4, Duration::from_secs(2));
    assert_eq!(got, b"ping");
}

struct UpperCaseFilter;

impl Filter for UpperCaseFilter {
    fn message_received(&self, session: &Session, msg: Message, ctrl: &mut ReadController<'_>) {
        let Some(bytes) = msg.downcast_ref::<bytes::Bytes>() else {
            ctrl.call_read_next(session, msg);
            return;
        };
        let upper: Vec<u8> = bytes.iter().map(u8::to_ascii_uppercase).collect();
        ctrl.call_read_next(session, Message::from(bytes::Bytes::from(upper)));
    }
}

#[test]
fn framed_transform_upper_cases_before_echo() {
    init_logging();
    let (handler, opened_rx) = EchoHandler::new();
    let chain = FilterChain::new(vec![Arc::new(UpperCaseFilter)]);
    let service = Service::new(ServiceConfig::default(), Arc::new(handler), chain);
    let addr = service.bind(loopback()).unwrap();

    let mut client = TcpStream::connect(addr).unwrap();
    wait_for_id(&opened_rx);
    client.write_all(b"abc").unwrap();

    let got = read_exact_within(&mut client, 3, Duration::from_secs(2));
    assert_eq!(got, b"ABC");
}

#[test]
fn concurrent_writes_from_many_threads_all_arrive() {
    init_logging();
    let (handler, opened_rx) = EchoHandler::new();
    let service = Service::new(ServiceConfig::default(), Arc::new(handler), FilterChain::empty());
    let addr = service.bind(loopback()).unwrap();

    let mut client = TcpStream::connect(addr).unwrap();
    let id = wait_for_id(&opened_rx);
    let session = service.session(id).expect("session tracked after opening");

    const THREADS: u8 = 100;
    let handles: Vec<_> = (0..THREADS)
        .map(|i| {
            let session = session.clone();
            std::thread::spawn(move || session.write(bytes::Bytes::copy_from_slice(&[i])))
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let got = read_exact_within(&mut client, THREADS as usize, Duration::from_secs(2));
    let mut seen: Vec<u8> = got.clone();
    seen.sort_unstable();
    let expected: Vec<u8> = (0..THREADS).collect();
    assert_eq!(seen, expected, "expected every byte 0..{THREADS} exactly once");
}

struct IdleCountingHandler {
    opened: Mutex<Sender<SessionId>>,
    read_idle_count: AtomicUsize,
}

impl IdleCountingHandler {
    fn new() -> (Self, Receiver<SessionId>) {
        let (tx, rx) = channel();
        (
            IdleCountingHandler {
                opened: Mutex::new(tx),
                read_idle_count: AtomicUsize::new(0),
            },
            rx,
        )
    }
}

impl Handler for IdleCountingHandler {
    fn session_opened(&self, session: &Session) {
        let _ = self.opened.lock().unwrap().send(session.id());
    }

    fn session_idle(&self, _session: &Session, status: IdleStatus) {
        if status == IdleStatus::ReadIdle {
            self.read_idle_count.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[test]
fn read_idle_fires_after_silence() {
    init_logging();
    let (handler, opened_rx) = IdleCountingHandler::new();
    let handler = Arc::new(handler);
    let mut config = ServiceConfig::default();
    config.read_idle_timeout = Some(Duration::from_secs(1));
    let service = Service::new(config, handler.clone(), FilterChain::empty());
    let addr = service.bind(loopback()).unwrap();

    let _client = TcpStream::connect(addr).unwrap();
    wait_for_id(&opened_rx);

    let deadline = Instant::now() + Duration::from_millis(2500);
    while handler.read_idle_count.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(50));
    }
    assert!(
        handler.read_idle_count.load(Ordering::SeqCst) >= 1,
        "expected at least one read-idle firing"
    );
}

#[test]
fn write_to_closed_session_is_silently_dropped() {
    init_logging();
    let (handler, opened_rx) = EchoHandler::new();
    let service = Service::new(ServiceConfig::default(), Arc::new(handler), FilterChain::empty());
    let addr = service.bind(loopback()).unwrap();

    let mut client = TcpStream::connect(addr).unwrap();
    let id = wait_for_id(&opened_rx);
    let session = service.session(id).expect("session tracked after opening");

    assert_eq!(session.state(), SessionState::Connected);
    session.close(true);
    assert_eq!(session.state(), SessionState::Closing);

    session.write(bytes::Bytes::from_static(b"x"));

    let got = read_exact_within(&mut client, 1, Duration::from_millis(300));
    assert!(got.is_empty(), "closed session must not emit further bytes");
}

#[test]
fn close_with_linger_drains_pending_writes_before_teardown() {
    init_logging();
    let (handler, opened_rx) = EchoHandler::new();
    let service = Service::new(ServiceConfig::default(), Arc::new(handler), FilterChain::empty());
    let addr = service.bind(loopback()).unwrap();

    let mut client = TcpStream::connect(addr).unwrap();
    let id = wait_for_id(&opened_rx);
    let session = service.session(id).expect("session tracked after opening");

    let payload = vec![b'x'; 4096];
    session.write(bytes::Bytes::from(payload.clone()));
    assert_eq!(session.state(), SessionState::Connected);

    let closed = session.close_with_linger(Duration::from_secs(2));
    assert_eq!(session.state(), SessionState::Closing);
    closed.get().expect("close_with_linger future resolves once requested");

    let got = read_exact_within(&mut client, payload.len(), Duration::from_secs(2));
    assert_eq!(got, payload, "queued bytes must reach the peer before teardown");

    let deadline = Instant::now() + Duration::from_secs(2);
    while service.session(id).is_some() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(20));
    }
    assert!(
        service.session(id).is_none(),
        "session should be untracked once the linger drain completes"
    );
}

#[test]
fn cancelling_a_pending_connect_resolves_as_cancelled() {
    init_logging();
    let (handler, _opened_rx) = EchoHandler::new();
    let service = Service::new(ServiceConfig::default(), Arc::new(handler), FilterChain::empty());

    // 192.0.2.1 is reserved for documentation (RFC 5737, TEST-NET-1) and
    // never routable, so this connect stays pending until either the
    // connect timeout or an explicit cancellation resolves it.
    let target: SocketAddr = "192.0.2.1:9".parse().unwrap();
    let connecting = service.connect(target, None);

    assert!(
        connecting.cancel(true),
        "cancel should win the race against an unroutable target"
    );
    let result = connecting.get_timeout(Duration::from_secs(1));
    assert!(matches!(result, Err(Error::Cancelled)), "expected Cancelled, got {result:?}");
}

fn test_tls_configs() -> (Arc<rustls::ServerConfig>, Arc<rustls::ClientConfig>) {
    let cert_der = rustls_pemfile::certs(&mut &TEST_CERT_PEM[..])
        .next()
        .expect("fixture cert")
        .expect("valid cert PEM");
    let key_der = rustls_pemfile::pkcs8_private_keys(&mut &TEST_KEY_PEM[..])
        .next()
        .expect("fixture key")
        .expect("valid key PEM");

    let server_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(
            vec![cert_der.clone()],
            rustls::pki_types::PrivateKeyDer::Pkcs8(key_der),
        )
        .unwrap();

    let mut roots = rustls::RootCertStore::empty();
    roots.add(cert_der).unwrap();
    let client_config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();

    (Arc::new(server_config), Arc::new(client_config))
}

#[test]
fn tls_handshake_then_ciphered_echo() {
    init_logging();
    let (server_cfg, client_cfg) = test_tls_configs();
    let (handler, opened_rx) = EchoHandler::new();
    let mut config = ServiceConfig::default();
    config.tls = Some(server_cfg);
    let service = Service::new(config, Arc::new(handler), FilterChain::empty());
    let addr = service.bind(loopback()).unwrap();

    let server_name = rustls::pki_types::ServerName::try_from("localhost").unwrap();
    let mut conn = rustls::ClientConnection::new(client_cfg, server_name).unwrap();
    let mut sock = TcpStream::connect(addr).unwrap();
    sock.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    {
        let mut tls = rustls::Stream::new(&mut conn, &mut sock);
        tls.write_all(b"hello").unwrap();
        let mut buf = [0u8; 5];
        tls.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }

    let id = wait_for_id(&opened_rx);
    let session = service.session(id).expect("session tracked after opening");
    assert!(session.is_secured());
}
