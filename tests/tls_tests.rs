//! TLS engine tests: in-memory session pairs shuttling records directly,
//! plus a full loop-driven encrypted echo through `TcpServer` + `wrap_tls`.

use bytes::Bytes;
use io_reactor::{Reactor, SslContext, SslSession, TcpServer, TcpStream, Timer, TlsState};
use std::cell::RefCell;
use std::path::Path;
use std::rc::Rc;
use std::time::{Duration, Instant};

fn cert_path() -> &'static Path {
    Path::new(concat!(env!("CARGO_MANIFEST_DIR"), "/tests/data/cert.pem"))
}

fn key_path() -> &'static Path {
    Path::new(concat!(env!("CARGO_MANIFEST_DIR"), "/tests/data/key.pem"))
}

fn session_pair() -> (SslSession, SslSession) {
    let server_ctx = SslContext::server(cert_path(), key_path()).unwrap();
    let client_ctx = SslContext::client(None, false).unwrap();
    let client = SslSession::client(&client_ctx, "127.0.0.1".parse().unwrap()).unwrap();
    let server = SslSession::server(&server_ctx).unwrap();
    (client, server)
}

/// Shuttle pending records between the two sessions until both sides go
/// quiet, collecting each side's decrypted plaintext.
fn shuttle(
    client: &mut SslSession,
    server: &mut SslSession,
    client_plain: &mut Vec<u8>,
    server_plain: &mut Vec<u8>,
) {
    for _ in 0..32 {
        let mut moved = false;
        if let Some(wire) = client.take_outgoing() {
            moved = true;
            server
                .on_ciphertext_from_peer(&wire, &mut |plain| {
                    server_plain.extend_from_slice(plain);
                    true
                })
                .unwrap();
        }
        if let Some(wire) = server.take_outgoing() {
            moved = true;
            client
                .on_ciphertext_from_peer(&wire, &mut |plain| {
                    client_plain.extend_from_slice(plain);
                    true
                })
                .unwrap();
        }
        if !moved {
            return;
        }
    }
    panic!("sessions did not settle");
}

#[test]
fn test_handshake_completes() {
    let (mut client, mut server) = session_pair();
    let mut a = Vec::new();
    let mut b = Vec::new();
    shuttle(&mut client, &mut server, &mut a, &mut b);
    assert!(client.is_established());
    assert!(server.is_established());
    assert!(a.is_empty());
    assert!(b.is_empty());
}

#[test]
fn test_plaintext_queued_before_handshake_is_flushed() {
    let (mut client, mut server) = session_pair();
    client.enqueue(Bytes::from_static(b"early bird"));
    assert_eq!(client.queued_len(), 10);
    client.flush().unwrap();
    assert!(!client.is_established());

    let mut client_plain = Vec::new();
    let mut server_plain = Vec::new();
    shuttle(&mut client, &mut server, &mut client_plain, &mut server_plain);
    assert!(client.is_established());
    assert_eq!(client.queued_len(), 0);
    assert_eq!(server_plain, b"early bird");
}

#[test]
fn test_bidirectional_data_in_order() {
    let (mut client, mut server) = session_pair();
    let mut client_plain = Vec::new();
    let mut server_plain = Vec::new();
    shuttle(&mut client, &mut server, &mut client_plain, &mut server_plain);

    client.enqueue(Bytes::from_static(b"ping "));
    client.enqueue(Bytes::from_static(b"ping"));
    client.flush().unwrap();
    server.enqueue(Bytes::from_static(b"pong"));
    server.flush().unwrap();
    shuttle(&mut client, &mut server, &mut client_plain, &mut server_plain);

    assert_eq!(server_plain, b"ping ping");
    assert_eq!(client_plain, b"pong");
}

#[test]
fn test_shutdown_sends_close_notify() {
    let (mut client, mut server) = session_pair();
    let mut a = Vec::new();
    let mut b = Vec::new();
    shuttle(&mut client, &mut server, &mut a, &mut b);

    client.shutdown().unwrap();
    assert_eq!(client.state(), TlsState::Closed);
    let wire = client.take_outgoing().unwrap();
    server
        .on_ciphertext_from_peer(&wire, &mut |_| true)
        .unwrap();
    assert_eq!(server.state(), TlsState::Closed);
}

fn run_until(reactor: &Reactor, done: impl Fn() -> bool + 'static) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    let watchdog = Timer::create(reactor).unwrap();
    let handle = reactor.clone();
    let start = Instant::now();
    watchdog
        .start(Duration::from_millis(5), true, move || {
            if done() || start.elapsed() > Duration::from_secs(5) {
                handle.stop();
            }
        })
        .unwrap();
    reactor.run();
}

#[test]
fn test_encrypted_echo_over_loop() {
    let reactor = Reactor::create().unwrap();
    let server_ctx = SslContext::server(cert_path(), key_path()).unwrap();

    // server side: TLS-wrap each accepted stream and echo what it reads
    let wrap = reactor.clone();
    let server = TcpServer::create(&reactor, "127.0.0.1:0".parse().unwrap(), move |result| {
        let stream = wrap.wrap_tls(result.unwrap(), &server_ctx).unwrap();
        let echo: Rc<RefCell<Option<TcpStream>>> = Rc::new(RefCell::new(None));
        let back = echo.clone();
        stream
            .enable_read(move |data| {
                let echo = back.borrow();
                echo.as_ref().unwrap().write(data.unwrap(), true).unwrap();
                true
            })
            .unwrap();
        // the read callback keeps the stream alive through this cycle
        *echo.borrow_mut() = Some(stream);
    })
    .unwrap();
    let addr = server.local_addr().unwrap();

    let received: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));
    let client_slot: Rc<RefCell<Option<TcpStream>>> = Rc::new(RefCell::new(None));
    let sink = received.clone();
    let slot = client_slot.clone();
    reactor
        .connect(
            addr,
            1,
            move |_, result| {
                let stream = result.unwrap();
                let sink = sink.clone();
                stream
                    .enable_read(move |data| {
                        sink.borrow_mut().extend_from_slice(data.unwrap());
                        true
                    })
                    .unwrap();
                // queued inside the TLS filter until the handshake finishes
                stream.write(b"secret payload", true).unwrap();
                *slot.borrow_mut() = Some(stream);
            },
            Some(Duration::from_secs(5)),
            true,
            None,
        )
        .unwrap();

    let sink = received.clone();
    run_until(&reactor, move || sink.borrow().len() >= 14);
    assert_eq!(&*received.borrow(), b"secret payload");
}
