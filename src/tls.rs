use crate::buffer::BufferChain;
use crate::error::{Error, Result};
use crate::stream::StreamIo;
use bytes::{Bytes, BytesMut};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use tracing::trace;

/// Default plaintext fragment handed to the record layer per encrypt call.
const DEFAULT_FRAGMENT_SIZE: usize = 16 * 1024;

/// Ceiling on the configurable fragment size.
const MAX_FRAGMENT_SIZE: usize = 1_000_000;

/// TLS configuration shared by sessions. Server contexts carry a
/// certificate and key; client contexts optionally carry a client identity
/// and either verify the peer against the system roots or accept any
/// certificate.
#[derive(Debug)]
pub struct SslContext {
    kind: ContextKind,
}

#[derive(Debug)]
enum ContextKind {
    Server(Arc<rustls::ServerConfig>),
    Client(Arc<rustls::ClientConfig>),
}

impl SslContext {
    /// A server context from PEM certificate chain and private key files.
    pub fn server(cert_file: &Path, key_file: &Path) -> Result<Arc<SslContext>> {
        let certs = load_certs(cert_file)?;
        let key = load_key(key_file)?;
        let config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(Error::tls)?;
        Ok(Arc::new(SslContext {
            kind: ContextKind::Server(Arc::new(config)),
        }))
    }

    /// A client context. With `verify_peer`, server certificates are
    /// checked against the bundled web roots; otherwise any certificate is
    /// accepted, which still encrypts but does not authenticate the peer.
    pub fn client(
        identity: Option<(&Path, &Path)>,
        verify_peer: bool,
    ) -> Result<Arc<SslContext>> {
        let builder = if verify_peer {
            let roots = rustls::RootCertStore::from_iter(
                webpki_roots::TLS_SERVER_ROOTS.iter().cloned(),
            );
            rustls::ClientConfig::builder().with_root_certificates(roots)
        } else {
            rustls::ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoVerification::new()))
        };
        let config = match identity {
            Some((cert_file, key_file)) => builder
                .with_client_auth_cert(load_certs(cert_file)?, load_key(key_file)?)
                .map_err(Error::tls)?,
            None => builder.with_no_client_auth(),
        };
        Ok(Arc::new(SslContext {
            kind: ContextKind::Client(Arc::new(config)),
        }))
    }

    pub fn is_server(&self) -> bool {
        matches!(self.kind, ContextKind::Server(_))
    }
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<io::Result<Vec<_>>>()?;
    if certs.is_empty() {
        return Err(Error::Tls(format!("no certificates in {}", path.display())));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)?
        .ok_or_else(|| Error::Tls(format!("no private key in {}", path.display())))
}

/// Accepts any server certificate. Used when `verify_peer` is off.
#[derive(Debug)]
struct NoVerification {
    schemes: Vec<SignatureScheme>,
}

impl NoVerification {
    fn new() -> Self {
        Self {
            schemes: rustls::crypto::aws_lc_rs::default_provider()
                .signature_verification_algorithms
                .supported_schemes(),
        }
    }
}

impl ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.schemes.clone()
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TlsState {
    Handshaking,
    Established,
    ShuttingDown,
    Closed,
}

/// A TLS engine over in-memory pipes: ciphertext in via
/// [`on_ciphertext_from_peer`](Self::on_ciphertext_from_peer), ciphertext
/// out via [`take_outgoing`](Self::take_outgoing). The session never
/// touches a socket, so it composes with any transport.
///
/// Plaintext enqueued before the handshake completes is held back and
/// flushed automatically the moment the session is established.
pub struct SslSession {
    conn: rustls::Connection,
    state: TlsState,
    queued: Vec<Bytes>,
    outgoing: BytesMut,
    fragment_size: usize,
}

impl SslSession {
    /// A client session; its initial handshake flight is already pending in
    /// the outgoing pipe.
    pub fn client(context: &SslContext, peer: IpAddr) -> Result<SslSession> {
        let ContextKind::Client(config) = &context.kind else {
            return Err(Error::InvalidArgument(
                "server context used for a client session",
            ));
        };
        let name = ServerName::from(peer);
        let conn = rustls::ClientConnection::new(config.clone(), name).map_err(Error::tls)?;
        let mut session = SslSession::new(rustls::Connection::Client(conn));
        session.pump_outgoing()?;
        Ok(session)
    }

    pub fn server(context: &SslContext) -> Result<SslSession> {
        let ContextKind::Server(config) = &context.kind else {
            return Err(Error::InvalidArgument(
                "client context used for a server session",
            ));
        };
        let conn = rustls::ServerConnection::new(config.clone()).map_err(Error::tls)?;
        Ok(SslSession::new(rustls::Connection::Server(conn)))
    }

    fn new(conn: rustls::Connection) -> SslSession {
        SslSession {
            conn,
            state: TlsState::Handshaking,
            queued: Vec::new(),
            outgoing: BytesMut::new(),
            fragment_size: DEFAULT_FRAGMENT_SIZE,
        }
    }

    pub fn state(&self) -> TlsState {
        self.state
    }

    pub fn is_established(&self) -> bool {
        self.state == TlsState::Established
    }

    /// Cap the plaintext fragment size per encrypt call.
    pub fn set_fragment_size(&mut self, size: usize) {
        self.fragment_size = size.clamp(1, MAX_FRAGMENT_SIZE);
    }

    /// Feed ciphertext received from the peer. Decoded plaintext is pushed
    /// to `sink` in order; `sink` returning `false` stops delivery, leaving
    /// any remaining decoded data dropped. Completing the handshake flushes
    /// plaintext that was enqueued while it was in progress.
    pub fn on_ciphertext_from_peer(
        &mut self,
        mut data: &[u8],
        sink: &mut dyn FnMut(&[u8]) -> bool,
    ) -> Result<()> {
        while !data.is_empty() {
            let mut cursor = io::Cursor::new(data);
            let n = self.conn.read_tls(&mut cursor)?;
            if n == 0 {
                break;
            }
            data = &data[n..];
            let io_state = match self.conn.process_new_packets() {
                Ok(state) => state,
                Err(e) => {
                    // flushable alert may be pending; let the owner send it
                    let _ = self.pump_outgoing();
                    self.state = TlsState::Closed;
                    return Err(Error::tls(e));
                }
            };
            if self.state == TlsState::Handshaking && !self.conn.is_handshaking() {
                trace!("tls handshake complete");
                self.state = TlsState::Established;
                self.flush()?;
            }
            let mut available = io_state.plaintext_bytes_to_read();
            while available > 0 {
                let take = available.min(self.fragment_size);
                let mut buf = vec![0u8; take];
                let n = self.conn.reader().read(&mut buf)?;
                if n == 0 {
                    break;
                }
                available -= n;
                if !sink(&buf[..n]) {
                    self.pump_outgoing()?;
                    return Ok(());
                }
            }
            if io_state.peer_has_closed() {
                self.state = TlsState::Closed;
                break;
            }
            self.pump_outgoing()?;
        }
        self.pump_outgoing()
    }

    /// Queue plaintext for encryption. Held back until the handshake
    /// completes.
    pub fn enqueue(&mut self, data: Bytes) {
        if !data.is_empty() {
            self.queued.push(data);
        }
    }

    pub fn queued_len(&self) -> usize {
        self.queued.iter().map(|b| b.len()).sum()
    }

    /// Encrypt queued plaintext, in fragments no larger than the configured
    /// size, into the outgoing pipe. During the handshake only handshake
    /// records are produced and the plaintext stays queued.
    pub fn flush(&mut self) -> Result<()> {
        match self.state {
            TlsState::Handshaking => return self.pump_outgoing(),
            TlsState::Established => {}
            TlsState::ShuttingDown | TlsState::Closed => return Err(Error::NotConnected),
        }
        let queued = std::mem::take(&mut self.queued);
        for buf in queued {
            let mut rest = &buf[..];
            while !rest.is_empty() {
                let take = rest.len().min(self.fragment_size);
                let n = self.conn.writer().write(&rest[..take])?;
                rest = &rest[n..];
                self.pump_outgoing()?;
            }
        }
        Ok(())
    }

    /// All pending ciphertext for the peer, draining the outgoing pipe.
    pub fn take_outgoing(&mut self) -> Option<Bytes> {
        if self.outgoing.is_empty() {
            None
        } else {
            Some(self.outgoing.split().freeze())
        }
    }

    /// Flush queued plaintext if possible, then queue a close-notify alert.
    pub fn shutdown(&mut self) -> Result<()> {
        if self.state == TlsState::Closed {
            return Ok(());
        }
        if self.state == TlsState::Established {
            self.flush()?;
        }
        self.state = TlsState::ShuttingDown;
        self.conn.send_close_notify();
        self.pump_outgoing()?;
        self.state = TlsState::Closed;
        Ok(())
    }

    fn pump_outgoing(&mut self) -> Result<()> {
        while self.conn.wants_write() {
            let mut buf = Vec::with_capacity(4096);
            let n = self.conn.write_tls(&mut buf)?;
            if n == 0 {
                break;
            }
            self.outgoing.extend_from_slice(&buf);
        }
        Ok(())
    }
}

/// Stream filter backed by an [`SslSession`].
pub(crate) struct TlsIo {
    session: SslSession,
}

impl TlsIo {
    pub fn new(session: SslSession) -> Self {
        TlsIo { session }
    }
}

fn drain(session: &mut SslSession, wire: &mut BufferChain) {
    while let Some(bytes) = session.take_outgoing() {
        wire.append(bytes);
    }
}

impl StreamIo for TlsIo {
    fn on_read(
        &mut self,
        data: Bytes,
        plain: &mut Vec<Bytes>,
        wire: &mut BufferChain,
    ) -> Result<()> {
        let result = self
            .session
            .on_ciphertext_from_peer(&data, &mut |fragment| {
                plain.push(Bytes::copy_from_slice(fragment));
                true
            });
        drain(&mut self.session, wire);
        result
    }

    fn queue_write(&mut self, data: Bytes) -> Result<()> {
        self.session.enqueue(data);
        Ok(())
    }

    fn flush(&mut self, wire: &mut BufferChain) -> Result<()> {
        self.session.flush()?;
        drain(&mut self.session, wire);
        Ok(())
    }

    fn shutdown(&mut self, wire: &mut BufferChain) -> Result<()> {
        self.session.shutdown()?;
        drain(&mut self.session, wire);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_session_has_initial_flight() {
        let context = SslContext::client(None, false).unwrap();
        let mut session =
            SslSession::client(&context, "127.0.0.1".parse().unwrap()).unwrap();
        assert_eq!(session.state(), TlsState::Handshaking);
        let hello = session.take_outgoing().expect("client hello pending");
        assert!(!hello.is_empty());
        assert!(session.take_outgoing().is_none());
    }

    #[test]
    fn test_plaintext_held_during_handshake() {
        let context = SslContext::client(None, false).unwrap();
        let mut session =
            SslSession::client(&context, "127.0.0.1".parse().unwrap()).unwrap();
        session.take_outgoing();
        session.enqueue(Bytes::from_static(b"early data"));
        session.flush().unwrap();
        assert_eq!(session.queued_len(), 10);
        // no application records were produced
        assert!(session.take_outgoing().is_none());
    }

    #[test]
    fn test_context_kind_mismatch() {
        let context = SslContext::client(None, false).unwrap();
        assert!(!context.is_server());
        assert!(matches!(
            SslSession::server(&context),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_missing_cert_file() {
        let err = SslContext::server(
            Path::new("/nonexistent/cert.pem"),
            Path::new("/nonexistent/key.pem"),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_fragment_size_clamped() {
        let context = SslContext::client(None, false).unwrap();
        let mut session =
            SslSession::client(&context, "127.0.0.1".parse().unwrap()).unwrap();
        session.set_fragment_size(usize::MAX);
        assert_eq!(session.fragment_size, MAX_FRAGMENT_SIZE);
        session.set_fragment_size(0);
        assert_eq!(session.fragment_size, 1);
    }
}
