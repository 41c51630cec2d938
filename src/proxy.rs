use crate::coarse_timer::MultiplexedTimer;
use crate::connector::ConnectCallback;
use crate::error::{Error, Result};
use crate::reactor::Reactor;
use crate::stream::TcpStream;
use bytes::Bytes;
use std::cell::RefCell;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::net::{SocketAddr, SocketAddrV4};
use std::rc::{Rc, Weak};
use std::time::Duration;
use tracing::{debug, trace};

const SOCKS_VERSION: u8 = 0x05;
const AUTH_NONE: u8 = 0x00;
const CMD_CONNECT: u8 = 0x01;
const RESERVED: u8 = 0x00;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;
const REPLY_SUCCEEDED: u8 = 0x00;

/// Where a negotiation stands, for diagnostics.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProxyStage {
    Connecting,
    NegotiatingAuth,
    NegotiatingConnect,
    Established,
    Failed,
}

/// What the caller should do after feeding reply bytes.
pub(crate) enum Step {
    /// Reply incomplete; wait for more bytes.
    Wait,
    /// Send these bytes to the proxy.
    Send(Vec<u8>),
    Established,
}

/// The SOCKS5 negotiation state machine, fed incrementally: proxies may
/// deliver a reply split across several reads, so bytes accumulate until a
/// complete message parses.
pub(crate) struct Negotiation {
    stage: ProxyStage,
    destination: SocketAddrV4,
    buf: Vec<u8>,
}

impl Negotiation {
    pub fn new(destination: SocketAddrV4) -> Self {
        Self {
            stage: ProxyStage::Connecting,
            destination,
            buf: Vec::new(),
        }
    }

    pub fn stage(&self) -> ProxyStage {
        self.stage
    }

    /// The method-selection offer: no-authentication only.
    pub fn auth_request() -> [u8; 3] {
        [SOCKS_VERSION, 0x01, AUTH_NONE]
    }

    /// The CONNECT request for an IPv4 destination.
    pub fn connect_request(destination: SocketAddrV4) -> [u8; 10] {
        let ip = destination.ip().octets();
        let port = destination.port().to_be_bytes();
        [
            SOCKS_VERSION,
            CMD_CONNECT,
            RESERVED,
            ATYP_IPV4,
            ip[0],
            ip[1],
            ip[2],
            ip[3],
            port[0],
            port[1],
        ]
    }

    /// Transition out of `Connecting`; the caller sends the returned offer.
    pub fn start(&mut self) -> [u8; 3] {
        self.stage = ProxyStage::NegotiatingAuth;
        Self::auth_request()
    }

    /// Feed reply bytes from the proxy.
    pub fn on_bytes(&mut self, data: &[u8]) -> Result<Step> {
        self.buf.extend_from_slice(data);
        match self.stage {
            ProxyStage::NegotiatingAuth => {
                if self.buf.len() < 2 {
                    return Ok(Step::Wait);
                }
                let (version, method) = (self.buf[0], self.buf[1]);
                if version != SOCKS_VERSION || method != AUTH_NONE {
                    self.stage = ProxyStage::Failed;
                    return Err(Error::ProxyAuth);
                }
                self.buf.drain(..2);
                self.stage = ProxyStage::NegotiatingConnect;
                Ok(Step::Send(Self::connect_request(self.destination).to_vec()))
            }
            ProxyStage::NegotiatingConnect => {
                // [ver, rep, rsv, atyp, bind-addr..., port.hi, port.lo]
                if self.buf.len() < 4 {
                    return Ok(Step::Wait);
                }
                let (version, reply, reserved, atyp) =
                    (self.buf[0], self.buf[1], self.buf[2], self.buf[3]);
                let addr_len = match atyp {
                    ATYP_IPV4 => 4,
                    ATYP_IPV6 => 16,
                    ATYP_DOMAIN => {
                        let Some(&len) = self.buf.get(4) else {
                            return Ok(Step::Wait);
                        };
                        1 + len as usize
                    }
                    _ => {
                        self.stage = ProxyStage::Failed;
                        return Err(Error::ProxyReply(reply));
                    }
                };
                let total = 4 + addr_len + 2;
                if self.buf.len() < total {
                    return Ok(Step::Wait);
                }
                if version != SOCKS_VERSION || reserved != RESERVED || reply != REPLY_SUCCEEDED {
                    self.stage = ProxyStage::Failed;
                    return Err(Error::ProxyReply(reply));
                }
                self.buf.drain(..total);
                // bytes past the reply (a destination banner the proxy
                // coalesced into the same segment) stay buffered for
                // `take_leftover`
                self.stage = ProxyStage::Established;
                Ok(Step::Established)
            }
            // trailing bytes after the reply belong to the tunnel, or the
            // request already failed; either way they are not ours
            _ => Ok(Step::Wait),
        }
    }

    /// Bytes that arrived beyond the final reply; they belong to the
    /// tunnelled connection, not the negotiation.
    pub fn take_leftover(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }
}

struct ProxyRequest {
    negotiation: Negotiation,
    stream: Option<TcpStream>,
    on_established: Option<ConnectCallback>,
    tls: bool,
}

struct ProxyInner {
    reactor: Reactor,
    requests: RefCell<HashMap<u64, ProxyRequest>>,
    timer: MultiplexedTimer,
}

/// Tunnels connections through a SOCKS5 proxy (no-authentication method,
/// IPv4 destinations).
///
/// [`create_connection`](ProxyConnector::create_connection) registers the
/// destination and returns a connect callback; pass that callback to
/// [`Reactor::connect`] aimed at the proxy itself. Once the TCP leg is up,
/// the connector negotiates on the stream and delivers the tunnelled stream
/// (optionally TLS-wrapped end to end) to the registered callback.
pub struct ProxyConnector {
    inner: Rc<ProxyInner>,
}

impl ProxyConnector {
    pub fn new(reactor: &Reactor) -> Result<ProxyConnector> {
        let resolution = reactor
            .inner()
            .with_core(|c| c.config.connect_timer_resolution_ms);
        Ok(ProxyConnector {
            inner: Rc::new(ProxyInner {
                reactor: reactor.clone(),
                requests: RefCell::new(HashMap::new()),
                timer: MultiplexedTimer::create(reactor, Duration::from_millis(resolution))?,
            }),
        })
    }

    /// Register a tunnelled connection to `destination` under `tag` and
    /// return the callback to hand to [`Reactor::connect`] for the proxy
    /// leg. `timeout` bounds the negotiation phase; the TCP leg's timeout is
    /// whatever was given to `connect`. Exactly one outcome reaches
    /// `on_established` unless the request is cancelled.
    pub fn create_connection(
        &self,
        tag: u64,
        destination: SocketAddr,
        on_established: impl FnOnce(u64, Result<TcpStream>) + 'static,
        timeout: Option<Duration>,
        use_tls: bool,
    ) -> Result<ConnectCallback> {
        let SocketAddr::V4(destination) = destination else {
            return Err(Error::InvalidArgument(
                "socks5 destinations must be ipv4",
            ));
        };
        match self.inner.requests.borrow_mut().entry(tag) {
            Entry::Occupied(_) => {
                return Err(Error::InvalidArgument("duplicate proxy tag"));
            }
            Entry::Vacant(entry) => {
                entry.insert(ProxyRequest {
                    negotiation: Negotiation::new(destination),
                    stream: None,
                    on_established: Some(Box::new(on_established)),
                    tls: use_tls,
                });
            }
        }
        let weak = Rc::downgrade(&self.inner);
        let negotiation_timeout = timeout;
        Ok(Box::new(move |tag, result| {
            if let Some(inner) = weak.upgrade() {
                ProxyInner::on_tcp_connect(&inner, tag, result, negotiation_timeout);
            }
        }))
    }

    /// Abandon a pending tunnel. The proxy-leg socket, if any, is closed
    /// and the callback will not run. Cancel the TCP leg separately via
    /// [`Reactor::cancel_connect`] if it has not completed yet.
    pub fn cancel(&self, tag: u64) {
        self.inner.timer.cancel(tag);
        if self.inner.requests.borrow_mut().remove(&tag).is_some() {
            trace!(tag, "proxy request cancelled");
        }
    }

    pub fn pending(&self) -> usize {
        self.inner.requests.borrow().len()
    }
}

impl ProxyInner {
    fn on_tcp_connect(
        inner: &Rc<ProxyInner>,
        tag: u64,
        result: Result<TcpStream>,
        timeout: Option<Duration>,
    ) {
        let stream = match result {
            Ok(stream) => stream,
            Err(e) => {
                Self::fail(inner, tag, e);
                return;
            }
        };
        // the request may have been cancelled while the TCP leg connected
        if !inner.requests.borrow().contains_key(&tag) {
            return;
        }
        if let Some(timeout) = timeout {
            let weak = Rc::downgrade(inner);
            let armed = inner.timer.set_timer(timeout, tag, move |tag| {
                if let Some(inner) = weak.upgrade() {
                    debug!(tag, "proxy negotiation timed out");
                    ProxyInner::fail(&inner, tag, Error::Timeout);
                }
            });
            if let Err(e) = armed {
                Self::fail(inner, tag, e);
                return;
            }
        }
        let weak = Rc::downgrade(inner);
        if let Err(e) = stream.enable_read(move |data| match weak.upgrade() {
            Some(inner) => ProxyInner::on_stream_data(&inner, tag, data),
            None => false,
        }) {
            Self::fail(inner, tag, e);
            return;
        }
        let offer = {
            let mut requests = inner.requests.borrow_mut();
            let Some(request) = requests.get_mut(&tag) else {
                return;
            };
            let offer = request.negotiation.start();
            request.stream = Some(stream);
            offer
        };
        trace!(tag, "proxy negotiation started");
        if let Err(e) = Self::send(inner, tag, &offer) {
            Self::fail(inner, tag, e);
        }
    }

    fn on_stream_data(inner: &Rc<ProxyInner>, tag: u64, data: Result<&[u8]>) -> bool {
        let data = match data {
            Ok(data) => data,
            Err(e) => {
                Self::fail(inner, tag, e);
                return false;
            }
        };
        let step = {
            let mut requests = inner.requests.borrow_mut();
            let Some(request) = requests.get_mut(&tag) else {
                return false;
            };
            request.negotiation.on_bytes(data)
        };
        match step {
            Ok(Step::Wait) => true,
            Ok(Step::Send(bytes)) => {
                if let Err(e) = Self::send(inner, tag, &bytes) {
                    Self::fail(inner, tag, e);
                    return false;
                }
                true
            }
            Ok(Step::Established) => {
                Self::established(inner, tag);
                false
            }
            Err(e) => {
                Self::fail(inner, tag, e);
                false
            }
        }
    }

    fn send(inner: &Rc<ProxyInner>, tag: u64, bytes: &[u8]) -> Result<()> {
        let requests = inner.requests.borrow();
        let stream = requests
            .get(&tag)
            .and_then(|r| r.stream.as_ref())
            .ok_or(Error::NotConnected)?;
        stream.write(bytes, true)
    }

    /// The tunnel is up: detach the negotiation's read callback, optionally
    /// wrap the stream in TLS toward the destination, and deliver it.
    fn established(inner: &Rc<ProxyInner>, tag: u64) {
        inner.timer.cancel(tag);
        let Some(mut request) = inner.requests.borrow_mut().remove(&tag) else {
            return;
        };
        let Some(stream) = request.stream.take() else {
            return;
        };
        stream.disable_read();
        debug!(tag, "proxy tunnel established");
        let leftover = request.negotiation.take_leftover();
        let result = if request.tls {
            inner
                .reactor
                .default_client_tls()
                .and_then(|context| inner.reactor.wrap_tls(stream, &context))
        } else {
            Ok(stream)
        };
        // a destination-first banner coalesced with the reply reaches the
        // new owner's first read delivery
        let result = result.map(|stream| {
            stream.push_received(Bytes::from(leftover));
            stream
        });
        if let Some(callback) = request.on_established.take() {
            callback(tag, result);
        }
    }

    fn fail(inner: &Rc<ProxyInner>, tag: u64, error: Error) {
        inner.timer.cancel(tag);
        let Some(mut request) = inner.requests.borrow_mut().remove(&tag) else {
            return;
        };
        debug!(tag, "proxy connection failed: {error}");
        // dropping the stream closes the proxy leg
        drop(request.stream.take());
        if let Some(callback) = request.on_established.take() {
            callback(tag, Err(error));
        }
    }
}
