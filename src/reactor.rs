use crate::buffer::BufferChain;
use crate::coarse_timer::CoarseTimer;
use crate::config::ReactorConfig;
use crate::connector::{ConnectCallback, ConnectRequest, ConnectorManager};
use crate::error::{Error, Result};
use crate::pool::{HandleId, HandleKind, HandlePool, Owner};
use crate::server::ServerCore;
use crate::shutdown::ShutdownManager;
use crate::stream::{StreamCore, TcpStream};
use crate::timer::{NativeTimers, TimerCore};
use crate::tls::{SslContext, SslSession};
use crate::write::{WriteCallback, WriteManager};
use mio::{Events, Interest, Poll, Token, Waker};
use socket2::{Domain, Protocol, Socket, Type};
use std::cell::RefCell;
use std::io;
use std::net::SocketAddr;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, trace};

/// Token reserved for the cross-thread waker; never allocated to a slot.
const WAKER_TOKEN: Token = Token(usize::MAX);

thread_local! {
    static CURRENT: RefCell<Vec<Weak<ReactorInner>>> = const { RefCell::new(Vec::new()) };
}

/// Work queued during a poll turn and performed after every internal borrow
/// is released, so a callback can reenter any reactor API.
pub(crate) enum Action {
    /// Probe an in-flight connect whose socket may already be writable.
    ConnectCheck { slot: usize },
    ConnectDone {
        tag: u64,
        callback: ConnectCallback,
        result: Result<TcpStream>,
    },
    Readable(Weak<StreamCore>),
    WriteDone {
        callback: WriteCallback,
        result: Result<usize>,
    },
    TimerFired(Weak<TimerCore>),
    Acceptable(Weak<ServerCore>),
}

pub(crate) struct StopState {
    waker: Waker,
    stopped: AtomicBool,
}

impl StopState {
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        let _ = self.waker.wake();
    }

    fn take(&self) -> bool {
        self.stopped.swap(false, Ordering::SeqCst)
    }
}

/// Thread-safe handle that stops a running reactor. The only reactor API
/// that may be used from another thread.
#[derive(Clone)]
pub struct Stopper(Arc<StopState>);

impl Stopper {
    pub fn stop(&self) {
        self.0.stop();
    }
}

/// Guard marking a reactor as the thread's current one; see
/// [`Reactor::scope`]. Dropping the guard restores the previous current.
pub struct ReactorScope {
    _not_send: std::marker::PhantomData<*const ()>,
}

impl Drop for ReactorScope {
    fn drop(&mut self) {
        CURRENT.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

pub(crate) struct ReactorInner {
    core: RefCell<Core>,
    stop: Arc<StopState>,
    /// Lazily created coalescing timer for connect timeouts, keyed by
    /// connect tag. Lives outside the core so arming it never contends with
    /// a core borrow.
    connect_timer: RefCell<Option<CoarseTimer>>,
    /// Default client TLS context, created on the first TLS connect unless
    /// the application installed one.
    client_tls: RefCell<Option<Arc<SslContext>>>,
}

impl ReactorInner {
    /// Borrow the loop core. Callers must not invoke user callbacks while
    /// the borrow is held; queue an [`Action`] instead.
    pub(crate) fn with_core<R>(&self, f: impl FnOnce(&mut Core) -> R) -> R {
        f(&mut self.core.borrow_mut())
    }

    fn connect_timed_out(inner: &Rc<ReactorInner>, tag: u64) {
        let request = inner.with_core(|c| {
            c.connector.remove(tag).map(|r| {
                c.close_handle(r.handle);
                r
            })
        });
        if let Some(request) = request {
            debug!(tag, "connect timed out");
            (request.callback)(tag, Err(Error::Timeout));
        }
    }
}

/// A single-threaded event loop multiplexing sockets and timers.
///
/// All methods except [`Stopper::stop`] must be called on the loop's thread.
/// Callbacks run on that thread, outside any internal borrow, so they may
/// start new operations or drop objects freely.
#[derive(Clone)]
pub struct Reactor {
    inner: Rc<ReactorInner>,
}

impl Reactor {
    pub fn create() -> Result<Reactor> {
        Self::create_with_config(ReactorConfig::default())
    }

    pub fn create_with_config(config: ReactorConfig) -> Result<Reactor> {
        let config = config.clamped();
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
        let core = Core {
            poll,
            events: Events::with_capacity(1024),
            pool: HandlePool::new(config.handle_pool_size),
            timers: NativeTimers::new(),
            connector: ConnectorManager::new(config.connect_pool_size),
            writes: WriteManager::new(config.write_pool_size),
            shutdowns: ShutdownManager::new(config.shutdown_pool_size),
            deferred: Vec::new(),
            pending_close: Vec::new(),
            config,
        };
        Ok(Reactor {
            inner: Rc::new(ReactorInner {
                core: RefCell::new(core),
                stop: Arc::new(StopState {
                    waker,
                    stopped: AtomicBool::new(false),
                }),
                connect_timer: RefCell::new(None),
                client_tls: RefCell::new(None),
            }),
        })
    }

    pub(crate) fn inner(&self) -> &Rc<ReactorInner> {
        &self.inner
    }

    /// Two handles referring to the same underlying loop.
    pub fn ptr_eq(&self, other: &Reactor) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Run until [`stop`](Self::stop) is observed. May be called again after
    /// it returns.
    pub fn run(&self) {
        self.run_with_stop_hook(|| {});
    }

    /// Like [`run`](Self::run), invoking `on_stop` once when the stop flag
    /// is observed, before returning.
    pub fn run_with_stop_hook(&self, mut on_stop: impl FnMut()) {
        let weak = Rc::downgrade(&self.inner);
        loop {
            if self.inner.stop.take() {
                debug!("reactor stopping");
                on_stop();
                self.inner.with_core(|c| c.finish_turn());
                return;
            }
            self.inner.with_core(|c| c.turn(&weak));
            loop {
                let batch = self.inner.with_core(|c| c.take_deferred());
                if batch.is_empty() {
                    break;
                }
                for action in batch {
                    self.perform(action);
                }
            }
            self.inner.with_core(|c| c.finish_turn());
        }
    }

    /// Request the loop to stop. Safe to call before `run`; the flag is
    /// consumed by the next call.
    pub fn stop(&self) {
        self.inner.stop.stop();
    }

    /// A stop handle usable from any thread.
    pub fn stopper(&self) -> Stopper {
        Stopper(self.inner.stop.clone())
    }

    /// Push this reactor onto the thread's current-reactor stack. Scopes
    /// nest; the guard must be dropped in reverse order of creation.
    pub fn scope(&self) -> ReactorScope {
        CURRENT.with(|stack| stack.borrow_mut().push(Rc::downgrade(&self.inner)));
        ReactorScope {
            _not_send: std::marker::PhantomData,
        }
    }

    /// The innermost scoped reactor on this thread, if any.
    pub fn current() -> Option<Reactor> {
        CURRENT.with(|stack| stack.borrow().last().and_then(Weak::upgrade))
            .map(|inner| Reactor { inner })
    }

    /// Start a non-blocking connect to `addr`, identified by a caller-chosen
    /// `tag` unique among in-flight connects. Exactly one of success,
    /// failure, or timeout is delivered to `callback` unless the request is
    /// cancelled first. With `use_tls`, the stream is wrapped with the
    /// client context installed via [`set_client_tls`](Self::set_client_tls)
    /// (or an unverified default) before delivery.
    pub fn connect(
        &self,
        addr: SocketAddr,
        tag: u64,
        callback: impl FnOnce(u64, Result<TcpStream>) + 'static,
        timeout: Option<Duration>,
        use_tls: bool,
        bind_addr: Option<SocketAddr>,
    ) -> Result<()> {
        if addr.port() == 0 {
            return Err(Error::InvalidArgument("connect address has no port"));
        }
        let tls = if use_tls {
            Some(self.default_client_tls()?)
        } else {
            None
        };
        self.inner
            .with_core(|c| c.begin_connect(addr, tag, Box::new(callback), tls, bind_addr))?;
        if let Some(timeout) = timeout {
            if let Err(e) = self.arm_connect_timeout(tag, timeout) {
                self.cancel_connect(tag);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Abandon an in-flight connect. The callback will not run; a readiness
    /// event that already raced in is dropped. Unknown tags are ignored.
    pub fn cancel_connect(&self, tag: u64) {
        let removed = self.inner.with_core(|c| {
            c.connector
                .remove(tag)
                .map(|r| c.close_handle(r.handle))
                .is_some()
        });
        if removed {
            trace!(tag, "connect cancelled");
            if let Some(timer) = self.inner.connect_timer.borrow().as_ref() {
                timer.cancel(tag);
            }
        }
    }

    /// Install the TLS context used for `use_tls` connects.
    pub fn set_client_tls(&self, context: Arc<SslContext>) {
        *self.inner.client_tls.borrow_mut() = Some(context);
    }

    /// Replace a plaintext stream's filter with a TLS session using `ctx`,
    /// returning a new stream over the same socket. The passed-in stream is
    /// consumed; any read callback it had is not carried over.
    pub fn wrap_tls(&self, stream: TcpStream, context: &Arc<SslContext>) -> Result<TcpStream> {
        let id = stream.take_handle().ok_or(Error::NotConnected)?;
        let session = if context.is_server() {
            SslSession::server(context)
        } else {
            let peer = self.inner.with_core(|c| c.stream_addr(id, true))?;
            SslSession::client(context, peer.ip())
        };
        let session = match session {
            Ok(session) => session,
            Err(e) => {
                self.inner.with_core(|c| c.close_handle(id));
                return Err(e);
            }
        };
        let weak = Rc::downgrade(&self.inner);
        self.inner
            .with_core(|c| TcpStream::attach(c, weak, id, Some(session)))
    }

    pub(crate) fn default_client_tls(&self) -> Result<Arc<SslContext>> {
        let mut guard = self.inner.client_tls.borrow_mut();
        if let Some(context) = guard.as_ref() {
            return Ok(context.clone());
        }
        let context = SslContext::client(None, false)?;
        *guard = Some(context.clone());
        Ok(context)
    }

    fn arm_connect_timeout(&self, tag: u64, timeout: Duration) -> Result<()> {
        let resolution = self
            .inner
            .with_core(|c| c.config.connect_timer_resolution_ms);
        let mut guard = self.inner.connect_timer.borrow_mut();
        if guard.is_none() {
            let weak = Rc::downgrade(&self.inner);
            let timer = CoarseTimer::create(
                self,
                Duration::from_millis(resolution),
                move |tag| {
                    if let Some(inner) = weak.upgrade() {
                        ReactorInner::connect_timed_out(&inner, tag);
                    }
                },
            )?;
            *guard = Some(timer);
        }
        if let Some(timer) = guard.as_ref() {
            timer.set_timer(timeout, tag)?;
        }
        Ok(())
    }

    /// Run one queued action with no internal borrow held.
    fn perform(&self, action: Action) {
        match action {
            Action::ConnectCheck { slot } => {
                let weak = Rc::downgrade(&self.inner);
                self.inner.with_core(|c| c.resolve_connect(&weak, slot));
            }
            Action::ConnectDone {
                tag,
                callback,
                result,
            } => {
                {
                    let guard = self.inner.connect_timer.borrow();
                    if let Some(timer) = guard.as_ref() {
                        timer.cancel(tag);
                    }
                }
                callback(tag, result);
            }
            Action::Readable(weak) => {
                if let Some(core) = weak.upgrade() {
                    StreamCore::on_readable(&core, &self.inner);
                }
            }
            Action::WriteDone { callback, result } => callback(result),
            Action::TimerFired(weak) => {
                if let Some(core) = weak.upgrade() {
                    core.invoke();
                }
            }
            Action::Acceptable(weak) => {
                if let Some(core) = weak.upgrade() {
                    ServerCore::on_acceptable(&core, &self.inner);
                }
            }
        }
    }
}

/// The loop's mutable state. Held in a `RefCell`; methods here never invoke
/// user callbacks, they queue [`Action`]s onto `deferred` instead.
pub(crate) struct Core {
    poll: Poll,
    events: Events,
    pub(crate) pool: HandlePool,
    pub(crate) timers: NativeTimers,
    pub(crate) connector: ConnectorManager,
    pub(crate) writes: WriteManager,
    pub(crate) shutdowns: ShutdownManager,
    deferred: Vec<Action>,
    pending_close: Vec<HandleId>,
    pub(crate) config: ReactorConfig,
}

impl Core {
    /// One poll turn: wait (bounded by the nearest timer deadline, or not at
    /// all when actions are already queued), then translate readiness events
    /// and due timers into actions.
    fn turn(&mut self, inner: &Weak<ReactorInner>) {
        let timeout = if self.deferred.is_empty() {
            self.timers
                .next_deadline()
                .map(|d| d.saturating_duration_since(Instant::now()))
        } else {
            Some(Duration::ZERO)
        };
        if let Err(e) = self.poll.poll(&mut self.events, timeout) {
            if e.kind() != io::ErrorKind::Interrupted {
                error!("poll failed: {e}");
            }
            return;
        }
        // collect first: dispatch needs &mut self
        let mut ready = Vec::new();
        for event in self.events.iter() {
            let token = event.token();
            if token == WAKER_TOKEN {
                continue;
            }
            let readable = event.is_readable() || event.is_read_closed() || event.is_error();
            let writable = event.is_writable() || event.is_write_closed();
            ready.push((token.0, readable, writable));
        }
        for (slot, readable, writable) in ready {
            self.dispatch_event(inner, slot, readable, writable);
        }
        for slot in self.timers.collect_due(Instant::now()) {
            if let Some(Owner::Timer(weak)) = self.pool.slot_owner(slot) {
                self.deferred.push(Action::TimerFired(weak));
            }
        }
    }

    fn take_deferred(&mut self) -> Vec<Action> {
        std::mem::take(&mut self.deferred)
    }

    fn dispatch_event(
        &mut self,
        inner: &Weak<ReactorInner>,
        slot: usize,
        readable: bool,
        writable: bool,
    ) {
        match self.pool.slot_owner(slot) {
            Some(Owner::Connect(_)) => self.resolve_connect(inner, slot),
            Some(Owner::Stream(weak)) => {
                if writable {
                    self.flush_writes(slot);
                }
                if readable {
                    self.deferred.push(Action::Readable(weak));
                }
            }
            Some(Owner::Listener(weak)) => {
                if readable {
                    self.deferred.push(Action::Acceptable(weak));
                }
            }
            // slot released or recycled since the event was queued
            Some(Owner::Timer(_)) | Some(Owner::None) | None => {}
        }
    }

    fn begin_connect(
        &mut self,
        addr: SocketAddr,
        tag: u64,
        callback: ConnectCallback,
        tls: Option<Arc<SslContext>>,
        bind_addr: Option<SocketAddr>,
    ) -> Result<()> {
        if self.connector.contains(tag) {
            return Err(Error::InvalidArgument("duplicate connect tag"));
        }
        let domain = match addr {
            SocketAddr::V4(_) => Domain::IPV4,
            SocketAddr::V6(_) => Domain::IPV6,
        };
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_nonblocking(true)?;
        let _ = socket.set_nodelay(true);
        if let Some(bind) = bind_addr {
            socket.bind(&bind.into())?;
        }
        match socket.connect(&addr.into()) {
            Ok(()) => {}
            Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(e.into()),
        }
        let stream = mio::net::TcpStream::from_std(socket.into());
        let id = self.pool.alloc(HandleKind::Tcp(stream), Owner::Connect(tag));
        let registered = match self.pool.get_mut(id) {
            Some(slot) => match &mut slot.kind {
                HandleKind::Tcp(s) => self.poll.registry().register(
                    s,
                    id.token(),
                    Interest::READABLE | Interest::WRITABLE,
                ),
                _ => Ok(()),
            },
            None => Ok(()),
        };
        if let Err(e) = registered {
            self.pool.release(id);
            return Err(e.into());
        }
        self.connector.insert(
            tag,
            ConnectRequest {
                handle: id,
                callback,
                tls,
            },
        );
        trace!(tag, %addr, "connect started");
        // loopback connects can complete before registration; probe once
        self.deferred.push(Action::ConnectCheck { slot: id.slot });
        Ok(())
    }

    /// Check whether an in-flight connect finished, and if so queue its
    /// completion. Events for tags no longer in the request table are
    /// dropped: the request was cancelled or timed out.
    pub(crate) fn resolve_connect(&mut self, inner: &Weak<ReactorInner>, slot: usize) {
        let Some(hslot) = self.pool.get_slot_mut(slot) else {
            return;
        };
        let tag = match hslot.owner {
            Owner::Connect(tag) => tag,
            _ => return,
        };
        let id = HandleId {
            slot,
            generation: hslot.generation,
        };
        let HandleKind::Tcp(stream) = &mut hslot.kind else {
            return;
        };
        let status = match stream.take_error() {
            Ok(Some(e)) => Err(e),
            Ok(None) => match stream.peer_addr() {
                Ok(peer) => Ok(peer),
                // still in progress; wait for the next event
                Err(e) if e.kind() == io::ErrorKind::NotConnected => return,
                Err(e) if e.raw_os_error() == Some(libc::ENOTCONN) => return,
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };
        let Some(request) = self.connector.remove(tag) else {
            return;
        };
        match status {
            Ok(peer) => {
                let session = match request.tls.as_deref() {
                    Some(context) => match SslSession::client(context, peer.ip()) {
                        Ok(session) => Some(session),
                        Err(e) => {
                            self.close_handle(id);
                            self.deferred.push(Action::ConnectDone {
                                tag,
                                callback: request.callback,
                                result: Err(e),
                            });
                            return;
                        }
                    },
                    None => None,
                };
                let result = TcpStream::attach(self, inner.clone(), id, session);
                if result.is_err() {
                    self.close_handle(id);
                }
                trace!(tag, %peer, "connect established");
                self.deferred.push(Action::ConnectDone {
                    tag,
                    callback: request.callback,
                    result,
                });
            }
            Err(e) => {
                debug!(tag, "connect failed: {e}");
                self.close_handle(id);
                self.deferred.push(Action::ConnectDone {
                    tag,
                    callback: request.callback,
                    result: Err(e.into()),
                });
            }
        }
    }

    pub(crate) fn begin_listen(
        &mut self,
        bind: SocketAddr,
        owner: Owner,
    ) -> Result<(HandleId, SocketAddr)> {
        let domain = match bind {
            SocketAddr::V4(_) => Domain::IPV4,
            SocketAddr::V6(_) => Domain::IPV6,
        };
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&bind.into())?;
        socket.listen(self.config.tcp_listen_backlog as i32)?;
        let listener = mio::net::TcpListener::from_std(socket.into());
        let local = listener.local_addr()?;
        let id = self.pool.alloc(HandleKind::Listener(listener), owner);
        let registered = match self.pool.get_mut(id) {
            Some(slot) => match &mut slot.kind {
                HandleKind::Listener(l) => {
                    self.poll
                        .registry()
                        .register(l, id.token(), Interest::READABLE)
                }
                _ => Ok(()),
            },
            None => Ok(()),
        };
        if let Err(e) = registered {
            self.pool.release(id);
            return Err(e.into());
        }
        debug!(%local, "listening");
        Ok((id, local))
    }

    /// Accept one pending connection off a listener. `Ok(None)` means the
    /// backlog is drained.
    pub(crate) fn accept_one(
        &mut self,
        inner: &Weak<ReactorInner>,
        id: HandleId,
    ) -> Result<Option<TcpStream>> {
        let accepted = match self.pool.get_mut(id) {
            Some(slot) => match &mut slot.kind {
                HandleKind::Listener(l) => match l.accept() {
                    Ok((stream, addr)) => Some((stream, addr)),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => None,
                    Err(e) => return Err(e.into()),
                },
                _ => None,
            },
            None => None,
        };
        let Some((stream, addr)) = accepted else {
            return Ok(None);
        };
        let _ = stream.set_nodelay(true);
        let new_id = self.pool.alloc(HandleKind::Tcp(stream), Owner::None);
        let registered = match self.pool.get_mut(new_id) {
            Some(slot) => match &mut slot.kind {
                HandleKind::Tcp(s) => self.poll.registry().register(
                    s,
                    new_id.token(),
                    Interest::READABLE | Interest::WRITABLE,
                ),
                _ => Ok(()),
            },
            None => Ok(()),
        };
        if let Err(e) = registered {
            self.pool.release(new_id);
            return Err(e.into());
        }
        trace!(%addr, "accepted connection");
        TcpStream::attach(self, inner.clone(), new_id, None).map(Some)
    }

    /// Queue a buffered write and try to drain it immediately.
    pub(crate) fn submit_write(
        &mut self,
        id: HandleId,
        chain: BufferChain,
        callback: WriteCallback,
    ) {
        if self.pool.get(id).is_none() {
            self.deferred.push(Action::WriteDone {
                callback,
                result: Err(Error::NotConnected),
            });
            return;
        }
        self.writes.submit(id.slot, chain, callback);
        self.flush_writes(id.slot);
    }

    /// Drain the slot's write queue until the socket would block. Completed
    /// requests queue their callbacks; a socket error fails every queued
    /// request.
    pub(crate) fn flush_writes(&mut self, slot: usize) {
        use std::io::Write;
        loop {
            let Some(request) = self.writes.front_mut(slot) else {
                break;
            };
            let Some(hslot) = self.pool.get_slot_mut(slot) else {
                self.writes.drop_connection(slot);
                break;
            };
            if hslot.closing {
                self.writes.drop_connection(slot);
                break;
            }
            let HandleKind::Tcp(stream) = &mut hslot.kind else {
                self.writes.drop_connection(slot);
                break;
            };
            let written = {
                let slices = request.chain.io_slices();
                stream.write_vectored(&slices)
            };
            match written {
                Ok(n) => {
                    request.chain.advance(n);
                    if request.chain.is_empty() {
                        if let Some(done) = self.writes.pop_front(slot) {
                            self.deferred.push(Action::WriteDone {
                                callback: done.callback,
                                result: Ok(done.total),
                            });
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(slot, "write failed: {e}");
                    let kind = e.kind();
                    let mut first = Some(e);
                    for request in self.writes.take_connection(slot) {
                        let err = match first.take() {
                            Some(e) => e,
                            None => io::Error::from(kind),
                        };
                        self.deferred.push(Action::WriteDone {
                            callback: request.callback,
                            result: Err(err.into()),
                        });
                    }
                    break;
                }
            }
        }
        self.maybe_finish_shutdown(slot);
    }

    /// Ask for a graceful close: once buffered writes drain, shut down the
    /// socket's write side and release the handle.
    pub(crate) fn request_shutdown(&mut self, id: HandleId) {
        if self.pool.get(id).is_none() {
            return;
        }
        self.shutdowns.request(id);
        self.maybe_finish_shutdown(id.slot);
    }

    fn maybe_finish_shutdown(&mut self, slot: usize) {
        if !self.writes.is_idle(slot) {
            return;
        }
        let Some(id) = self.shutdowns.take(slot) else {
            return;
        };
        if let Some(hslot) = self.pool.get_mut(id) {
            if let HandleKind::Tcp(s) = &hslot.kind {
                let _ = s.shutdown(std::net::Shutdown::Write);
            }
        }
        trace!(slot, "shutdown complete");
        self.close_handle(id);
    }

    /// Detach the slot from its owner and queue it for release at the end
    /// of the turn. In-flight events for it become stale; queued writes are
    /// suppressed and their buffers released.
    pub(crate) fn close_handle(&mut self, id: HandleId) {
        let Some(slot) = self.pool.get_mut(id) else {
            return;
        };
        if slot.closing {
            return;
        }
        slot.closing = true;
        slot.owner = Owner::None;
        self.writes.drop_connection(id.slot);
        self.shutdowns.remove(id.slot);
        self.timers.disarm(id);
        self.pending_close.push(id);
    }

    /// Release every handle queued by [`close_handle`] this turn.
    fn finish_turn(&mut self) {
        for id in std::mem::take(&mut self.pending_close) {
            if let Some(mut slot) = self.pool.release(id) {
                match &mut slot.kind {
                    HandleKind::Tcp(s) => {
                        let _ = self.poll.registry().deregister(s);
                    }
                    HandleKind::Listener(l) => {
                        let _ = self.poll.registry().deregister(l);
                    }
                    HandleKind::Timer => {}
                }
            }
        }
    }

    pub(crate) fn set_read_interest(&mut self, id: HandleId, on: bool) -> Result<()> {
        let Some(slot) = self.pool.get_mut(id) else {
            return Err(Error::NotConnected);
        };
        if slot.closing {
            return Err(Error::NotConnected);
        }
        let interest = if on {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::WRITABLE
        };
        match &mut slot.kind {
            HandleKind::Tcp(s) => {
                self.poll.registry().reregister(s, id.token(), interest)?;
                slot.read_interest = on;
                Ok(())
            }
            _ => Err(Error::NotConnected),
        }
    }

    pub(crate) fn read_handle(&mut self, id: HandleId, buf: &mut [u8]) -> io::Result<usize> {
        use std::io::Read;
        match self.pool.get_mut(id) {
            Some(slot) if !slot.closing => match &mut slot.kind {
                HandleKind::Tcp(s) => s.read(buf),
                _ => Err(io::ErrorKind::NotFound.into()),
            },
            _ => Err(io::ErrorKind::NotFound.into()),
        }
    }

    /// Queue a synthetic readable action, for freshly enabled readers whose
    /// socket may already hold buffered data.
    pub(crate) fn defer_readable(&mut self, weak: Weak<StreamCore>) {
        self.deferred.push(Action::Readable(weak));
    }

    pub(crate) fn stream_addr(&self, id: HandleId, peer: bool) -> Result<SocketAddr> {
        match self.pool.get(id) {
            Some(slot) => match &slot.kind {
                HandleKind::Tcp(s) => Ok(if peer { s.peer_addr()? } else { s.local_addr()? }),
                HandleKind::Listener(l) => Ok(l.local_addr()?),
                HandleKind::Timer => Err(Error::NotConnected),
            },
            None => Err(Error::NotConnected),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_stop_before_run_returns_immediately() {
        let reactor = Reactor::create().unwrap();
        reactor.stop();
        reactor.run();
        // the flag was consumed; a stopper can stop a second run too
        let stopper = reactor.stopper();
        stopper.stop();
        reactor.run();
    }

    #[test]
    fn test_scope_stack() {
        assert!(Reactor::current().is_none());
        let a = Reactor::create().unwrap();
        let b = Reactor::create().unwrap();
        {
            let _sa = a.scope();
            assert!(Reactor::current().unwrap().ptr_eq(&a));
            {
                let _sb = b.scope();
                assert!(Reactor::current().unwrap().ptr_eq(&b));
            }
            assert!(Reactor::current().unwrap().ptr_eq(&a));
        }
        assert!(Reactor::current().is_none());
    }

    #[test]
    fn test_duplicate_connect_tag_rejected() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let accepter = std::thread::spawn(move || {
            let _ = listener.accept();
        });
        let reactor = Reactor::create().unwrap();
        let completions = Rc::new(Cell::new(0u32));
        let count = completions.clone();
        let handle = reactor.clone();
        reactor
            .connect(
                addr,
                7,
                move |tag, result| {
                    assert_eq!(tag, 7);
                    assert!(result.is_ok());
                    count.set(count.get() + 1);
                    handle.stop();
                },
                Some(Duration::from_secs(5)),
                false,
                None,
            )
            .unwrap();
        let err = reactor
            .connect(addr, 7, |_, _| {}, None, false, None)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        // the synchronous rejection leaves the first request untouched
        reactor.run();
        assert_eq!(completions.get(), 1);
        accepter.join().unwrap();
    }

    #[test]
    fn test_connect_rejects_portless_address() {
        let reactor = Reactor::create().unwrap();
        let err = reactor
            .connect("127.0.0.1:0".parse().unwrap(), 1, |_, _| {}, None, false, None)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }
}
