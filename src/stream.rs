use crate::buffer::BufferChain;
use crate::error::{Error, Result};
use crate::pool::{HandleId, Owner};
use crate::reactor::{Core, ReactorInner};
use crate::tls::{SslSession, TlsIo};
use bytes::Bytes;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::rc::{Rc, Weak};

/// Per-direction filter between application bytes and wire bytes.
///
/// The plaintext stream uses a passthrough; TLS streams run the record
/// layer here. `on_read` receives wire bytes and yields application
/// fragments into `plain`; any protocol output it needs to transmit
/// (handshake records, alerts) is appended to `wire` for the caller to
/// submit.
pub(crate) trait StreamIo {
    fn on_read(&mut self, data: Bytes, plain: &mut Vec<Bytes>, wire: &mut BufferChain)
        -> Result<()>;
    fn queue_write(&mut self, data: Bytes) -> Result<()>;
    fn flush(&mut self, wire: &mut BufferChain) -> Result<()>;
    fn shutdown(&mut self, wire: &mut BufferChain) -> Result<()>;
}

#[derive(Default)]
pub(crate) struct PlainIo {
    pending: Vec<Bytes>,
}

impl StreamIo for PlainIo {
    fn on_read(
        &mut self,
        data: Bytes,
        plain: &mut Vec<Bytes>,
        _wire: &mut BufferChain,
    ) -> Result<()> {
        plain.push(data);
        Ok(())
    }

    fn queue_write(&mut self, data: Bytes) -> Result<()> {
        self.pending.push(data);
        Ok(())
    }

    fn flush(&mut self, wire: &mut BufferChain) -> Result<()> {
        for data in self.pending.drain(..) {
            wire.append(data);
        }
        Ok(())
    }

    fn shutdown(&mut self, wire: &mut BufferChain) -> Result<()> {
        self.flush(wire)
    }
}

/// Transfer counters for one stream. `unsent` counts wire bytes submitted
/// but not yet accepted by the socket.
#[derive(Clone, Copy, Debug, Default)]
pub struct StreamStats {
    pub sent: u64,
    pub received: u64,
    pub unsent: u64,
}

/// Read callback: receives each decoded fragment, or the error that ended
/// the stream. Returning `false` stops delivery, as if `disable_read` were
/// called.
pub type ReadCallback = Box<dyn FnMut(Result<&[u8]>) -> bool>;

pub(crate) struct StreamCore {
    reactor: Weak<ReactorInner>,
    handle: Cell<Option<HandleId>>,
    io: RefCell<Box<dyn StreamIo>>,
    /// Wire bytes produced by the filter, awaiting submission to the write
    /// queue.
    staged: RefCell<BufferChain>,
    read_cb: RefCell<Option<ReadCallback>>,
    read_enabled: Cell<bool>,
    /// Allocated lazily on the first `enable_read`, sized from config.
    read_buf: RefCell<Option<Box<[u8]>>>,
    /// Wire bytes read on this connection before ownership changed hands
    /// (a coalesced proxy banner, say), replayed ahead of socket data.
    pushback: RefCell<VecDeque<Bytes>>,
    stats: Cell<StreamStats>,
}

enum ReadOutcome {
    Data(Bytes),
    Eof,
    Blocked,
    Failed(io::Error),
}

impl StreamCore {
    /// Pump the socket until it would block, running wire bytes through the
    /// filter and delivering decoded fragments to the read callback.
    pub(crate) fn on_readable(this: &Rc<StreamCore>, inner: &Rc<ReactorInner>) {
        loop {
            if !this.read_enabled.get() {
                return;
            }
            let Some(id) = this.handle.get() else { return };
            // replayed bytes were counted when first read off the socket
            let replay = this.pushback.borrow_mut().pop_front();
            let bytes = match replay {
                Some(bytes) => bytes,
                None => {
                    let outcome = {
                        let mut guard = this.read_buf.borrow_mut();
                        let Some(buf) = guard.as_mut() else { return };
                        match inner.with_core(|c| c.read_handle(id, buf)) {
                            Ok(0) => ReadOutcome::Eof,
                            Ok(n) => ReadOutcome::Data(Bytes::copy_from_slice(&buf[..n])),
                            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                                ReadOutcome::Blocked
                            }
                            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                            // handle released while the action was in flight
                            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                                ReadOutcome::Blocked
                            }
                            Err(e) => ReadOutcome::Failed(e),
                        }
                    };
                    let bytes = match outcome {
                        ReadOutcome::Data(bytes) => bytes,
                        ReadOutcome::Blocked => return,
                        ReadOutcome::Eof => {
                            Self::fail(this, Error::Io(io::ErrorKind::UnexpectedEof.into()));
                            return;
                        }
                        ReadOutcome::Failed(e) => {
                            Self::fail(this, Error::Io(e));
                            return;
                        }
                    };
                    let mut stats = this.stats.get();
                    stats.received += bytes.len() as u64;
                    this.stats.set(stats);
                    bytes
                }
            };

            let mut plain: Vec<Bytes> = Vec::new();
            let filtered = {
                let mut io = this.io.borrow_mut();
                let mut staged = this.staged.borrow_mut();
                io.on_read(bytes, &mut plain, &mut staged)
            };
            // transmit protocol output (handshake records, alerts) even when
            // the filter also reported an error
            if let Err(e) = Self::submit_staged(this) {
                Self::fail(this, e);
                return;
            }
            if let Err(e) = filtered {
                Self::fail(this, e);
                return;
            }
            for fragment in plain {
                if !Self::deliver_data(this, &fragment) {
                    return;
                }
                if this.handle.get().is_none() {
                    // callback shut the stream down
                    return;
                }
            }
        }
    }

    fn deliver_data(this: &Rc<StreamCore>, data: &[u8]) -> bool {
        let taken = this.read_cb.borrow_mut().take();
        let Some(mut callback) = taken else {
            return false;
        };
        let keep = callback(Ok(data));
        if !keep {
            // "stop reading" sticks until enable_read is called again
            this.read_enabled.set(false);
        }
        // the callback may have replaced itself via enable_read
        let mut slot = this.read_cb.borrow_mut();
        if slot.is_none() && this.read_enabled.get() {
            *slot = Some(callback);
        }
        keep && this.read_enabled.get()
    }

    fn deliver_error(this: &Rc<StreamCore>, error: Error) {
        let taken = this.read_cb.borrow_mut().take();
        if let Some(mut callback) = taken {
            callback(Err(error));
            let mut slot = this.read_cb.borrow_mut();
            if slot.is_none() && this.read_enabled.get() {
                *slot = Some(callback);
            }
        }
    }

    /// Deliver a terminal error and stop pumping this stream.
    fn fail(this: &Rc<StreamCore>, error: Error) {
        this.read_enabled.set(false);
        Self::deliver_error(this, error);
    }

    /// Submit staged wire bytes to the write queue, from user context.
    fn submit_staged(this: &Rc<StreamCore>) -> Result<()> {
        if this.staged.borrow().is_empty() {
            return Ok(());
        }
        let inner = this.reactor.upgrade().ok_or(Error::NotConnected)?;
        inner.with_core(|c| Self::submit_staged_core(this, c));
        Ok(())
    }

    /// Submit staged wire bytes; callable while the core is borrowed.
    pub(crate) fn submit_staged_core(this: &Rc<StreamCore>, core: &mut Core) {
        let chain = this.staged.borrow_mut().take();
        if chain.is_empty() {
            return;
        }
        let Some(id) = this.handle.get() else { return };
        let total = chain.len() as u64;
        let mut stats = this.stats.get();
        stats.unsent += total;
        this.stats.set(stats);
        let weak = Rc::downgrade(this);
        core.submit_write(
            id,
            chain,
            Box::new(move |result| {
                let Some(this) = weak.upgrade() else { return };
                let mut stats = this.stats.get();
                match result {
                    Ok(n) => {
                        stats.sent += n as u64;
                        stats.unsent = stats.unsent.saturating_sub(n as u64);
                        this.stats.set(stats);
                    }
                    Err(e) => {
                        stats.unsent = stats.unsent.saturating_sub(total);
                        this.stats.set(stats);
                        StreamCore::deliver_error(&this, e);
                    }
                }
            }),
        );
    }
}

impl Drop for StreamCore {
    fn drop(&mut self) {
        if let (Some(inner), Some(id)) = (self.reactor.upgrade(), self.handle.take()) {
            inner.with_core(|c| c.close_handle(id));
        }
    }
}

/// A connected, non-blocking TCP stream bound to a reactor.
///
/// Reads are callback driven and start disabled. Writes are buffered and
/// drained by the loop; progress shows up in [`stats`](Self::stats).
/// Dropping the stream closes the socket at the end of the current loop
/// turn; [`shutdown`](Self::shutdown) closes it gracefully instead.
pub struct TcpStream {
    core: Rc<StreamCore>,
}

impl std::fmt::Debug for TcpStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpStream")
            .field("handle", &self.core.handle.get())
            .finish_non_exhaustive()
    }
}

impl TcpStream {
    /// Adopt an already connected pool handle, installing the stream as its
    /// owner. With a TLS session, the initial handshake flight is submitted
    /// before returning.
    pub(crate) fn attach(
        core: &mut Core,
        reactor: Weak<ReactorInner>,
        id: HandleId,
        session: Option<SslSession>,
    ) -> Result<TcpStream> {
        let io: Box<dyn StreamIo> = match session {
            Some(session) => Box::new(TlsIo::new(session)),
            None => Box::new(PlainIo::default()),
        };
        let stream_core = Rc::new(StreamCore {
            reactor,
            handle: Cell::new(Some(id)),
            io: RefCell::new(io),
            staged: RefCell::new(BufferChain::new()),
            read_cb: RefCell::new(None),
            read_enabled: Cell::new(false),
            read_buf: RefCell::new(None),
            pushback: RefCell::new(VecDeque::new()),
            stats: Cell::new(StreamStats::default()),
        });
        let Some(slot) = core.pool.get_mut(id) else {
            stream_core.handle.set(None);
            return Err(Error::NotConnected);
        };
        slot.owner = Owner::Stream(Rc::downgrade(&stream_core));
        let flushed = {
            let mut io = stream_core.io.borrow_mut();
            let mut staged = stream_core.staged.borrow_mut();
            io.flush(&mut staged)
        };
        if let Err(e) = flushed {
            // caller still owns the handle; detach so our drop won't reenter
            stream_core.handle.set(None);
            return Err(e);
        }
        StreamCore::submit_staged_core(&stream_core, core);
        Ok(TcpStream { core: stream_core })
    }

    pub(crate) fn take_handle(&self) -> Option<HandleId> {
        self.core.handle.take()
    }

    /// Stage wire bytes already read on this connection for redelivery
    /// ahead of socket data once reads are enabled.
    pub(crate) fn push_received(&self, data: Bytes) {
        if !data.is_empty() {
            self.core.pushback.borrow_mut().push_back(data);
        }
    }

    pub fn is_connected(&self) -> bool {
        self.core.handle.get().is_some()
    }

    /// Begin delivering received data to `callback`. Replaces any previous
    /// callback. Data already buffered by the kernel is picked up without
    /// waiting for a new readiness event.
    pub fn enable_read(
        &self,
        callback: impl FnMut(Result<&[u8]>) -> bool + 'static,
    ) -> Result<()> {
        let inner = self.core.reactor.upgrade().ok_or(Error::NotConnected)?;
        let id = self.core.handle.get().ok_or(Error::NotConnected)?;
        let weak = Rc::downgrade(&self.core);
        inner.with_core(|c| -> Result<()> {
            c.set_read_interest(id, true)?;
            let size = c.config.stream_read_buffer_size;
            let mut guard = self.core.read_buf.borrow_mut();
            if guard.is_none() {
                *guard = Some(vec![0u8; size].into_boxed_slice());
            }
            drop(guard);
            c.defer_readable(weak);
            Ok(())
        })?;
        *self.core.read_cb.borrow_mut() = Some(Box::new(callback));
        self.core.read_enabled.set(true);
        Ok(())
    }

    /// Stop delivering data and release the read buffer. Safe to call from
    /// within the read callback.
    pub fn disable_read(&self) {
        self.core.read_enabled.set(false);
        *self.core.read_cb.borrow_mut() = None;
        *self.core.read_buf.borrow_mut() = None;
        if let (Some(inner), Some(id)) = (self.core.reactor.upgrade(), self.core.handle.get()) {
            let _ = inner.with_core(|c| c.set_read_interest(id, false));
        }
    }

    /// Queue `data` for sending, copying it. With `flush`, the queued bytes
    /// are run through the filter and submitted to the socket.
    pub fn write(&self, data: &[u8], flush: bool) -> Result<()> {
        self.queue(Bytes::copy_from_slice(data), flush)
    }

    /// Queue shared bytes for sending without copying the payload.
    pub fn write_shared(&self, data: Bytes, flush: bool) -> Result<()> {
        self.queue(data, flush)
    }

    /// Queue every fragment of `chain`, leaving it empty.
    pub fn write_chain(&self, chain: &mut BufferChain, flush: bool) -> Result<()> {
        if self.core.handle.get().is_none() {
            return Err(Error::NotConnected);
        }
        let mut local = chain.take();
        {
            let mut io = self.core.io.borrow_mut();
            while let Some(fragment) = local.pop_fragment() {
                io.queue_write(fragment)?;
            }
            if flush {
                io.flush(&mut self.core.staged.borrow_mut())?;
            }
        }
        if flush {
            StreamCore::submit_staged(&self.core)?;
        }
        Ok(())
    }

    fn queue(&self, data: Bytes, flush: bool) -> Result<()> {
        if self.core.handle.get().is_none() {
            return Err(Error::NotConnected);
        }
        if data.is_empty() && !flush {
            return Ok(());
        }
        {
            let mut io = self.core.io.borrow_mut();
            if !data.is_empty() {
                io.queue_write(data)?;
            }
            if flush {
                io.flush(&mut self.core.staged.borrow_mut())?;
            }
        }
        if flush {
            StreamCore::submit_staged(&self.core)?;
        }
        Ok(())
    }

    /// Graceful close: stop reading, flush the filter's close sequence and
    /// all buffered writes, then shut down the socket's write side and
    /// release the handle. The stream is disconnected immediately; further
    /// writes fail with [`Error::NotConnected`].
    pub fn shutdown(&self) {
        let Some(id) = self.core.handle.get() else { return };
        self.core.read_enabled.set(false);
        *self.core.read_cb.borrow_mut() = None;
        *self.core.read_buf.borrow_mut() = None;
        let Some(inner) = self.core.reactor.upgrade() else {
            self.core.handle.set(None);
            return;
        };
        {
            let mut io = self.core.io.borrow_mut();
            let mut staged = self.core.staged.borrow_mut();
            let _ = io.shutdown(&mut staged);
        }
        inner.with_core(|c| {
            StreamCore::submit_staged_core(&self.core, c);
            c.request_shutdown(id);
        });
        self.core.handle.set(None);
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.addr(false)
    }

    pub fn peer_addr(&self) -> Result<SocketAddr> {
        self.addr(true)
    }

    fn addr(&self, peer: bool) -> Result<SocketAddr> {
        let inner = self.core.reactor.upgrade().ok_or(Error::NotConnected)?;
        let id = self.core.handle.get().ok_or(Error::NotConnected)?;
        inner.with_core(|c| c.stream_addr(id, peer))
    }

    pub fn stats(&self) -> StreamStats {
        self.core.stats.get()
    }
}
