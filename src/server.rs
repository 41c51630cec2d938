use crate::error::{Error, Result};
use crate::pool::{HandleId, Owner};
use crate::reactor::{Reactor, ReactorInner};
use crate::stream::TcpStream;
use std::cell::{Cell, RefCell};
use std::net::SocketAddr;
use std::rc::{Rc, Weak};
use tracing::debug;

pub(crate) type AcceptCallback = Box<dyn FnMut(Result<TcpStream>)>;

pub(crate) struct ServerCore {
    reactor: Weak<ReactorInner>,
    handle: Cell<Option<HandleId>>,
    on_accept: RefCell<Option<AcceptCallback>>,
}

impl ServerCore {
    /// Drain the listener backlog, handing each accepted stream (or the
    /// accept error) to the callback. Accepted streams start with reads
    /// disabled.
    pub(crate) fn on_acceptable(this: &Rc<ServerCore>, inner: &Rc<ReactorInner>) {
        loop {
            let Some(id) = this.handle.get() else { return };
            let weak_inner = Rc::downgrade(inner);
            let accepted = inner.with_core(|c| c.accept_one(&weak_inner, id));
            let result = match accepted {
                Ok(Some(stream)) => Ok(stream),
                Ok(None) => return,
                Err(e) => Err(e),
            };
            let stop = result.is_err();
            let taken = this.on_accept.borrow_mut().take();
            if let Some(mut callback) = taken {
                callback(result);
                let mut slot = this.on_accept.borrow_mut();
                if slot.is_none() {
                    *slot = Some(callback);
                }
            }
            if stop {
                return;
            }
        }
    }
}

/// A listening socket bound to a reactor. Incoming connections are accepted
/// by the loop and delivered to the callback as connected [`TcpStream`]s.
/// Dropping the server closes the listener.
pub struct TcpServer {
    core: Rc<ServerCore>,
}

impl TcpServer {
    pub fn create(
        reactor: &Reactor,
        bind: SocketAddr,
        on_accept: impl FnMut(Result<TcpStream>) + 'static,
    ) -> Result<TcpServer> {
        let core = Rc::new(ServerCore {
            reactor: Rc::downgrade(reactor.inner()),
            handle: Cell::new(None),
            on_accept: RefCell::new(Some(Box::new(on_accept))),
        });
        let owner = Owner::Listener(Rc::downgrade(&core));
        let (id, local) = reactor.inner().with_core(|c| c.begin_listen(bind, owner))?;
        core.handle.set(Some(id));
        debug!(%local, "tcp server created");
        Ok(TcpServer { core })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        let inner = self.core.reactor.upgrade().ok_or(Error::NotConnected)?;
        let id = self.core.handle.get().ok_or(Error::NotConnected)?;
        inner.with_core(|c| c.stream_addr(id, false))
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        if let (Some(inner), Some(id)) = (self.core.reactor.upgrade(), self.core.handle.take()) {
            inner.with_core(|c| c.close_handle(id));
        }
    }
}
