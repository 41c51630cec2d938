//! A single-threaded network reactor.
//!
//! One [`Reactor`] owns a poller and a pool of native handles; sockets and
//! timers register with it and all completion callbacks run on the loop's
//! thread. The pieces:
//!
//! * [`Reactor`] - the event loop: non-blocking connects with coalesced
//!   timeouts, cross-thread [`Stopper`], and a thread-local current-reactor
//!   stack via [`Reactor::scope`].
//! * [`TcpStream`] / [`TcpServer`] - callback-driven streams with buffered
//!   scatter-gather writes and graceful shutdown.
//! * [`Timer`], [`CoarseTimer`], [`MultiplexedTimer`] - native timers and
//!   coalescing layers over them.
//! * [`SslContext`] / [`SslSession`] - TLS over in-memory pipes, wired into
//!   streams by [`Reactor::wrap_tls`] or `use_tls` on connect.
//! * [`ProxyConnector`] - SOCKS5 client tunnelling.
//!
//! Everything except [`Stopper::stop`] must stay on the loop's thread.

mod buffer;
mod coarse_timer;
mod config;
mod connector;
mod error;
mod pool;
mod proxy;
mod reactor;
mod server;
mod shutdown;
mod stream;
mod timer;
mod tls;
mod write;

pub use buffer::BufferChain;
pub use coarse_timer::{CoarseTimer, MultiplexedTimer};
pub use config::{ConfigError, ReactorConfig};
pub use connector::ConnectCallback;
pub use error::{Error, Result};
pub use proxy::{ProxyConnector, ProxyStage};
pub use reactor::{Reactor, ReactorScope, Stopper};
pub use server::TcpServer;
pub use stream::{ReadCallback, StreamStats, TcpStream};
pub use timer::Timer;
pub use tls::{SslContext, SslSession, TlsState};
