use crate::error::Result;
use crate::pool::HandleId;
use crate::stream::TcpStream;
use crate::tls::SslContext;
use std::collections::HashMap;
use std::sync::Arc;

/// Completion callback for a connect request. Receives the request tag and
/// either a connected stream or the reason the attempt failed.
pub type ConnectCallback = Box<dyn FnOnce(u64, Result<TcpStream>)>;

pub(crate) struct ConnectRequest {
    pub handle: HandleId,
    pub callback: ConnectCallback,
    /// TLS context to wrap the stream with once the socket connects.
    pub tls: Option<Arc<SslContext>>,
}

/// In-flight connect requests keyed by caller-chosen tag.
///
/// A request's presence here is the single authority on whether its callback
/// still runs: cancellation and timeout both remove the entry, so a
/// readiness event that arrives afterwards finds nothing and is dropped.
pub(crate) struct ConnectorManager {
    requests: HashMap<u64, ConnectRequest>,
}

impl ConnectorManager {
    pub fn new(capacity: usize) -> Self {
        Self {
            requests: HashMap::with_capacity(capacity),
        }
    }

    pub fn contains(&self, tag: u64) -> bool {
        self.requests.contains_key(&tag)
    }

    pub fn insert(&mut self, tag: u64, request: ConnectRequest) {
        self.requests.insert(tag, request);
    }

    pub fn remove(&mut self, tag: u64) -> Option<ConnectRequest> {
        self.requests.remove(&tag)
    }
}
