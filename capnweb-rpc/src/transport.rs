//! The narrow byte-framed interface between a session and its transport.
//!
//! A batch (UTF-8, one JSON message per line) is the atomic unit: a
//! transport must never split one batch across `receive` returns nor join
//! two into one. Concrete network transports live outside this crate; the
//! in-memory channel pair here serves tests and in-process wiring.

use std::cell::RefCell;
use std::rc::Rc;

use tokio::sync::{mpsc, Mutex};

use capnweb::RpcError;

use crate::promise::Promise;

pub trait Transport {
    /// Fire-and-forget enqueue of one batch.
    fn send(&self, data: Vec<u8>) -> Promise<(), RpcError>;

    /// The next whole batch from the peer.
    fn receive(&self) -> Promise<Vec<u8>, RpcError>;

    /// Atomic request/response exchange, for stateless batch transports.
    fn send_and_receive(&self, data: Vec<u8>) -> Promise<Vec<u8>, RpcError>;

    fn close(&self) -> Promise<(), RpcError>;
}

/// Path suffix of the HTTP batch endpoint.
pub const BATCH_ENDPOINT: &str = "/rpc/batch";
/// Path suffix of the WebSocket endpoint.
pub const WS_ENDPOINT: &str = "/rpc/ws";
/// Path suffix of the HTTP/3 stream endpoint.
pub const WEBTRANSPORT_ENDPOINT: &str = "/rpc/wt";

/// Which reference transport a URL selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    HttpBatch,
    WebSocket,
    WebTransport,
}

impl TransportKind {
    pub fn from_url(url: &str) -> Result<Self, RpcError> {
        if url.starts_with("ws://") || url.starts_with("wss://") {
            return Ok(Self::WebSocket);
        }
        if url.starts_with("https://") && url.ends_with(WEBTRANSPORT_ENDPOINT) {
            return Ok(Self::WebTransport);
        }
        if url.starts_with("http://") || url.starts_with("https://") {
            return Ok(Self::HttpBatch);
        }
        Err(RpcError::bad_request(format!(
            "unsupported URL scheme: {url}"
        )))
    }
}

/// One end of an in-memory full-duplex transport.
pub struct ChannelTransport {
    tx: Rc<RefCell<Option<mpsc::UnboundedSender<Vec<u8>>>>>,
    rx: Rc<Mutex<mpsc::UnboundedReceiver<Vec<u8>>>>,
}

/// Creates a connected pair of in-memory transports. Batch boundaries map
/// one-to-one onto channel messages.
pub fn channel_pair() -> (ChannelTransport, ChannelTransport) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    (
        ChannelTransport {
            tx: Rc::new(RefCell::new(Some(a_tx))),
            rx: Rc::new(Mutex::new(b_rx)),
        },
        ChannelTransport {
            tx: Rc::new(RefCell::new(Some(b_tx))),
            rx: Rc::new(Mutex::new(a_rx)),
        },
    )
}

impl ChannelTransport {
    fn send_inner(&self, data: Vec<u8>) -> Result<(), RpcError> {
        match &*self.tx.borrow() {
            Some(tx) => tx
                .send(data)
                .map_err(|_| RpcError::internal("transport closed")),
            None => Err(RpcError::internal("transport closed")),
        }
    }
}

impl Transport for ChannelTransport {
    fn send(&self, data: Vec<u8>) -> Promise<(), RpcError> {
        Promise::from_result(self.send_inner(data))
    }

    fn receive(&self) -> Promise<Vec<u8>, RpcError> {
        let rx = self.rx.clone();
        Promise::from_future(async move {
            rx.lock()
                .await
                .recv()
                .await
                .ok_or_else(|| RpcError::internal("transport closed"))
        })
    }

    fn send_and_receive(&self, data: Vec<u8>) -> Promise<Vec<u8>, RpcError> {
        if let Err(e) = self.send_inner(data) {
            return Promise::err(e);
        }
        self.receive()
    }

    fn close(&self) -> Promise<(), RpcError> {
        self.tx.borrow_mut().take();
        Promise::ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_scheme_selects_transport() {
        assert_eq!(
            TransportKind::from_url("http://localhost:8080/rpc/batch").unwrap(),
            TransportKind::HttpBatch
        );
        assert_eq!(
            TransportKind::from_url("https://example.com/rpc/batch").unwrap(),
            TransportKind::HttpBatch
        );
        assert_eq!(
            TransportKind::from_url("ws://localhost:8080/rpc/ws").unwrap(),
            TransportKind::WebSocket
        );
        assert_eq!(
            TransportKind::from_url("wss://example.com/rpc/ws").unwrap(),
            TransportKind::WebSocket
        );
        assert_eq!(
            TransportKind::from_url("https://example.com/rpc/wt").unwrap(),
            TransportKind::WebTransport
        );
        assert!(TransportKind::from_url("ftp://example.com").is_err());
    }
}
