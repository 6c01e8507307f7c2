//! Duplex RPC streams to the backend.
//!
//! A [`Connection`] opens one [`DuplexStream`] per RPC. Messages are the JSON
//! mapping of the backend protos; framing and transport security belong to
//! the connection implementation. [`InMemoryConnection`] loops streams back
//! to an [`InMemoryServer`] so tests can play the backend.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_channel::{Receiver, Sender};
use async_trait::async_trait;
use serde_json::Value as JsonValue;

use crate::firestore::credentials::Token;
use crate::firestore::error::{unavailable, FirestoreError, FirestoreResult};

pub const LISTEN_RPC: &str = "Listen";
pub const WRITE_RPC: &str = "Write";

/// Client end of an open RPC stream.
#[derive(Debug)]
pub struct DuplexStream {
    outbound: Sender<JsonValue>,
    inbound: Receiver<FirestoreResult<JsonValue>>,
}

impl DuplexStream {
    pub fn new(outbound: Sender<JsonValue>, inbound: Receiver<FirestoreResult<JsonValue>>) -> Self {
        Self { outbound, inbound }
    }

    /// Queues `message` without waiting. Fails once either side closed.
    pub fn send(&self, message: JsonValue) -> FirestoreResult<()> {
        self.outbound
            .try_send(message)
            .map_err(|err| unavailable(format!("Stream is closed: {err}")))
    }

    /// Next message from the backend; `None` once the stream ended cleanly.
    pub async fn next(&self) -> Option<FirestoreResult<JsonValue>> {
        self.inbound.recv().await.ok()
    }

    pub fn close(&self) {
        self.outbound.close();
        self.inbound.close();
    }
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait Connection: Send + Sync + 'static {
    /// Opens a stream for `rpc_name` ([`LISTEN_RPC`] or [`WRITE_RPC`]),
    /// authenticated with `token` when present.
    async fn open_stream(&self, rpc_name: &str, token: Option<Token>) -> FirestoreResult<DuplexStream>;

    /// Releases transport resources. Streams opened afterwards fail.
    fn terminate(&self) {}
}

/// Server end of a stream opened through an [`InMemoryConnection`].
#[derive(Debug)]
pub struct ServerStream {
    pub rpc_name: String,
    pub auth_token: Option<String>,
    inbound: Receiver<JsonValue>,
    outbound: Sender<FirestoreResult<JsonValue>>,
}

impl ServerStream {
    /// Next client message; `None` once the client closed the stream.
    pub async fn recv(&self) -> Option<JsonValue> {
        self.inbound.recv().await.ok()
    }

    pub fn try_recv(&self) -> Option<JsonValue> {
        self.inbound.try_recv().ok()
    }

    pub fn send(&self, message: JsonValue) -> FirestoreResult<()> {
        self.outbound
            .try_send(Ok(message))
            .map_err(|err| unavailable(format!("Client closed the stream: {err}")))
    }

    /// Ends the stream with `error`.
    pub fn fail(&self, error: FirestoreError) {
        let _ = self.outbound.try_send(Err(error));
        self.close();
    }

    pub fn close(&self) {
        self.outbound.close();
        self.inbound.close();
    }

    pub fn is_closed(&self) -> bool {
        self.outbound.is_closed()
    }
}

/// Loopback connection whose streams surface on the paired server.
pub struct InMemoryConnection {
    accepted: Sender<ServerStream>,
    reachable: Arc<AtomicBool>,
    terminated: AtomicBool,
}

/// Test-side half of [`InMemoryConnection::pair`].
pub struct InMemoryServer {
    accepted: Receiver<ServerStream>,
    reachable: Arc<AtomicBool>,
}

impl InMemoryConnection {
    pub fn pair() -> (Arc<Self>, InMemoryServer) {
        let (accepted_tx, accepted_rx) = async_channel::unbounded();
        let reachable = Arc::new(AtomicBool::new(true));
        (
            Arc::new(Self {
                accepted: accepted_tx,
                reachable: Arc::clone(&reachable),
                terminated: AtomicBool::new(false),
            }),
            InMemoryServer {
                accepted: accepted_rx,
                reachable,
            },
        )
    }
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl Connection for InMemoryConnection {
    async fn open_stream(&self, rpc_name: &str, token: Option<Token>) -> FirestoreResult<DuplexStream> {
        if self.terminated.load(Ordering::SeqCst) {
            return Err(unavailable("Connection was terminated"));
        }
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(unavailable("Backend is unreachable"));
        }
        let (client_tx, server_rx) = async_channel::unbounded();
        let (server_tx, client_rx) = async_channel::unbounded();
        self.accepted
            .try_send(ServerStream {
                rpc_name: rpc_name.to_string(),
                auth_token: token.map(|token| token.value),
                inbound: server_rx,
                outbound: server_tx,
            })
            .map_err(|err| unavailable(format!("Backend is gone: {err}")))?;
        log::debug!("opened in-memory {rpc_name} stream");
        Ok(DuplexStream::new(client_tx, client_rx))
    }

    fn terminate(&self) {
        self.terminated.store(true, Ordering::SeqCst);
    }
}

impl InMemoryServer {
    pub async fn accept(&self) -> Option<ServerStream> {
        self.accepted.recv().await.ok()
    }

    pub fn try_accept(&self) -> Option<ServerStream> {
        self.accepted.try_recv().ok()
    }

    /// While unreachable, opening a stream fails with `Unavailable`.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn messages_flow_both_ways() {
        let (connection, server) = InMemoryConnection::pair();
        let client = connection.open_stream(LISTEN_RPC, None).await.unwrap();
        let stream = server.accept().await.unwrap();
        assert_eq!(stream.rpc_name, LISTEN_RPC);

        client.send(json!({ "addTarget": { "targetId": 2 } })).unwrap();
        assert_eq!(stream.recv().await.unwrap()["addTarget"]["targetId"], 2);

        stream.send(json!({ "targetChange": {} })).unwrap();
        assert!(client.next().await.unwrap().is_ok());

        client.close();
        assert!(stream.recv().await.is_none());
    }

    #[tokio::test]
    async fn failures_reach_the_client() {
        let (connection, server) = InMemoryConnection::pair();
        server.set_reachable(false);
        assert!(connection.open_stream(WRITE_RPC, None).await.is_err());

        server.set_reachable(true);
        let client = connection.open_stream(WRITE_RPC, None).await.unwrap();
        let stream = server.accept().await.unwrap();
        stream.fail(unavailable("going away"));
        assert!(client.next().await.unwrap().is_err());
        assert!(client.next().await.is_none());
    }
}
