#![cfg(not(target_arch = "wasm32"))]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use firestore_sync::firestore::core::{ListenOptions, Query, SnapshotObserver, ViewSnapshot};
use firestore_sync::firestore::credentials::EmptyCredentialsProvider;
use firestore_sync::firestore::local::shared_client_state::{MemorySharedState, SharedState};
use firestore_sync::firestore::local::{MemoryStorage, StorageBackend};
use firestore_sync::firestore::model::{DatabaseId, DocumentKey, FieldPath, Mutation};
use firestore_sync::firestore::remote::{InMemoryConnection, InMemoryServer, ServerStream, LISTEN_RPC, WRITE_RPC};
use firestore_sync::firestore::value::{FirestoreValue, MapValue};
use firestore_sync::firestore::{ClientContext, FirestoreClient, FirestoreResult, FirestoreSettings};
use firestore_sync::platform::runtime;
use serde_json::{json, Value};

const ROOT: &str = "projects/p/databases/(default)/documents";

fn key(path: &str) -> DocumentKey {
    DocumentKey::from_string(path).unwrap()
}

fn data(value: i64) -> MapValue {
    let mut data = MapValue::empty();
    data.set(&FieldPath::from_dot_separated("n").unwrap(), FirestoreValue::from_integer(value));
    data
}

fn context(
    client_id: &str,
    storage: Arc<dyn StorageBackend>,
    shared_state: Arc<dyn SharedState>,
    synchronize_tabs: bool,
) -> (ClientContext, InMemoryServer) {
    let (connection, server) = InMemoryConnection::pair();
    let context = ClientContext {
        database_id: DatabaseId::default("p"),
        persistence_key: "p".into(),
        client_id: client_id.into(),
        settings: FirestoreSettings {
            synchronize_tabs,
            ..Default::default()
        },
        storage,
        shared_state,
        connection,
        credentials: Arc::new(EmptyCredentialsProvider),
    };
    (context, server)
}

async fn start_single_client() -> (FirestoreClient, Backend) {
    let (context, server) = context("client-a", MemoryStorage::new(), MemorySharedState::new(), false);
    let client = FirestoreClient::start(context).await.unwrap();
    (client, Backend::new(server))
}

/// Plays the server side of one client's connection.
struct Backend {
    server: InMemoryServer,
    streams: BTreeMap<String, ServerStream>,
}

impl Backend {
    fn new(server: InMemoryServer) -> Self {
        Self {
            server,
            streams: BTreeMap::new(),
        }
    }

    /// The most recently opened stream for `rpc`, waiting for one if the
    /// client has not connected yet.
    async fn stream(&mut self, rpc: &str) -> &ServerStream {
        loop {
            let open = self.streams.get(rpc).is_some_and(|stream| !stream.is_closed());
            if open {
                break;
            }
            let stream = tokio::time::timeout(Duration::from_secs(5), self.server.accept())
                .await
                .expect("client did not connect")
                .expect("connection dropped");
            self.streams.insert(stream.rpc_name.clone(), stream);
        }
        &self.streams[rpc]
    }
}

async fn next_message(stream: &ServerStream) -> Value {
    tokio::time::timeout(Duration::from_secs(5), stream.recv())
        .await
        .expect("client sent nothing")
        .expect("stream closed")
}

/// Answers the handshake and acknowledges the next write request.
async fn acknowledge_next_write(stream: &ServerStream, expected_name: &str) {
    let handshake = next_message(stream).await;
    assert!(handshake.get("database").is_some());
    stream.send(json!({ "streamToken": "AQ==" })).unwrap();

    let request = next_message(stream).await;
    let writes = request["writes"].as_array().unwrap();
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0]["update"]["name"], format!("{ROOT}/{expected_name}"));
    stream
        .send(json!({
            "streamToken": "Ag==",
            "commitTime": "1970-01-01T00:00:10Z",
            "writeResults": [{ "updateTime": "1970-01-01T00:00:10Z" }],
        }))
        .unwrap();
}

fn recording_listener() -> (SnapshotObserver, Arc<Mutex<Vec<ViewSnapshot>>>) {
    let snapshots = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&snapshots);
    let observer: SnapshotObserver = Arc::new(move |result: FirestoreResult<ViewSnapshot>| {
        sink.lock().unwrap().push(result.unwrap());
    });
    (observer, snapshots)
}

async fn wait_for_snapshot<F>(snapshots: &Arc<Mutex<Vec<ViewSnapshot>>>, predicate: F) -> ViewSnapshot
where
    F: Fn(&ViewSnapshot) -> bool,
{
    for _ in 0..400 {
        if let Some(last) = snapshots.lock().unwrap().last() {
            if predicate(last) {
                return last.clone();
            }
        }
        runtime::sleep(Duration::from_millis(5)).await;
    }
    panic!("expected snapshot never arrived: {:?}", snapshots.lock().unwrap().last());
}

fn document_change(path: &str, target_id: i64) -> Value {
    json!({
        "documentChange": {
            "document": {
                "name": format!("{ROOT}/{path}"),
                "fields": { "n": { "integerValue": "1" } },
                "updateTime": "1970-01-01T00:00:01Z",
            },
            "targetIds": [target_id],
        }
    })
}

fn current(target_id: i64, token: &str) -> Value {
    json!({ "targetChange": { "targetChangeType": "CURRENT", "targetIds": [target_id], "resumeToken": token } })
}

fn added(target_id: i64) -> Value {
    json!({ "targetChange": { "targetChangeType": "ADD", "targetIds": [target_id] } })
}

fn global_snapshot(read_time: &str) -> Value {
    json!({ "targetChange": { "readTime": read_time } })
}

#[tokio::test]
async fn offline_write_loses_pending_flag_once_acknowledged() {
    let (client, mut backend) = start_single_client().await;
    let (observer, snapshots) = recording_listener();
    let options = ListenOptions {
        include_metadata_changes: true,
        ..Default::default()
    };
    let _registration = client
        .listen(Query::collection("rooms").unwrap(), options, observer)
        .await
        .unwrap();

    client.disable_network().await.unwrap();
    let pending = client
        .write(vec![Mutation::set(key("rooms/a"), data(1))])
        .await
        .unwrap();
    wait_for_snapshot(&snapshots, |snapshot| {
        snapshot.documents.contains(&key("rooms/a")) && snapshot.has_pending_writes()
    })
    .await;

    let before_ack = client.get_document_from_local_cache(key("rooms/a")).await.unwrap();
    assert!(before_ack.has_local_mutations());

    client.enable_network().await.unwrap();
    acknowledge_next_write(backend.stream(WRITE_RPC).await, "rooms/a").await;
    tokio::time::timeout(Duration::from_secs(5), pending.wait())
        .await
        .unwrap()
        .unwrap();

    let after_ack = client.get_document_from_local_cache(key("rooms/a")).await.unwrap();
    assert!(!after_ack.has_local_mutations());
    assert!(after_ack.has_committed_mutations());

    // The view keeps the write pending until watch confirms the document.
    let stream = backend.stream(LISTEN_RPC).await;
    let request = next_message(stream).await;
    let target_id = request["addTarget"]["targetId"].as_i64().unwrap();
    let mut confirmed = document_change("rooms/a", target_id);
    confirmed["documentChange"]["document"]["updateTime"] = json!("1970-01-01T00:00:10Z");
    for message in [
        added(target_id),
        confirmed,
        current(target_id, "AQ=="),
        global_snapshot("1970-01-01T00:00:11Z"),
    ] {
        stream.send(message).unwrap();
    }
    let snapshot = wait_for_snapshot(&snapshots, |snapshot| !snapshot.has_pending_writes()).await;
    assert!(snapshot.documents.contains(&key("rooms/a")));
    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn bloom_filter_moves_missing_document_into_limbo() {
    let (client, mut backend) = start_single_client().await;
    let (observer, snapshots) = recording_listener();
    let _registration = client
        .listen(Query::collection("rooms").unwrap(), ListenOptions::default(), observer)
        .await
        .unwrap();

    let stream = backend.stream(LISTEN_RPC).await;
    let request = next_message(stream).await;
    let target_id = request["addTarget"]["targetId"].as_i64().unwrap();
    for message in [
        added(target_id),
        document_change("rooms/k1", target_id),
        document_change("rooms/k2", target_id),
        current(target_id, "AQ=="),
        global_snapshot("1970-01-01T00:00:05Z"),
    ] {
        stream.send(message).unwrap();
    }
    wait_for_snapshot(&snapshots, |snapshot| snapshot.documents.len() == 2 && !snapshot.from_cache).await;

    // Only rooms/k1 is set in the filter: bits 2 and 12 of 13.
    stream
        .send(json!({
            "filter": {
                "targetId": target_id,
                "count": 1,
                "unchangedNames": { "bits": { "bitmap": "BBA=", "padding": 3 }, "hashCount": 2 },
            }
        }))
        .unwrap();
    stream.send(global_snapshot("1970-01-01T00:00:06Z")).unwrap();

    // The filter identified the deleted document, so only it is re-queried.
    let limbo_request = next_message(stream).await;
    assert_eq!(limbo_request["addTarget"]["targetId"], 1);
    assert_eq!(
        limbo_request["addTarget"]["documents"]["documents"][0],
        format!("{ROOT}/rooms/k2")
    );

    for message in [added(1), current(1, "Ag=="), global_snapshot("1970-01-01T00:00:07Z")] {
        stream.send(message).unwrap();
    }
    let snapshot = wait_for_snapshot(&snapshots, |snapshot| {
        snapshot.documents.len() == 1 && !snapshot.from_cache
    })
    .await;
    assert!(snapshot.documents.contains(&key("rooms/k1")));
    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn primary_sends_the_secondary_clients_write() {
    let storage: Arc<dyn StorageBackend> = MemoryStorage::new();
    let shared_state: Arc<dyn SharedState> = MemorySharedState::new();
    let (context_a, server_a) = context("client-a", Arc::clone(&storage), Arc::clone(&shared_state), true);
    let (context_b, _server_b) = context("client-b", storage, shared_state, true);
    let primary = FirestoreClient::start(context_a).await.unwrap();
    let secondary = FirestoreClient::start(context_b).await.unwrap();
    assert!(primary.is_primary());
    assert!(!secondary.is_primary());

    let pending = secondary
        .write(vec![Mutation::set(key("rooms/b"), data(2))])
        .await
        .unwrap();
    let mut backend = Backend::new(server_a);
    acknowledge_next_write(backend.stream(WRITE_RPC).await, "rooms/b").await;

    tokio::time::timeout(Duration::from_secs(5), pending.wait())
        .await
        .unwrap()
        .unwrap();
    secondary.shutdown().await.unwrap();
    primary.shutdown().await.unwrap();
}

#[tokio::test]
async fn garbage_collection_below_the_cache_threshold_is_a_no_op() {
    let (client, _backend) = start_single_client().await;
    client.disable_network().await.unwrap();
    client
        .write(vec![Mutation::set(key("rooms/a"), data(1))])
        .await
        .unwrap();

    let results = client.collect_garbage().await.unwrap();
    assert!(!results.did_run);
    assert_eq!(results.documents_removed, 0);
    assert_eq!(results.targets_removed, 0);
    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn malformed_watch_response_restarts_the_listen() {
    let (client, mut backend) = start_single_client().await;
    let (observer, snapshots) = recording_listener();
    let _registration = client
        .listen(Query::collection("rooms").unwrap(), ListenOptions::default(), observer)
        .await
        .unwrap();

    let target_id = {
        let stream = backend.stream(LISTEN_RPC).await;
        let request = next_message(stream).await;
        let target_id = request["addTarget"]["targetId"].as_i64().unwrap();
        let mut broken = document_change("rooms/k2", target_id);
        broken["documentChange"]["document"]["updateTime"] = json!("not-a-time");
        for message in [
            added(target_id),
            document_change("rooms/k1", target_id),
            broken,
            current(target_id, "AQ=="),
            global_snapshot("1970-01-01T00:00:05Z"),
        ] {
            // The client may already have hung up.
            let _ = stream.send(message);
        }
        let closed = tokio::time::timeout(Duration::from_secs(5), stream.recv())
            .await
            .expect("client kept the broken stream open");
        assert!(closed.is_none());
        target_id
    };

    // Nothing from the broken stream was committed, so the target comes back
    // without a resume token.
    let stream = backend.stream(LISTEN_RPC).await;
    let request = next_message(stream).await;
    assert_eq!(request["addTarget"]["targetId"].as_i64(), Some(target_id));
    assert!(request["addTarget"].get("resumeToken").is_none());

    for message in [
        added(target_id),
        document_change("rooms/k1", target_id),
        document_change("rooms/k2", target_id),
        current(target_id, "Ag=="),
        global_snapshot("1970-01-01T00:00:06Z"),
    ] {
        stream.send(message).unwrap();
    }
    wait_for_snapshot(&snapshots, |snapshot| snapshot.documents.len() == 2 && !snapshot.from_cache).await;
    for snapshot in snapshots.lock().unwrap().iter().filter(|snapshot| !snapshot.from_cache) {
        assert!(snapshot.documents.contains(&key("rooms/k2")));
    }
    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn malformed_write_response_resends_the_batch() {
    let (client, mut backend) = start_single_client().await;
    let pending = client
        .write(vec![Mutation::set(key("rooms/a"), data(1))])
        .await
        .unwrap();

    {
        let stream = backend.stream(WRITE_RPC).await;
        next_message(stream).await;
        stream.send(json!({ "streamToken": "AQ==" })).unwrap();
        let request = next_message(stream).await;
        assert_eq!(request["writes"].as_array().map(Vec::len), Some(1));
        stream
            .send(json!({
                "streamToken": "Ag==",
                "commitTime": "not-a-time",
                "writeResults": [{ "updateTime": "1970-01-01T00:00:10Z" }],
            }))
            .unwrap();
        let closed = tokio::time::timeout(Duration::from_secs(5), stream.recv())
            .await
            .expect("client kept the broken stream open");
        assert!(closed.is_none());
    }

    acknowledge_next_write(backend.stream(WRITE_RPC).await, "rooms/a").await;
    tokio::time::timeout(Duration::from_secs(5), pending.wait())
        .await
        .unwrap()
        .unwrap();
    let document = client.get_document_from_local_cache(key("rooms/a")).await.unwrap();
    assert!(!document.has_local_mutations());
    client.shutdown().await.unwrap();
}
