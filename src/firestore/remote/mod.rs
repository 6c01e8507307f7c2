//! Backend connectivity: the wire serializer, the watch and write streams,
//! and the remote store that drives them.

pub mod bloom_filter;
pub mod connection;
pub mod online_state_tracker;
pub mod remote_event;
pub mod remote_store;
pub mod remote_syncer;
pub mod serializer;
pub mod streams;
pub mod watch_change;
pub mod watch_change_aggregator;

pub use bloom_filter::BloomFilter;
pub use connection::{
    Connection, DuplexStream, InMemoryConnection, InMemoryServer, ServerStream, LISTEN_RPC, WRITE_RPC,
};
pub use online_state_tracker::OnlineStateTracker;
pub use remote_event::{RemoteEvent, TargetChange};
pub use remote_store::RemoteStore;
pub use remote_syncer::RemoteSyncer;
pub use serializer::JsonProtoSerializer;
pub use streams::{ListenStream, StreamState, WatchStreamListener, WriteStream, WriteStreamListener};
pub use watch_change::{
    BloomFilterParams, DocumentWatchChange, ExistenceFilterChange, WatchChange, WatchTargetChange,
    WatchTargetChangeState,
};
pub use watch_change_aggregator::{TargetMetadataProvider, WatchChangeAggregator};
