//! Query model and the coordination layer between listeners, the local
//! store and the remote store.

pub mod dnf;
pub mod document_set;
pub mod event_manager;
pub mod filter;
pub mod listen_sequence;
pub mod online_state;
pub mod query;
pub mod sync_engine;
pub mod target;
pub mod target_id_generator;
pub mod view;
pub mod view_snapshot;

pub use document_set::DocumentSet;
pub use event_manager::{EventManager, ListenOptions, QueryListener, SnapshotObserver};
pub use filter::{CompositeFilter, CompositeOperator, FieldFilter, Filter, Operator};
pub use listen_sequence::ListenSequence;
pub use online_state::OnlineState;
pub use query::{Bound, Direction, LimitType, OrderBy, Query};
pub use sync_engine::SyncEngine;
pub use target::Target;
pub use target_id_generator::TargetIdGenerator;
pub use view::{LimboDocumentChange, QueryResult, View, ViewChange, ViewDocumentChanges};
pub use view_snapshot::{ChangeType, DocumentChangeSet, DocumentViewChange, SyncState, ViewSnapshot};
