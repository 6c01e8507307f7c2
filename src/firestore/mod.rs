//! Offline-first document cache and sync engine.
//!
//! [`client::FirestoreClient`] is the entry point. Below it, `core` holds
//! queries, views and the sync engine, `local` the durable cache and
//! `remote` the watch and write streams.

pub mod client;
pub mod core;
pub mod credentials;
pub mod error;
pub mod local;
pub mod model;
pub mod remote;
pub mod settings;
pub mod value;

pub use client::{ClientContext, FirestoreClient, ListenerRegistration};
pub use error::{FirestoreError, FirestoreErrorCode, FirestoreResult};
pub use settings::FirestoreSettings;
