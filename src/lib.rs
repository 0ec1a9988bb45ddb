//! # Field Sync Core
//!
//! Offline-first storage and synchronization for field data collection.
//! Every database lives on the device in LMDB and is paired, when the
//! network allows, with a CouchDB-compatible remote. Local reads and writes
//! never wait on the network; a remote that cannot be reached only means the
//! device keeps working from its local copy.
//!
//! ## Components
//!
//! - [`DirectoryResolver`] - turns a listing (tenant) id into the connection
//!   parameters of its projects and people databases
//! - [`DatabaseRegistry`] - opens each local store once, replicates it from
//!   its remote once, and hands out the same handle afterwards
//! - [`ActiveProjectTracker`] - the device-local list of enrolled projects
//!   and their credentials
//! - [`RecordStorage`] - typed create/read/update of observation records
//! - [`StagingStore`] and [`StagingSession`] - periodic saves of in-progress
//!   form edits
//!
//! ## Quick Start
//!
//! ```no_run
//! use field_sync_core::{initialize, Observation, SyncConfig, SyncContext, TypeName};
//! use serde_json::json;
//!
//! # async fn run() -> field_sync_core::Result<()> {
//! let ctx = SyncContext::open(SyncConfig::default()).await?;
//! initialize(&ctx).await?;
//!
//! ctx.active().add_active_project("default", "survey", "alice", "secret").await?;
//! let active_id = "default||survey";
//!
//! let id = ctx.records().generate_record_id();
//! let record = Observation::new(id.clone(), TypeName::new("ns", "Tree")?, json!({"height": 4}), "alice");
//! ctx.records().upsert_record(active_id, &record).await?;
//!
//! let stored = ctx.records().lookup_record(active_id, &id).await?;
//! assert_eq!(stored.data, json!({"height": 4}));
//! # Ok(())
//! # }
//! ```
//!
//! ## Errors
//!
//! Every operation returns [`Result`] with a [`SyncError`]. Remote failures
//! surface only where nothing local can stand in, which is the first fetch of
//! a listing; everywhere else they are logged and the call proceeds locally.

pub mod active;
pub mod config;
pub mod connection;
pub mod context;
pub mod datamodel;
pub mod directory;
pub mod doc_store;
pub mod initialization;
pub mod lmdb_store;
pub mod local_doc;
pub mod memory_store;
pub mod records;
pub mod registry;
pub mod remote;
pub mod replication;
pub mod staging;
pub mod staging_session;
pub mod sync_error;

pub use active::ActiveProjectTracker;
pub use config::SyncConfig;
pub use connection::{ConnectionInfo, PossibleConnectionInfo};
pub use context::SyncContext;
pub use datamodel::{
    resolve_project_id, split_full_project_id, ActiveDoc, EncodedObservation, Listing, NonNullListing, Observation,
    ProjectObject, TypeName,
};
pub use directory::DirectoryResolver;
pub use doc_store::{DocumentStore, PutResponse, StoreOpener};
pub use initialization::{initialize, InitReport};
pub use local_doc::LocalDoc;
pub use records::{generate_record_id, RecordStorage, RevisionListing};
pub use registry::{DatabaseRegistry, DbKind};
pub use remote::{RemoteConnector, RemoteDatabase};
pub use staging::{staging_key, ExistingRef, Staged, StagedData, StagingStore};
pub use staging_session::{StagingSession, StagingState, StagingTarget};
pub use sync_error::{Result, SyncError};
