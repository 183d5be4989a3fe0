//! # MiniDB Storage Engine
//! A single-node relational storage engine: typed tuples in slotted-page
//! heap files, B+-tree indexes, a write-ahead log with crash recovery,
//! and two-phase locking — built on the `strata` substrate.
//!
//! The SQL front end (parser, planner, executor, REPL) is an external
//! collaborator; [`engine::Engine`] is the contract it consumes.

/// Persistent schema registry.
pub mod catalog;
/// Tuple encoding against a schema.
pub mod codec;
/// Engine configuration.
pub mod config;
/// The process-wide engine object.
pub mod engine;
/// Engine-level error taxonomy.
pub mod errors;
/// Heap table files.
pub mod heap;
/// Typed B+-tree indexes.
pub mod index;
/// Order-preserving index key encoding.
pub mod keycodec;
/// Startup crash recovery.
pub mod recovery;
/// Column and table schemas.
pub mod schema;
/// The value and type system.
pub mod types;

pub use config::EngineConfig;
pub use engine::{CancelToken, Engine};
pub use errors::{DbError, DbResult};
pub use schema::{Column, Schema};
pub use types::{DataType, Value};

pub use strata::{PageId, Rid, SlotId, TxnId};
