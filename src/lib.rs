//! Bulk import/update engine for remote object-RPC stores.
//!
//! This crate turns flat, denormalized rows (external-id references,
//! self-referencing hierarchies, many-to-many and one-to-many
//! collections) into a correctly ordered sequence of remote calls
//! against a business-object store exposing `create`, `load`, `write`,
//! `search` and schema-introspection verbs.
//!
//! # Architecture Overview
//!
//! ## Core Components
//!
//! - **`plan`**: inspects the remote schema, validates the source
//!   header, flags fields that cannot be set at creation time and
//!   selects a resolution strategy for each of them.
//!
//! - **`sort`**: detects self-referencing parent/child structure in a
//!   row set and reorders rows so hierarchy roots precede children.
//!
//! - **`engine`**: the two-pass creator and writer. Pass 1 performs
//!   fast bulk creation with automatic per-record fallback and builds
//!   the external-key to target-key id map; pass 2 resolves deferred
//!   relations through that map and applies them with grouped write
//!   calls. A sibling batch write engine covers pure update workloads.
//!
//! - **`pool`**: the bounded concurrent worker pool all batch-level
//!   work passes through. Per-task faults are captured and surfaced
//!   without killing sibling tasks.
//!
//! - **`cache`**: content-addressed on-disk persistence for id maps
//!   and schema metadata, keyed by the target connection's identity,
//!   plus deterministic session identifiers for resumable runs.
//!
//! - **`rpc`**: the remote verb surface ([`rpc::ObjectClient`]), a
//!   JSON-RPC HTTP implementation and the caller-owned round-robin
//!   connection pool.
//!
//! ## Data Flow
//!
//! 1. The planner produces an import plan (deferred fields plus
//!    strategies) from the introspected schema.
//! 2. The pre-sort runs when the plan contains a self-reference.
//! 3. Pass 1 runs over the (possibly re-sorted) rows with deferred
//!    columns filtered out, producing the id map.
//! 4. Pass 2 consumes the id map and the plan to resolve and write
//!    deferred relations.
//!
//! The cache is consulted before remote lookups and written as a
//! byproduct of pass 1. Recoverable failures accumulate in a CSV fail
//! file (source header plus `_ERROR_REASON`); fatal configuration,
//! validation and connection errors abort before any partial run.

pub mod cache;
pub mod dataset;
pub mod engine;
pub mod error;
pub mod logging;
pub mod plan;
pub mod pool;
pub mod rpc;
pub mod sort;

pub use cache::{CacheStore, generate_session_id};
pub use dataset::{BatchState, Dataset, FailRecord};
pub use engine::{
    FailFile, ImportEngine, ImportOptions, ImportReport, WriteOutcome, fail_file_name,
    retry_fail_file_name, run_batch_write,
};
pub use error::FlowError;
pub use plan::{ImportPlan, PlanOptions, RelationInfo, Strategy, build_plan};
pub use pool::{AbortFlag, PoolEvent, WorkerFailure, WorkerPool};
pub use rpc::client::JsonRpcClient;
pub use rpc::{
    ConnectionConfig, FieldDef, FieldKind, JsonMap, LoadMessage, LoadResult, ObjectClient,
    RpcError, RpcPool,
};
pub use sort::sort_for_self_reference;
