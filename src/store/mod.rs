//! Ephemeral request/job state.
//!
//! The TTL store is the only shared mutable structure in the service. The
//! context registry is a typed facade over it, holding per-request
//! optimization parameters between the accepting handler and the worker.

mod context;
mod ttl;

pub use context::{
    ContextRegistry, RequestContext, Stored, StoredUpload, CONTROLLER_PARAMS,
};
pub use ttl::{TtlStore, DEFAULT_SWEEP_INTERVAL_SECS, DEFAULT_TTL_SECS};
