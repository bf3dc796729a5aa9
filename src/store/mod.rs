//! Database access, split by owner:
//!
//! - `ingest`: raw events, the idempotency ledger, and the dead-letter sink
//!   (mutated only by the ingest front-end).
//! - `materialize`: the normalized evaluation store (mutated only by the
//!   worker, inside its claiming transaction).
//! - `queries`: read-only projections for the HTTP query endpoints.

pub mod ingest;
pub mod materialize;
pub mod queries;
