//! Domain Layer - Fetch results, snapshot merging and backoff.
//!
//! Pure state with no I/O: the per-id result types every fetch strategy
//! produces, the freshest-value snapshot they are merged into, and the
//! backoff controller used between sessions.

/// Exponential backoff controller.
pub mod backoff;

/// Results, coded errors and the resolved/unresolved partition.
pub mod response;

/// Last-known-good snapshot and its merge rule.
pub mod snapshot;
