//! Application Services
//!
//! The provider runtime: owns one fetch strategy and the merged snapshot.

/// Provider runtime, builder and reconfiguration.
pub mod provider;
