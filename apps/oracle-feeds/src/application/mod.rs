//! Application Layer - Provider runtime and port definitions.
//!
//! This layer contains the provider service and the port interfaces that
//! define how it talks to fetch strategies and collaborators.

/// Port interfaces for fetch strategies and collaborators.
pub mod ports;

/// The per-source provider runtime.
pub mod services;
