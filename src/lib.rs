//! Stampede: a distributed HTTP load-generation framework.
//!
//! A *scenario* binds a journey (registered user code), an optional data
//! pool, and a volume model. The controller translates volume models into
//! per-runner work grants over a request/reply wire; runners execute granted
//! journeys cooperatively and push telemetry to a collector.

pub mod collector;
pub mod config;
pub mod context;
pub mod controller;
pub mod datapool;
pub mod demos;
pub mod errors;
pub mod messages;
pub mod pacing;
pub mod registry;
pub mod runner;
pub mod scenario;
pub mod session;
pub mod stats;
pub mod tracker;
pub mod volume;
pub mod wire;

pub use context::Context;
pub use errors::JourneyError;
pub use registry::Registry;

/// Build the default registry: the built-in demo entries, ready for callers
/// to extend with their own journeys before `build()`.
pub fn default_registry_builder() -> registry::RegistryBuilder {
    demos::register(Registry::builder())
}
