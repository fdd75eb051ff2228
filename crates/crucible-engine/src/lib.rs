//! The Crucible scheduling engine.
//!
//! One explicitly constructed [`Engine`] wires the build queue, the
//! executor pool, the project registry, and the dependency graph, and
//! runs the background loops (maintenance sweep, statistics ticker,
//! completion mediation, flyweight coordination) that keep them
//! converging. No global state: embedders own the engine value.

pub mod config;
pub mod engine;
pub mod project;
pub mod registry;

pub use config::EngineConfig;
pub use engine::{BuildHandle, Engine};
pub use project::{Project, ProjectKind};
pub use registry::{BuildRecord, BuildRegistry};
