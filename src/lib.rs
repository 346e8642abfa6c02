// src/lib.rs

// Import the top-level `mindfabric` module.
pub mod mindfabric;

// Re-exporting key items for easier external access.
pub use mindfabric::action;
pub use mindfabric::buses;
pub use mindfabric::config;
pub use mindfabric::error;
pub use mindfabric::feedback;
pub use mindfabric::graph;
pub use mindfabric::persistence;
pub use mindfabric::registry;
pub use mindfabric::scheduler;
pub use mindfabric::self_config;
pub use mindfabric::service;
pub use mindfabric::snapshot;
pub use mindfabric::telemetry;
pub use mindfabric::variance;

pub use mindfabric::buses::manager::BusManager;
pub use mindfabric::config::FabricConfig;
pub use mindfabric::registry::ServiceRegistry;
