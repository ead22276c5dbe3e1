pub mod cluster;
pub mod config;
pub mod cpu;
pub mod executor;
pub mod fs;
pub mod handlers;
pub mod job;
pub mod job_manager;
pub mod load_balancer;
pub mod node;
pub mod remote;
mod runner;

#[cfg(test)]
mod testing;

pub use cluster::{Cluster, NodeService};
pub use config::NodeConfig;
pub use node::Node;
pub use remote::RemoteNode;
