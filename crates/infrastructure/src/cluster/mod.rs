//! 集群驱动实现

pub mod simulator;

pub use simulator::SimulatedCluster;
