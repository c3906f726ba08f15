//! podweave: deploy sharded processing pods as ordered Kubernetes topologies

pub mod cli;
pub mod config;
pub mod context;
pub mod flow;
pub mod images;
pub mod k8s;
pub mod pod;
