// Handlers module for MetalForge Backend
// Thin axum layers over the inventory and step services

pub mod cluster_handler;
pub mod download_handler;
pub mod health_handler;
pub mod host_handler;
pub mod instruction_handler;
