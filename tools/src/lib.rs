//! Storage backend and fixtures for exercising `chainsvc` outside of a node.

pub mod dummy;
pub mod rocks;
