//! Mock types for testing.

pub mod client;
pub mod controller;
