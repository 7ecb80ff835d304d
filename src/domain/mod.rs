//! Domain Module
//!
//! Core domain types and the ports the connection cache is built against.

pub mod ports;

pub use ports::*;
