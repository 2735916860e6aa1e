//! Property harnesses for the serbridge ring channel and spillover buffer.
//!
//! Each model drives the real type with an operation sequence and checks it
//! against a `VecDeque` oracle after every step.

pub mod ring_model;
pub mod spillover_model;
