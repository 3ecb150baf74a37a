// src/model/mod.rs
pub mod artifacts;
pub mod metrics;
pub mod pipeline;
