// src/lib.rs
//! Late-delivery prediction pipeline.
//!
//! Three batch stages over a shared SQLite store:
//! - `warehouse` builds the labeled fact table from shipped orders,
//! - `training` fits the scoring pipeline and picks a recall-first threshold,
//! - `inference` scores unfulfilled orders and upserts predictions.
//!
//! The `features` module is the single source of feature derivations; both
//! the warehouse ETL and inference go through it, which is what keeps
//! training-time and scoring-time feature values identical.

pub mod config;
pub mod features;
pub mod inference;
pub mod model;
pub mod orchestrator;
pub mod training;
pub mod utils;
pub mod warehouse;
