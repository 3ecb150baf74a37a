// src/utils/mod.rs
pub mod db;
pub mod env;
