//! API Routes

pub mod models;
pub mod predictions;
