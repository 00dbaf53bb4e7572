//! Application services layer.

pub mod error;
pub mod records;
pub mod repos;
pub mod reservations;
pub mod sync;
