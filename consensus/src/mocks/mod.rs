//! Mock implementations of the reactor's dependencies for testing.

pub mod function;
pub mod store;
pub mod validators;
