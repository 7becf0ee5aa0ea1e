//! Concrete implementations of the traits in [`crate::traits`] that do not
//! talk to a real server.
//!
//! - `mock`: test doubles for the controller link, encoders and supervision seams

pub mod mock;

pub use mock::*;
