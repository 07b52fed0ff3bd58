#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Shared models and logic for the website builder.

pub mod api;
pub mod model;
pub mod validation;

mod util;

pub use util::{new_ulid, now_ms};
