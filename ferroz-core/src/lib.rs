//! # Ferroz Core
//!
//! Support crate for the Ferroz compression engine.
//!
//! This crate holds the pieces every Ferroz codec crate shares:
//!
//! - [`error`]: the workspace-wide error enum and `Result` alias
//! - [`control`]: cooperative cancellation and progress reporting
//!
//! The engine itself lives in `ferroz-lzma`; this crate deliberately knows
//! nothing about bitstream formats so that error and control plumbing can be
//! reused by future codec crates.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod control;
pub mod error;

pub use control::CancelToken;
pub use error::{FerrozError, Result};
