//! keel operator library
//!
//! The binary wires these modules together:
//! - `config`: command line and environment settings
//! - `protocol`: the shoot protocol controller
//! - `admission`: one-shot lifecycle runs of the admission controller component

pub mod admission;
pub mod config;
pub mod protocol;
