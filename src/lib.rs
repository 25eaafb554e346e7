#![doc = include_str!("../README.md")]

#[cfg(test)]
mod context_test;
#[cfg(test)]
mod pipeline_test;
#[cfg(test)]
mod test_util;

pub mod codec;
pub mod context;
pub mod dataset;
pub mod distributer;
pub mod error;
pub mod exchange;
pub mod pipeline;
pub mod project;
pub mod runner;
pub mod short_circuit;

pub use codec::*;
pub use context::*;
pub use dataset::*;
pub use distributer::*;
pub use error::*;
pub use exchange::*;
pub use pipeline::*;
pub use project::*;
pub use runner::*;
pub use short_circuit::*;
