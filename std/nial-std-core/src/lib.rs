//!
//! nial-std-core - Core Runtime Values
//!
//! This crate provides the host-side value model shared by the nial runtime crates:
//!
//! - `Value` for tagged host values passed to and returned from primitives
//! - `BoxedInt` for reference-counted integers whose identity is observable
//! - `NialArray` for fixed-length numeric arrays with stable element storage
//! - `Fault` for tagged failure values
//!
//! Heap values are shared through `Arc`, so cloning a value is the host's
//! "increment reference count" and dropping it is the matching decrement.
//!

pub mod value;
pub mod array;
pub mod fault;

pub use value::*;
pub use array::*;
pub use fault::*;
