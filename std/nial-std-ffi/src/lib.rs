//!
//! nial-std-ffi - Foreign Function Interface
//!
//! Lets nial programs call functions in native shared libraries, with
//! signatures described at runtime as nial data.
//!
//! ## Functions
//!
//! - `nffi_initialise() -> [[name, type]]`: the 24 basic type handles
//! - `nffi_new_cif(abi, rtype, atypes) -> cif`: prepare a call interface
//! - `nffi_call(cif, fn, args) -> value`: marshal, call and decode
//! - `nffi_load_lib(name) -> lib`: open a shared library
//! - `nffi_get_sym(lib, name) -> fn`: resolve a function
//! - `nffi_new_struct_type(types) -> type`: struct layout for by-value structs
//! - `nffi_alloc_buffer(size) -> buf`: zeroed native memory
//! - `nffi_peek(buf, type, offset) -> value`
//! - `nffi_poke(buf, type, offset, value) -> true`
//! - `nffi_free(ref) -> bool`: release a resource nial no longer references
//!
//! ## Faults
//!
//! Failures return fault values, never panics: `?args`, `?invalid ref`,
//! `?invalid type`, `?arg_types invalid`, `?not a lib`, `?type mismatch`,
//! `?no resources`, `?arg limit exceeded`, `?ffi_prep_cif failed`,
//! `?dlopen failed`, `?get_sym failed`, `?arg count invalid`, `?out of bounds`.
//!
//! ## Example
//!
//! ```ignore
//! let lib = nffi_load_lib(Value::text("libc.so.6"));
//! let abs = nffi_get_sym(Value::list(vec![lib, Value::text("abs")]));
//! let cif = nffi_new_cif(Value::list(vec![Value::Int(0), Value::Int(16), Value::ints(vec![16])]));
//! let r = nffi_call(Value::list(vec![cif, abs, Value::ints(vec![-42])]));
//! assert_eq!(r.as_int(), Some(42));
//! ```
//!

pub mod bridge;
pub mod call;
pub mod cif;
pub mod config;
pub mod error;
pub mod handle;
pub mod library;
pub mod longdouble;
pub mod marshal;
pub mod types;

pub use bridge::*;
pub use config::{ConfigError, FfiConfig};
pub use error::{FfiError, FfiResult};
pub use handle::{HandleTable, Release, ResourceKind};
pub use types::{BasicType, NUM_BASIC_TYPES};
