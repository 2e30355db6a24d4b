///
/// FFI error types.
///
/// Every failure the bridge can report. None of them abort the process: the
/// host boundary turns each into a fault value whose reason is `reason()`.
/// The `Display` text carries the detail and is only used for logging.
///

use nial_std_core::{Fault, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FfiError {
    #[error("Invalid arguments: {0}")]
    ArgShapeInvalid(String),

    #[error("Invalid handle {0}")]
    InvalidHandle(i64),

    #[error("Invalid type handle: {0}")]
    InvalidType(String),

    #[error("Call expects a call interface and a function handle")]
    InvalidArgTypes,

    #[error("Handle {0} is not a library")]
    NotALibrary(i64),

    #[error("Type mismatch: {type_name} cannot be built from a {value_kind}")]
    TypeMismatch {
        type_name: String,
        value_kind: &'static str,
    },

    #[error("No free handles: {0}")]
    ResourceExhausted(String),

    #[error("Too many arguments: {count} exceeds the limit of {limit}")]
    ArgLimitExceeded { count: usize, limit: usize },

    #[error("ffi_prep_cif failed: {0}")]
    PrepareFailed(String),

    #[error("Failed to load library '{name}': {reason}")]
    LoadFailed { name: String, reason: String },

    #[error("Symbol '{name}' not found: {reason}")]
    SymbolNotFound { name: String, reason: String },

    #[error("Call interface expects {expected} arguments, got {actual}")]
    ArgCountInvalid { expected: usize, actual: usize },

    #[error("Buffer access of {size} bytes at offset {offset} is outside {len} bytes")]
    OutOfBounds {
        offset: usize,
        size: usize,
        len: usize,
    },
}

impl FfiError {
    /// Short machine-readable reason used in host faults
    pub fn reason(&self) -> &'static str {
        match self {
            FfiError::ArgShapeInvalid(_) => "args",
            FfiError::InvalidHandle(_) => "invalid ref",
            FfiError::InvalidType(_) => "invalid type",
            FfiError::InvalidArgTypes => "arg_types invalid",
            FfiError::NotALibrary(_) => "not a lib",
            FfiError::TypeMismatch { .. } => "type mismatch",
            FfiError::ResourceExhausted(_) => "no resources",
            FfiError::ArgLimitExceeded { .. } => "arg limit exceeded",
            FfiError::PrepareFailed(_) => "ffi_prep_cif failed",
            FfiError::LoadFailed { .. } => "dlopen failed",
            FfiError::SymbolNotFound { .. } => "get_sym failed",
            FfiError::ArgCountInvalid { .. } => "arg count invalid",
            FfiError::OutOfBounds { .. } => "out of bounds",
        }
    }

    pub fn to_fault(&self) -> Fault {
        Fault::new(self.reason())
    }

    pub fn into_value(self) -> Value {
        Value::Fault(self.to_fault())
    }
}

pub type FfiResult<T> = Result<T, FfiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reasons_match_host_faults() {
        assert_eq!(FfiError::InvalidHandle(30).reason(), "invalid ref");
        assert_eq!(FfiError::NotALibrary(25).reason(), "not a lib");
        let err = FfiError::LoadFailed {
            name: "/nonexistent.so".to_string(),
            reason: "no such file".to_string(),
        };
        assert_eq!(err.reason(), "dlopen failed");
        assert!(err.to_string().contains("/nonexistent.so"));
        let err = FfiError::SymbolNotFound {
            name: "does_not_exist".to_string(),
            reason: "undefined symbol".to_string(),
        };
        assert_eq!(err.to_fault().to_string(), "?get_sym failed");
    }

    #[test]
    fn test_error_display_messages() {
        let err = FfiError::ArgCountInvalid {
            expected: 2,
            actual: 3,
        };
        assert!(err.to_string().contains("expects 2 arguments, got 3"));

        let err = FfiError::TypeMismatch {
            type_name: "int32".to_string(),
            value_kind: "real",
        };
        assert!(err.to_string().contains("int32"));
        assert!(err.into_value().is_fault());
    }
}
