///
/// nial Runtime Library
///
/// The table the nial evaluator consults to dispatch primitives by name.
/// Every primitive takes one nial value and returns one nial value; failures
/// are fault values.
///
/// Contains:
/// - The FFI primitives (nffi_initialise, nffi_call, nffi_free, etc.)
/// - `init_tracing` for runtime diagnostics on stderr
///

use std::sync::Once;

pub use nial_std_core::*;
pub use nial_std_ffi::{
    nffi_alloc_buffer, nffi_call, nffi_free, nffi_get_sym, nffi_initialise, nffi_load_lib,
    nffi_new_cif, nffi_new_struct_type, nffi_peek, nffi_poke,
};

pub type Primitive = fn(Value) -> Value;

pub const PRIMITIVES: &[(&str, Primitive)] = &[
    ("nffi_initialise", nffi_initialise),
    ("nffi_free", nffi_free),
    ("nffi_new_cif", nffi_new_cif),
    ("nffi_call", nffi_call),
    ("nffi_load_lib", nffi_load_lib),
    ("nffi_get_sym", nffi_get_sym),
    ("nffi_new_struct_type", nffi_new_struct_type),
    ("nffi_alloc_buffer", nffi_alloc_buffer),
    ("nffi_peek", nffi_peek),
    ("nffi_poke", nffi_poke),
];

pub fn lookup_primitive(name: &str) -> Option<Primitive> {
    PRIMITIVES
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, f)| *f)
}

/// Apply a primitive by name; unknown names give a `?unknown primitive` fault
pub fn apply_primitive(name: &str, arg: Value) -> Value {
    match lookup_primitive(name) {
        Some(f) => f(arg),
        None => {
            tracing::debug!(primitive = name, "unknown primitive");
            Value::fault("unknown primitive")
        }
    }
}

static TRACING: Once = Once::new();

/// Install the stderr log subscriber; later calls do nothing
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .try_init();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_primitive() {
        assert!(lookup_primitive("nffi_call").is_some());
        assert!(lookup_primitive("nffi_nothing").is_none());
        assert_eq!(PRIMITIVES.len(), 10);
    }

    #[test]
    fn test_apply_initialise() {
        init_tracing();
        init_tracing();
        let types = apply_primitive("nffi_initialise", Value::Null);
        assert_eq!(types.tally(), 24);
        let pointer = types.items().unwrap()[20].items().unwrap();
        assert_eq!(pointer[0].as_text(), Some("pointer"));
        assert_eq!(pointer[1].as_int(), Some(20));
    }

    #[test]
    fn test_unknown_primitive_is_a_fault() {
        let v = apply_primitive("nffi_bogus", Value::Null);
        assert!(v.as_fault().is_some_and(|f| f.is("unknown primitive")));
    }

    #[test]
    fn test_faults_pass_through() {
        let v = apply_primitive("nffi_free", Value::text("not a handle"));
        assert_eq!(v.as_fault().map(|f| f.reason()), Some("args"));
    }
}
