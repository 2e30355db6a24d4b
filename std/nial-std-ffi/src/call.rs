///
/// Call Dispatcher
///
/// Invokes a resolved function through a prepared cif. Every argument is
/// converted before the native call is made, so a bad argument never leaves
/// a half-performed call behind.
///

use std::ffi::c_void;

use nial_std_core::Value;
use smallvec::SmallVec;
use tracing::trace;

use crate::error::{FfiError, FfiResult};
use crate::handle::{HandleTable, NativePayload, ResourceKind};
use crate::marshal::{self, ArgSlot, NativeArg, SLOT_SIZE, Source};
use crate::types::{BasicType, TypeCode};

/// 16-byte aligned storage for a return value
struct ReturnBuffer {
    words: Vec<u128>,
}

impl ReturnBuffer {
    fn new(size: usize) -> Self {
        let words = size.max(SLOT_SIZE).div_ceil(16);
        Self {
            words: vec![0; words],
        }
    }

    fn as_mut_ptr(&mut self) -> *mut c_void {
        self.words.as_mut_ptr() as *mut c_void
    }

    fn as_bytes(&self) -> &[u8] {
        unsafe {
            std::slice::from_raw_parts(self.words.as_ptr() as *const u8, self.words.len() * 16)
        }
    }
}

/// Call `function` through `cif` with the items of `args`
pub fn call(table: &mut HandleTable, cif: &Value, function: &Value, args: &Value) -> FfiResult<Value> {
    let (cif_handle, fn_handle) = match (cif.as_boxed(), function.as_boxed()) {
        (Some(c), Some(f)) => (c, f),
        _ => return Err(FfiError::InvalidArgTypes),
    };

    let (return_code, ret) = {
        let cif_record = table
            .get(cif_handle, ResourceKind::CallDescriptor)
            .map_err(|_| FfiError::InvalidArgTypes)?;
        let fn_record = table
            .get(fn_handle, ResourceKind::Function)
            .map_err(|_| FfiError::InvalidArgTypes)?;
        let (NativePayload::CallDescriptor(prepared), NativePayload::Function(code)) =
            (cif_record.payload(), fn_record.payload())
        else {
            return Err(FfiError::InvalidArgTypes);
        };

        let arg_codes = prepared.arg_codes();
        let values = args.items().ok_or_else(|| {
            FfiError::ArgShapeInvalid("call arguments must be a list".to_string())
        })?;
        if values.len() != arg_codes.len() {
            return Err(FfiError::ArgCountInvalid {
                expected: arg_codes.len(),
                actual: values.len(),
            });
        }

        let mut native: SmallVec<[NativeArg; 8]> = SmallVec::with_capacity(values.len());
        for (value, code) in values.iter().zip(arg_codes) {
            native.push(marshal::to_native(table, value, *code)?);
        }

        let aux = cif_record.aux_code();
        let return_code = match BasicType::from_code(aux) {
            Some(basic) => TypeCode::Basic(basic),
            None => TypeCode::Aggregate {
                handle: aux,
                size: prepared.return_size(),
            },
        };

        let mut slots: SmallVec<[ArgSlot; 8]> = SmallVec::from_elem(ArgSlot::zeroed(), native.len());
        let mut avalues: SmallVec<[*mut c_void; 8]> = native
            .iter()
            .zip(slots.iter_mut())
            .map(|(arg, slot)| arg.write(slot))
            .collect();
        let mut ret = ReturnBuffer::new(prepared.return_size());

        trace!(
            cif = cif_handle.value(),
            function = fn_handle.value(),
            args = native.len(),
            "calling native function"
        );
        unsafe { prepared.invoke(*code, &mut avalues, ret.as_mut_ptr()) };
        (return_code, ret)
    };

    marshal::from_native(table, ret.as_bytes(), return_code, Source::Return)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cif;
    use crate::config::{CallConfig, HandleConfig};
    use crate::types;
    use crate::handle::NativePtr;

    extern "C" fn add_i32(a: i32, b: i32) -> i32 {
        a.wrapping_add(b)
    }

    extern "C" fn scale(x: f64, by: f32) -> f64 {
        x * by as f64
    }

    extern "C" fn negate_byte(b: i8) -> i8 {
        -b
    }

    #[repr(C)]
    struct Pair {
        a: i32,
        b: i32,
    }

    extern "C" fn swap_pair(p: Pair) -> Pair {
        Pair { a: p.b, b: p.a }
    }

    fn function(table: &mut HandleTable, addr: *mut c_void) -> Value {
        Value::Boxed(
            table
                .allocate(NativePayload::Function(NativePtr::new(addr)), None, -1)
                .unwrap(),
        )
    }

    fn signature(table: &mut HandleTable, rtype: Value, atypes: Value) -> Value {
        cif::build_cif(table, &CallConfig::default(), 0, &rtype, &atypes).unwrap()
    }

    #[test]
    fn test_call_integer_function() {
        let mut table = HandleTable::new(&HandleConfig::default());
        let cif = signature(&mut table, Value::Int(6), Value::ints(vec![6, 6]));
        let f = function(&mut table, add_i32 as *mut c_void);
        let result = call(&mut table, &cif, &f, &Value::ints(vec![40, 2])).unwrap();
        assert_eq!(result.as_int(), Some(42));
    }

    #[test]
    fn test_call_mixed_floats() {
        let mut table = HandleTable::new(&HandleConfig::default());
        let cif = signature(&mut table, Value::Int(10), Value::ints(vec![10, 9]));
        let f = function(&mut table, scale as *mut c_void);
        let args = Value::list(vec![Value::Real(1.5), Value::Real(4.0)]);
        let result = call(&mut table, &cif, &f, &args).unwrap();
        assert_eq!(result.as_real(), Some(6.0));
    }

    #[test]
    fn test_small_signed_return() {
        let mut table = HandleTable::new(&HandleConfig::default());
        let cif = signature(&mut table, Value::Int(2), Value::ints(vec![2]));
        let f = function(&mut table, negate_byte as *mut c_void);
        let result = call(&mut table, &cif, &f, &Value::ints(vec![5])).unwrap();
        assert_eq!(result.as_int(), Some(-5));
    }

    #[test]
    fn test_struct_by_value() {
        let mut table = HandleTable::new(&HandleConfig::default());
        let pair = types::new_struct_type(&mut table, &Value::ints(vec![6, 6])).unwrap();
        let cif = signature(&mut table, pair.clone(), Value::list(vec![pair.clone()]));
        let f = function(&mut table, swap_pair as *mut c_void);

        let input = Pair { a: 1, b: 2 };
        let bytes = unsafe {
            std::slice::from_raw_parts(&input as *const Pair as *const u8, std::mem::size_of::<Pair>())
        };
        let code = types::resolve_code(&table, &pair).unwrap();
        let arg = marshal::from_native(&mut table, bytes, code, Source::Memory).unwrap();

        let result = call(&mut table, &cif, &f, &Value::list(vec![arg])).unwrap();
        let handle = result.as_boxed().unwrap();
        let record = table.get(handle, ResourceKind::RawPointer).unwrap();
        let out = unsafe { &*(record.payload().native_ptr().as_ptr() as *const Pair) };
        assert_eq!((out.a, out.b), (2, 1));
    }

    #[test]
    fn test_signature_ignores_later_changes_to_its_types() {
        let mut table = HandleTable::new(&HandleConfig::default());
        let atypes = Value::ints(vec![6, 6]);
        let cif = signature(&mut table, Value::Int(6), atypes.clone());
        let f = function(&mut table, add_i32 as *mut c_void);
        let Value::Ints(array) = &atypes else {
            unreachable!()
        };
        array.set(0, 10);
        array.set(1, 10);

        let result = call(&mut table, &cif, &f, &Value::ints(vec![40, 2])).unwrap();
        assert_eq!(result.as_int(), Some(42));
        let args = Value::list(vec![Value::Real(40.0), Value::Real(2.0)]);
        let err = call(&mut table, &cif, &f, &args).unwrap_err();
        assert!(matches!(err, FfiError::TypeMismatch { .. }));
    }

    extern "C" fn store_pair(out: *mut i64, a: i32, b: i32) {
        unsafe {
            *out = a as i64;
            *out.add(1) = b as i64;
        }
    }

    #[test]
    fn test_late_mismatch_skips_the_call() {
        let mut table = HandleTable::new(&HandleConfig::default());
        let ptr = BasicType::Pointer.code();
        let cif = signature(&mut table, Value::Int(0), Value::ints(vec![ptr, 6, 6]));
        let f = function(&mut table, store_pair as *mut c_void);
        let out = Value::ints(vec![-1, -1]);
        let Value::Ints(array) = &out else {
            unreachable!()
        };

        let args = Value::list(vec![out.clone(), Value::Int(1), Value::text("x")]);
        let err = call(&mut table, &cif, &f, &args).unwrap_err();
        assert!(matches!(err, FfiError::TypeMismatch { .. }));
        assert_eq!(array.to_vec(), vec![-1, -1]);

        let args = Value::list(vec![out.clone(), Value::Int(1), Value::Int(2)]);
        let result = call(&mut table, &cif, &f, &args).unwrap();
        assert!(matches!(result, Value::Null));
        assert_eq!(array.to_vec(), vec![1, 2]);
    }

    #[test]
    fn test_call_checks_handles_and_counts() {
        let mut table = HandleTable::new(&HandleConfig::default());
        let cif = signature(&mut table, Value::Int(6), Value::ints(vec![6, 6]));
        let f = function(&mut table, add_i32 as *mut c_void);

        let err = call(&mut table, &f, &cif, &Value::ints(vec![1, 2])).unwrap_err();
        assert!(matches!(err, FfiError::InvalidArgTypes));
        let err = call(&mut table, &Value::Int(24), &f, &Value::ints(vec![1, 2])).unwrap_err();
        assert!(matches!(err, FfiError::InvalidArgTypes));

        let err = call(&mut table, &cif, &f, &Value::ints(vec![1])).unwrap_err();
        assert!(matches!(
            err,
            FfiError::ArgCountInvalid {
                expected: 2,
                actual: 1
            }
        ));

        let args = Value::list(vec![Value::Int(1), Value::Real(2.0)]);
        let err = call(&mut table, &cif, &f, &args).unwrap_err();
        assert!(matches!(err, FfiError::TypeMismatch { .. }));
    }
}
