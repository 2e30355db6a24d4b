///
/// Call-Interface Builder
///
/// Turns a nial description of a signature (ABI selector, return type, list
/// of argument types) into a prepared libffi cif registered in the handle
/// table. The cif owns deep copies of its type descriptors and the argument
/// type codes resolved at build time, so later changes to the nial value the
/// signature was built from cannot desynchronize marshaling from the cif.
/// The record keeps a private list of the argument types as companion data,
/// so struct handles used in a signature cannot be freed out from under it.
///

use std::ffi::c_void;
use std::ptr;

use libffi::low::{self, CodePtr};
use libffi::middle::Type;
use libffi::raw::{self, ffi_cif, ffi_type};
use nial_std_core::Value;
use tracing::debug;

use crate::config::CallConfig;
use crate::error::{FfiError, FfiResult};
use crate::handle::{HandleTable, NativePayload, NativePtr};
use crate::types::{self, BasicType, TypeCode};

/// The only ABI selector value nial code needs; all selectors map to the platform default
pub const DEFAULT_ABI: i64 = 0;

pub struct PreparedCif {
    cif: Box<ffi_cif>,
    // `cif.arg_types` points into this array, which points into `arg_types`.
    _arg_ptrs: Box<[*mut ffi_type]>,
    arg_types: Vec<Type>,
    arg_codes: Vec<TypeCode>,
    _return_type: Type,
}

// Only used under the handle table lock.
unsafe impl Send for PreparedCif {}

impl PreparedCif {
    pub fn prepare(
        return_type: Type,
        arg_types: Vec<Type>,
        arg_codes: Vec<TypeCode>,
    ) -> FfiResult<Self> {
        debug_assert_eq!(arg_types.len(), arg_codes.len());
        let mut arg_ptrs: Box<[*mut ffi_type]> =
            arg_types.iter().map(Type::as_raw_ptr).collect();
        let atypes = if arg_ptrs.is_empty() {
            ptr::null_mut()
        } else {
            arg_ptrs.as_mut_ptr()
        };
        let mut cif: Box<ffi_cif> = Box::new(unsafe { std::mem::zeroed() });
        unsafe {
            low::prep_cif(
                &mut *cif,
                raw::ffi_abi_FFI_DEFAULT_ABI,
                arg_ptrs.len(),
                return_type.as_raw_ptr(),
                atypes,
            )
        }
        .map_err(|e| FfiError::PrepareFailed(format!("{:?}", e)))?;
        Ok(Self {
            cif,
            _arg_ptrs: arg_ptrs,
            arg_types,
            arg_codes,
            _return_type: return_type,
        })
    }

    pub fn arg_count(&self) -> usize {
        self.arg_types.len()
    }

    /// Argument type codes as resolved when the cif was built
    pub fn arg_codes(&self) -> &[TypeCode] {
        &self.arg_codes
    }

    /// Size of the return value as laid out by libffi
    pub fn return_size(&self) -> usize {
        unsafe { (*self.cif.rtype).size }
    }

    pub fn as_raw_ptr(&self) -> *mut ffi_cif {
        // ffi_call only reads the cif.
        &*self.cif as *const ffi_cif as *mut ffi_cif
    }

    /// Call `function` through this interface.
    ///
    /// # Safety
    ///
    /// `avalues` must hold one pointer per argument, each pointing at a value
    /// of the matching type, and `rvalue` must be writable for at least
    /// `max(return_size(), size_of::<ffi_arg>())` bytes, suitably aligned.
    pub unsafe fn invoke(
        &self,
        function: NativePtr,
        avalues: &mut [*mut c_void],
        rvalue: *mut c_void,
    ) {
        let code = CodePtr(function.as_ptr());
        let avalue = if avalues.is_empty() {
            ptr::null_mut()
        } else {
            avalues.as_mut_ptr()
        };
        unsafe { raw::ffi_call(self.as_raw_ptr(), Some(*code.as_fun()), rvalue, avalue) };
    }
}

/// Prepare a call interface and register it, returning its handle
pub fn build_cif(
    table: &mut HandleTable,
    config: &CallConfig,
    abi: i64,
    return_type: &Value,
    arg_types: &Value,
) -> FfiResult<Value> {
    if abi < 0 {
        return Err(FfiError::ArgShapeInvalid(format!(
            "ABI selector must be non-negative, got {}",
            abi
        )));
    }
    let items = arg_types.items().ok_or_else(|| {
        FfiError::ArgShapeInvalid("argument types must be a list".to_string())
    })?;
    if items.len() > config.max_args {
        return Err(FfiError::ArgLimitExceeded {
            count: items.len(),
            limit: config.max_args,
        });
    }

    let (return_code, return_ffi) = types::resolve_type(table, return_type)?;
    let mut ffi_args = Vec::with_capacity(items.len());
    let mut arg_codes = Vec::with_capacity(items.len());
    for item in &items {
        let (code, ty) = types::resolve_type(table, item)?;
        if code == TypeCode::Basic(BasicType::Void) {
            return Err(FfiError::InvalidType(
                "void is only valid as a return type".to_string(),
            ));
        }
        ffi_args.push(ty);
        arg_codes.push(code);
    }

    let cif = PreparedCif::prepare(return_ffi, ffi_args, arg_codes)?;
    debug!(
        abi,
        args = items.len(),
        rtype = %return_code.name(),
        "prepared call interface"
    );
    let handle = table.allocate(
        NativePayload::CallDescriptor(cif),
        Some(Value::list(items)),
        return_code.handle_value(),
    )?;
    Ok(Value::Boxed(handle))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HandleConfig;
    use crate::handle::ResourceKind;

    fn table() -> HandleTable {
        HandleTable::new(&HandleConfig::default())
    }

    #[test]
    fn test_build_cif_records_signature() {
        let mut table = table();
        let atypes = Value::ints(vec![6, 10]);
        let cif = build_cif(&mut table, &CallConfig::default(), 0, &Value::Int(10), &atypes)
            .unwrap();
        let handle = cif.as_boxed().unwrap();
        let record = table.get(handle, ResourceKind::CallDescriptor).unwrap();
        assert_eq!(record.aux_code(), 10);
        assert_eq!(record.companion().map(Value::tally), Some(2));
        let NativePayload::CallDescriptor(prepared) = record.payload() else {
            panic!("expected a call descriptor");
        };
        assert_eq!(prepared.arg_count(), 2);
        assert_eq!(prepared.return_size(), 8);
    }

    #[test]
    fn test_build_cif_no_args() {
        let mut table = table();
        let cif = build_cif(&mut table, &CallConfig::default(), 0, &Value::Int(0), &Value::Null);
        assert!(cif.is_ok());
    }

    #[test]
    fn test_arg_limit() {
        let mut table = table();
        let config = CallConfig { max_args: 2 };
        let err = build_cif(&mut table, &config, 0, &Value::Int(6), &Value::ints(vec![6, 6, 6]))
            .unwrap_err();
        assert!(matches!(err, FfiError::ArgLimitExceeded { count: 3, limit: 2 }));
        assert!(build_cif(&mut table, &config, 0, &Value::Int(6), &Value::ints(vec![6, 6])).is_ok());
    }

    #[test]
    fn test_invalid_types() {
        let mut table = table();
        let config = CallConfig::default();
        let err = build_cif(&mut table, &config, 0, &Value::Int(99), &Value::Null).unwrap_err();
        assert!(matches!(err, FfiError::InvalidType(_)));
        let err = build_cif(&mut table, &config, 0, &Value::Int(6), &Value::ints(vec![0]))
            .unwrap_err();
        assert!(matches!(err, FfiError::InvalidType(_)));
        let err = build_cif(&mut table, &config, -1, &Value::Int(6), &Value::Null).unwrap_err();
        assert!(matches!(err, FfiError::ArgShapeInvalid(_)));
        let err = build_cif(&mut table, &config, 0, &Value::Int(6), &Value::Int(6)).unwrap_err();
        assert!(matches!(err, FfiError::ArgShapeInvalid(_)));
        assert_eq!(table.occupied(), 0);
    }

    #[test]
    fn test_struct_signature_keeps_members_alive() {
        let mut table = table();
        let st = types::new_struct_type(&mut table, &Value::ints(vec![6, 6])).unwrap();
        let st_handle = st.as_boxed().unwrap().clone();
        let atypes = Value::list(vec![st.clone()]);
        let cif = build_cif(&mut table, &CallConfig::default(), 0, &st, &atypes).unwrap();
        drop(atypes);
        let record = table
            .get(cif.as_boxed().unwrap(), ResourceKind::CallDescriptor)
            .unwrap();
        assert_eq!(record.aux_code(), st_handle.value());
        // table + st + st_handle + companion list
        assert_eq!(st_handle.refcount(), 4);
    }

    #[test]
    fn test_argument_codes_are_fixed_at_build() {
        let mut table = table();
        let atypes = Value::ints(vec![6, 6]);
        let cif = build_cif(&mut table, &CallConfig::default(), 0, &Value::Int(6), &atypes)
            .unwrap();
        let Value::Ints(array) = &atypes else {
            unreachable!()
        };
        assert!(array.set(0, 10));

        let record = table
            .get(cif.as_boxed().unwrap(), ResourceKind::CallDescriptor)
            .unwrap();
        let NativePayload::CallDescriptor(prepared) = record.payload() else {
            panic!("expected a call descriptor");
        };
        let int32 = TypeCode::Basic(BasicType::SInt32);
        assert_eq!(prepared.arg_codes(), &[int32, int32]);
        let companion = record.companion().and_then(Value::items).unwrap();
        assert_eq!(companion[0].as_int(), Some(6));
    }
}
