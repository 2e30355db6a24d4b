///
/// Basic Type Registry
///
/// The 24 libffi scalar types, exposed to nial as fixed integer codes. The
/// codes are stable: nial code is allowed to hard-wire them.
///
/// | code | name       | code | name               |
/// |------|------------|------|--------------------|
/// | 0    | void       | 12   | char               |
/// | 1    | uint8      | 13   | ushort             |
/// | 2    | int8       | 14   | short              |
/// | 3    | uint16     | 15   | uint               |
/// | 4    | int16      | 16   | int                |
/// | 5    | uint32     | 17   | ulong              |
/// | 6    | int32      | 18   | long               |
/// | 7    | uint64     | 19   | longdouble         |
/// | 8    | int64      | 20   | pointer            |
/// | 9    | float      | 21   | complex_float      |
/// | 10   | double     | 22   | complex_double     |
/// | 11   | uchar      | 23   | complex_longdouble |
///
/// Codes at or above `NUM_BASIC_TYPES` are handles into the handle table; the
/// only type descriptors living there are struct descriptors built by
/// `new_struct_type`.
///

use std::ffi::{c_int, c_long, c_short, c_uint, c_ulong, c_ushort};
use std::mem::size_of;

use libffi::low;
use libffi::middle::Type;
use libffi::raw;
use nial_std_core::Value;

use crate::error::{FfiError, FfiResult};
use crate::handle::{HandleTable, NativePayload, ResourceKind};

pub const NUM_BASIC_TYPES: usize = 24;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BasicType {
    Void = 0,
    UInt8 = 1,
    SInt8 = 2,
    UInt16 = 3,
    SInt16 = 4,
    UInt32 = 5,
    SInt32 = 6,
    UInt64 = 7,
    SInt64 = 8,
    Float = 9,
    Double = 10,
    UChar = 11,
    SChar = 12,
    UShort = 13,
    SShort = 14,
    UInt = 15,
    SInt = 16,
    ULong = 17,
    SLong = 18,
    LongDouble = 19,
    Pointer = 20,
    ComplexFloat = 21,
    ComplexDouble = 22,
    ComplexLongDouble = 23,
}

impl BasicType {
    pub const ALL: [BasicType; NUM_BASIC_TYPES] = [
        BasicType::Void,
        BasicType::UInt8,
        BasicType::SInt8,
        BasicType::UInt16,
        BasicType::SInt16,
        BasicType::UInt32,
        BasicType::SInt32,
        BasicType::UInt64,
        BasicType::SInt64,
        BasicType::Float,
        BasicType::Double,
        BasicType::UChar,
        BasicType::SChar,
        BasicType::UShort,
        BasicType::SShort,
        BasicType::UInt,
        BasicType::SInt,
        BasicType::ULong,
        BasicType::SLong,
        BasicType::LongDouble,
        BasicType::Pointer,
        BasicType::ComplexFloat,
        BasicType::ComplexDouble,
        BasicType::ComplexLongDouble,
    ];

    pub fn from_code(code: i64) -> Option<Self> {
        let index = usize::try_from(code).ok()?;
        Self::ALL.get(index).copied()
    }

    pub fn code(self) -> i64 {
        self as i64
    }

    pub fn name(self) -> &'static str {
        match self {
            BasicType::Void => "void",
            BasicType::UInt8 => "uint8",
            BasicType::SInt8 => "int8",
            BasicType::UInt16 => "uint16",
            BasicType::SInt16 => "int16",
            BasicType::UInt32 => "uint32",
            BasicType::SInt32 => "int32",
            BasicType::UInt64 => "uint64",
            BasicType::SInt64 => "int64",
            BasicType::Float => "float",
            BasicType::Double => "double",
            BasicType::UChar => "uchar",
            BasicType::SChar => "char",
            BasicType::UShort => "ushort",
            BasicType::SShort => "short",
            BasicType::UInt => "uint",
            BasicType::SInt => "int",
            BasicType::ULong => "ulong",
            BasicType::SLong => "long",
            BasicType::LongDouble => "longdouble",
            BasicType::Pointer => "pointer",
            BasicType::ComplexFloat => "complex_float",
            BasicType::ComplexDouble => "complex_double",
            BasicType::ComplexLongDouble => "complex_longdouble",
        }
    }

    /// The libffi descriptor for this type
    pub fn ffi_type(self) -> Type {
        match self {
            BasicType::Void => Type::void(),
            BasicType::UInt8 => Type::u8(),
            BasicType::SInt8 => Type::i8(),
            BasicType::UInt16 => Type::u16(),
            BasicType::SInt16 => Type::i16(),
            BasicType::UInt32 => Type::u32(),
            BasicType::SInt32 => Type::i32(),
            BasicType::UInt64 => Type::u64(),
            BasicType::SInt64 => Type::i64(),
            BasicType::Float => Type::f32(),
            BasicType::Double => Type::f64(),
            BasicType::UChar => Type::c_uchar(),
            BasicType::SChar => Type::c_schar(),
            BasicType::UShort => Type::c_ushort(),
            BasicType::SShort => Type::c_short(),
            BasicType::UInt => Type::c_uint(),
            BasicType::SInt => Type::c_int(),
            BasicType::ULong => Type::c_ulong(),
            BasicType::SLong => Type::c_long(),
            BasicType::LongDouble => Type::longdouble(),
            BasicType::Pointer => Type::pointer(),
            BasicType::ComplexFloat => Type::c32(),
            BasicType::ComplexDouble => Type::c64(),
            BasicType::ComplexLongDouble => Type::complex_longdouble(),
        }
    }

    /// Size in bytes of the native representation (0 for void)
    pub fn size(self) -> usize {
        if self == BasicType::Void {
            return 0;
        }
        let ty = self.ffi_type();
        unsafe { (*ty.as_raw_ptr()).size }
    }

    /// (size, signed) for the integer-valued types
    pub fn int_layout(self) -> Option<(usize, bool)> {
        match self {
            BasicType::UInt8 | BasicType::UChar => Some((1, false)),
            BasicType::SInt8 | BasicType::SChar => Some((1, true)),
            BasicType::UInt16 => Some((2, false)),
            BasicType::SInt16 => Some((2, true)),
            BasicType::UInt32 => Some((4, false)),
            BasicType::SInt32 => Some((4, true)),
            BasicType::UInt64 => Some((8, false)),
            BasicType::SInt64 => Some((8, true)),
            BasicType::UShort => Some((size_of::<c_ushort>(), false)),
            BasicType::SShort => Some((size_of::<c_short>(), true)),
            BasicType::UInt => Some((size_of::<c_uint>(), false)),
            BasicType::SInt => Some((size_of::<c_int>(), true)),
            BasicType::ULong => Some((size_of::<c_ulong>(), false)),
            BasicType::SLong => Some((size_of::<c_long>(), true)),
            _ => None,
        }
    }
}

/// An owned libffi struct descriptor.
///
/// The member layout is computed once at construction, so `size()` is valid
/// before the type is used in any call interface.
pub struct StructType {
    ty: Type,
    size: usize,
    alignment: usize,
}

// The descriptor is only touched while the handle table lock is held.
unsafe impl Send for StructType {}

impl StructType {
    pub fn new(members: Vec<Type>) -> FfiResult<Self> {
        if members.is_empty() {
            return Err(FfiError::ArgShapeInvalid(
                "a struct type needs at least one member".to_string(),
            ));
        }
        let ty = Type::structure(members);
        // Preparing a zero-argument cif that returns the struct lays it out.
        let mut cif: raw::ffi_cif = unsafe { std::mem::zeroed() };
        unsafe {
            low::prep_cif(
                &mut cif,
                raw::ffi_abi_FFI_DEFAULT_ABI,
                0,
                ty.as_raw_ptr(),
                std::ptr::null_mut(),
            )
        }
        .map_err(|e| FfiError::PrepareFailed(format!("struct layout: {:?}", e)))?;
        let (size, alignment) = unsafe {
            let raw = ty.as_raw_ptr();
            ((*raw).size, (*raw).alignment as usize)
        };
        Ok(Self {
            ty,
            size,
            alignment,
        })
    }

    pub fn ffi_type(&self) -> Type {
        self.ty.clone()
    }

    pub fn as_raw_ptr(&self) -> *mut raw::ffi_type {
        self.ty.as_raw_ptr()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn alignment(&self) -> usize {
        self.alignment
    }
}

/// Payload of a type-descriptor record
pub enum TypeDescriptor {
    /// One of the static libffi types; never freed
    Builtin(BasicType),
    /// A struct layout allocated by this bridge
    Owned(StructType),
}

impl TypeDescriptor {
    pub fn ffi_type(&self) -> Type {
        match self {
            TypeDescriptor::Builtin(basic) => basic.ffi_type(),
            TypeDescriptor::Owned(st) => st.ffi_type(),
        }
    }
}

/// How a value of some type is marshaled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeCode {
    Basic(BasicType),
    /// A struct passed by value, carried as opaque bytes
    Aggregate { handle: i64, size: usize },
}

impl TypeCode {
    pub fn name(&self) -> String {
        match self {
            TypeCode::Basic(basic) => basic.name().to_string(),
            TypeCode::Aggregate { handle, .. } => format!("struct {}", handle),
        }
    }

    pub fn size(&self) -> usize {
        match self {
            TypeCode::Basic(basic) => basic.size(),
            TypeCode::Aggregate { size, .. } => *size,
        }
    }

    /// The integer a call interface stores for this type
    pub fn handle_value(&self) -> i64 {
        match self {
            TypeCode::Basic(basic) => basic.code(),
            TypeCode::Aggregate { handle, .. } => *handle,
        }
    }
}

/// Resolve a nial type value (basic code or type handle) to its marshaling code.
///
/// Plain integers are accepted only for the basic codes; struct descriptors
/// must be presented as the handle returned by `new_struct_type`.
pub fn resolve_code(table: &HandleTable, value: &Value) -> FfiResult<TypeCode> {
    resolve(table, value, false).map(|(code, _)| code)
}

/// Like `resolve_code`, also returning a libffi descriptor for the type
pub fn resolve_type(table: &HandleTable, value: &Value) -> FfiResult<(TypeCode, Type)> {
    resolve(table, value, true).map(|(code, ty)| (code, ty.unwrap_or_else(Type::void)))
}

fn resolve(
    table: &HandleTable,
    value: &Value,
    want_type: bool,
) -> FfiResult<(TypeCode, Option<Type>)> {
    match value {
        Value::Int(n) => match BasicType::from_code(*n) {
            Some(basic) => Ok((TypeCode::Basic(basic), want_type.then(|| basic.ffi_type()))),
            None => Err(FfiError::InvalidType(format!(
                "{} is not a basic type code",
                n
            ))),
        },
        Value::Boxed(handle) => {
            let record = table
                .lookup(handle)
                .map_err(|_| FfiError::InvalidType(format!("stale handle {}", handle.value())))?;
            match record.payload() {
                NativePayload::TypeDescriptor(TypeDescriptor::Builtin(basic)) => {
                    Ok((TypeCode::Basic(*basic), want_type.then(|| basic.ffi_type())))
                }
                NativePayload::TypeDescriptor(TypeDescriptor::Owned(st)) => Ok((
                    TypeCode::Aggregate {
                        handle: handle.value(),
                        size: st.size(),
                    },
                    want_type.then(|| st.ffi_type()),
                )),
                _ => Err(FfiError::InvalidType(format!(
                    "handle {} is a {:?}, not a type",
                    handle.value(),
                    record.kind()
                ))),
            }
        }
        other => Err(FfiError::InvalidType(format!(
            "a {} is not a type",
            other.kind_name()
        ))),
    }
}

/// Build an owned struct descriptor from member type values and register it.
///
/// The member list is retained with the record so nested struct descriptors
/// stay alive for as long as this one does.
pub fn new_struct_type(table: &mut HandleTable, members: &Value) -> FfiResult<Value> {
    let items = members.items().ok_or_else(|| {
        FfiError::ArgShapeInvalid("struct members must be a list of types".to_string())
    })?;
    let mut member_types = Vec::with_capacity(items.len());
    for item in &items {
        let (code, ty) = resolve_type(table, item)?;
        if code == TypeCode::Basic(BasicType::Void) {
            return Err(FfiError::InvalidType(
                "void cannot be a struct member".to_string(),
            ));
        }
        member_types.push(ty);
    }
    let st = StructType::new(member_types)?;
    tracing::debug!(members = items.len(), size = st.size(), "built struct type");
    let handle = table.allocate(
        NativePayload::TypeDescriptor(TypeDescriptor::Owned(st)),
        Some(members.clone()),
        -1,
    )?;
    Ok(Value::Boxed(handle))
}

/// Name of a type handle, for diagnostics
pub fn lookup_name(table: &HandleTable, value: &Value) -> Option<String> {
    let code = resolve_code(table, value).ok()?;
    match code {
        TypeCode::Basic(basic) => Some(basic.name().to_string()),
        TypeCode::Aggregate { .. } => {
            let handle = value.as_boxed()?;
            table
                .get(handle, ResourceKind::TypeDescriptor)
                .ok()
                .map(|_| code.name())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HandleConfig;

    #[test]
    fn test_codes_are_stable() {
        for (i, basic) in BasicType::ALL.iter().enumerate() {
            assert_eq!(basic.code(), i as i64);
            assert_eq!(BasicType::from_code(i as i64), Some(*basic));
        }
        assert_eq!(BasicType::from_code(24), None);
        assert_eq!(BasicType::from_code(-1), None);
        assert_eq!(BasicType::SInt32.name(), "int32");
        assert_eq!(BasicType::SChar.name(), "char");
        assert_eq!(BasicType::ComplexLongDouble.code(), 23);
    }

    #[test]
    fn test_sizes() {
        assert_eq!(BasicType::Void.size(), 0);
        assert_eq!(BasicType::UInt8.size(), 1);
        assert_eq!(BasicType::SInt32.size(), 4);
        assert_eq!(BasicType::Double.size(), 8);
        assert_eq!(BasicType::Pointer.size(), size_of::<*const u8>());
        assert_eq!(BasicType::SLong.size(), size_of::<c_long>());
        assert_eq!(BasicType::ComplexDouble.size(), 16);
        assert!(BasicType::LongDouble.size() >= 8);
    }

    #[test]
    fn test_int_layout_matches_libffi() {
        for basic in BasicType::ALL {
            if let Some((size, _)) = basic.int_layout() {
                assert_eq!(size, basic.size(), "{}", basic.name());
            }
        }
        assert_eq!(BasicType::Float.int_layout(), None);
    }

    #[test]
    fn test_struct_layout() {
        let st = StructType::new(vec![Type::i8(), Type::i32(), Type::f64()]).unwrap();
        assert_eq!(st.size(), 16);
        assert_eq!(st.alignment(), 8);
        assert!(StructType::new(Vec::new()).is_err());
    }

    #[test]
    fn test_resolve_code() {
        let table = HandleTable::new(&HandleConfig::default());
        assert_eq!(
            resolve_code(&table, &Value::Int(6)).unwrap(),
            TypeCode::Basic(BasicType::SInt32)
        );
        let builtin = Value::Boxed(table.builtin_handle(BasicType::Double));
        assert_eq!(
            resolve_code(&table, &builtin).unwrap(),
            TypeCode::Basic(BasicType::Double)
        );
        assert!(matches!(
            resolve_code(&table, &Value::Int(24)),
            Err(FfiError::InvalidType(_))
        ));
        assert!(matches!(
            resolve_code(&table, &Value::Real(6.0)),
            Err(FfiError::InvalidType(_))
        ));
    }

    #[test]
    fn test_new_struct_type() {
        let mut table = HandleTable::new(&HandleConfig::default());
        let members = Value::ints(vec![BasicType::SInt32.code(), BasicType::Double.code()]);
        let st = new_struct_type(&mut table, &members).unwrap();
        match resolve_code(&table, &st).unwrap() {
            TypeCode::Aggregate { size, .. } => assert_eq!(size, 16),
            other => panic!("expected aggregate, got {:?}", other),
        }
        assert_eq!(lookup_name(&table, &Value::Int(10)).as_deref(), Some("double"));
        assert!(lookup_name(&table, &st).unwrap().starts_with("struct"));

        let bad = Value::ints(vec![BasicType::Void.code()]);
        assert!(matches!(
            new_struct_type(&mut table, &bad),
            Err(FfiError::InvalidType(_))
        ));
    }
}
