///
/// Value Marshaler
///
/// Converts nial values into native argument storage and native bytes back
/// into nial values. Both directions cover every basic type code plus struct
/// types, which travel as opaque byte buffers.
///
/// Conversion is strict: a value of the wrong kind is a `TypeMismatch`, never
/// a silent reinterpretation. Integers are the one exception, where C cast
/// semantics apply and out-of-range values are truncated to the native width.
///
/// Text passed as a pointer is copied into a NUL-terminated buffer that lives
/// for the duration of the call, so native writes through it are not seen by
/// nial. Output character buffers must come from `alloc_buffer` and be read
/// back with `peek`. Numeric arrays are passed by address and do see writes.
///

use std::ffi::{CString, c_void};
use std::mem::size_of;
use std::ptr;

use libffi::raw::ffi_arg;
use nial_std_core::Value;

use crate::error::{FfiError, FfiResult};
use crate::handle::{HandleTable, NativePayload, NativePtr, RawBuffer, ResourceKind};
use crate::longdouble;
use crate::types::{BasicType, TypeCode};

/// Bytes reserved per scalar argument
pub const SLOT_SIZE: usize = 32;

/// Aligned scratch storage for one argument
#[derive(Clone, Copy)]
#[repr(C, align(16))]
pub struct ArgSlot([u8; SLOT_SIZE]);

impl ArgSlot {
    pub fn zeroed() -> Self {
        Self([0; SLOT_SIZE])
    }

    fn as_mut_ptr(&mut self) -> *mut u8 {
        self.0.as_mut_ptr()
    }

    fn put<T: Copy>(&mut self, offset: usize, value: T) {
        debug_assert!(offset + size_of::<T>() <= SLOT_SIZE);
        unsafe { ptr::write_unaligned(self.as_mut_ptr().add(offset) as *mut T, value) };
    }

    fn put_bytes(&mut self, offset: usize, bytes: &[u8]) {
        self.0[offset..offset + bytes.len()].copy_from_slice(bytes);
    }
}

/// A converted argument value
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NativeScalar {
    /// Any integer type; the low `size` bytes are significant
    Integer { value: i64, size: usize },
    Float(f32),
    Double(f64),
    LongDouble(f64),
    Pointer(NativePtr),
    ComplexFloat(f32, f32),
    ComplexDouble(f64, f64),
    ComplexLongDouble(f64, f64),
    /// A struct passed by value, read from `size` bytes at `ptr`
    Aggregate { ptr: NativePtr, size: usize },
}

/// An argument ready to be passed, with any storage it borrows
#[derive(Debug)]
pub struct NativeArg {
    scalar: NativeScalar,
    // Backing store for a text argument passed as a pointer.
    _text: Option<CString>,
}

impl NativeArg {
    fn new(scalar: NativeScalar) -> Self {
        Self {
            scalar,
            _text: None,
        }
    }

    pub fn scalar(&self) -> NativeScalar {
        self.scalar
    }

    /// Store the value in `slot` and return the address libffi should read it from
    pub fn write(&self, slot: &mut ArgSlot) -> *mut c_void {
        let ld_size = BasicType::LongDouble.size();
        match self.scalar {
            NativeScalar::Integer { value, size } => match size {
                1 => slot.put(0, value as u8),
                2 => slot.put(0, value as u16),
                4 => slot.put(0, value as u32),
                _ => slot.put(0, value as u64),
            },
            NativeScalar::Float(v) => slot.put(0, v),
            NativeScalar::Double(v) => slot.put(0, v),
            NativeScalar::LongDouble(v) => slot.put_bytes(0, &longdouble::encode(v)[..ld_size]),
            NativeScalar::Pointer(p) => slot.put(0, p.as_ptr()),
            NativeScalar::ComplexFloat(re, im) => {
                slot.put(0, re);
                slot.put(size_of::<f32>(), im);
            }
            NativeScalar::ComplexDouble(re, im) => {
                slot.put(0, re);
                slot.put(size_of::<f64>(), im);
            }
            NativeScalar::ComplexLongDouble(re, im) => {
                slot.put_bytes(0, &longdouble::encode(re)[..ld_size]);
                slot.put_bytes(ld_size, &longdouble::encode(im)[..ld_size]);
            }
            NativeScalar::Aggregate { ptr, .. } => return ptr.as_ptr(),
        }
        slot.as_mut_ptr() as *mut c_void
    }
}

fn integer_of(value: &Value) -> Option<i64> {
    match value {
        Value::Int(n) => Some(*n),
        Value::Boxed(b) => Some(b.value()),
        Value::Bool(b) => Some(*b as i64),
        _ => None,
    }
}

fn complex_of(value: &Value) -> Option<(f64, f64)> {
    match value {
        Value::Reals(a) if a.len() == 2 => Some((a.get(0)?, a.get(1)?)),
        _ => None,
    }
}

/// Convert `value` for a native parameter of type `code`
pub fn to_native(table: &HandleTable, value: &Value, code: TypeCode) -> FfiResult<NativeArg> {
    let mismatch = || FfiError::TypeMismatch {
        type_name: code.name(),
        value_kind: value.kind_name(),
    };

    let basic = match code {
        TypeCode::Basic(basic) => basic,
        TypeCode::Aggregate { size, .. } => {
            let handle = value.as_boxed().ok_or_else(mismatch)?;
            let record = table
                .get(handle, ResourceKind::RawPointer)
                .map_err(|_| mismatch())?;
            let NativePayload::RawPointer(buffer) = record.payload() else {
                return Err(mismatch());
            };
            buffer.check_range(0, size)?;
            return Ok(NativeArg::new(NativeScalar::Aggregate {
                ptr: buffer.ptr(),
                size,
            }));
        }
    };

    if let Some((size, _)) = basic.int_layout() {
        if basic != BasicType::UChar && basic != BasicType::SChar {
            let n = integer_of(value).ok_or_else(mismatch)?;
            return Ok(NativeArg::new(NativeScalar::Integer { value: n, size }));
        }
    }

    let scalar = match basic {
        BasicType::Void => return Err(mismatch()),
        BasicType::UChar | BasicType::SChar => match value {
            Value::Char(c) => NativeScalar::Integer {
                value: *c as i64,
                size: 1,
            },
            _ => return Err(mismatch()),
        },
        BasicType::Float => NativeScalar::Float(value.as_real().ok_or_else(mismatch)? as f32),
        BasicType::Double => NativeScalar::Double(value.as_real().ok_or_else(mismatch)?),
        BasicType::LongDouble => NativeScalar::LongDouble(value.as_real().ok_or_else(mismatch)?),
        BasicType::ComplexFloat => {
            let (re, im) = complex_of(value).ok_or_else(mismatch)?;
            NativeScalar::ComplexFloat(re as f32, im as f32)
        }
        BasicType::ComplexDouble => {
            let (re, im) = complex_of(value).ok_or_else(mismatch)?;
            NativeScalar::ComplexDouble(re, im)
        }
        BasicType::ComplexLongDouble => {
            let (re, im) = complex_of(value).ok_or_else(mismatch)?;
            NativeScalar::ComplexLongDouble(re, im)
        }
        BasicType::Pointer => return pointer_arg(table, value).ok_or_else(mismatch),
        _ => return Err(mismatch()),
    };
    Ok(NativeArg::new(scalar))
}

fn pointer_arg(table: &HandleTable, value: &Value) -> Option<NativeArg> {
    let ptr = match value {
        Value::Text(s) => {
            let text = CString::new(s.as_bytes()).ok()?;
            let ptr = NativePtr::new(text.as_ptr() as *mut c_void);
            return Some(NativeArg {
                scalar: NativeScalar::Pointer(ptr),
                _text: Some(text),
            });
        }
        Value::Ints(a) => NativePtr::new(a.as_mut_ptr() as *mut c_void),
        Value::Reals(a) => NativePtr::new(a.as_mut_ptr() as *mut c_void),
        Value::Boxed(handle) => {
            let record = table.lookup(handle).ok()?;
            // Built-in type handles name types, not memory.
            if record.kind() == ResourceKind::BuiltinType {
                return None;
            }
            record.payload().native_ptr()
        }
        Value::Int(0) => NativePtr::null(),
        _ => return None,
    };
    Some(NativeArg::new(NativeScalar::Pointer(ptr)))
}

/// Where the bytes being decoded came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// Plain memory, laid out exactly as the type
    Memory,
    /// A libffi return buffer, where small integers are widened to `ffi_arg`
    Return,
}

fn read<T: Copy>(bytes: &[u8], offset: usize) -> FfiResult<T> {
    let size = size_of::<T>();
    if bytes.len() < offset + size {
        return Err(FfiError::OutOfBounds {
            offset,
            size,
            len: bytes.len(),
        });
    }
    Ok(unsafe { ptr::read_unaligned(bytes.as_ptr().add(offset) as *const T) })
}

fn read_integer(bytes: &[u8], size: usize, signed: bool, source: Source) -> FfiResult<i64> {
    if source == Source::Return && size < size_of::<ffi_arg>() {
        let raw = read::<ffi_arg>(bytes, 0)? as u64;
        let bits = size * 8;
        let low = raw & ((1u64 << bits) - 1);
        return Ok(if signed {
            ((low << (64 - bits)) as i64) >> (64 - bits)
        } else {
            low as i64
        });
    }
    Ok(match (size, signed) {
        (1, true) => read::<i8>(bytes, 0)? as i64,
        (1, false) => read::<u8>(bytes, 0)? as i64,
        (2, true) => read::<i16>(bytes, 0)? as i64,
        (2, false) => read::<u16>(bytes, 0)? as i64,
        (4, true) => read::<i32>(bytes, 0)? as i64,
        (4, false) => read::<u32>(bytes, 0)? as i64,
        (_, true) => read::<i64>(bytes, 0)?,
        (_, false) => read::<u64>(bytes, 0)? as i64,
    })
}

fn read_long_double(bytes: &[u8], offset: usize) -> FfiResult<f64> {
    let size = BasicType::LongDouble.size();
    let end = offset + size;
    if bytes.len() < end {
        return Err(FfiError::OutOfBounds {
            offset,
            size,
            len: bytes.len(),
        });
    }
    Ok(longdouble::decode(&bytes[offset..end]))
}

/// Decode native bytes of type `code` into a nial value.
///
/// Pointers come back as borrowed handles (or `0` for null) and structs as an
/// owned copy in a fresh buffer handle, so both register with `table`.
pub fn from_native(
    table: &mut HandleTable,
    bytes: &[u8],
    code: TypeCode,
    source: Source,
) -> FfiResult<Value> {
    let basic = match code {
        TypeCode::Basic(basic) => basic,
        TypeCode::Aggregate { handle, size } => {
            if bytes.len() < size {
                return Err(FfiError::OutOfBounds {
                    offset: 0,
                    size,
                    len: bytes.len(),
                });
            }
            let buffer = RawBuffer::copy_from(&bytes[..size])?;
            let handle = table.allocate(NativePayload::RawPointer(buffer), None, handle)?;
            return Ok(Value::Boxed(handle));
        }
    };

    if let Some((size, signed)) = basic.int_layout() {
        let n = read_integer(bytes, size, signed, source)?;
        return Ok(match basic {
            BasicType::UChar | BasicType::SChar => Value::Char(n as u8),
            _ => Value::Int(n),
        });
    }

    Ok(match basic {
        BasicType::Void => Value::Null,
        BasicType::Float => Value::Real(read::<f32>(bytes, 0)? as f64),
        BasicType::Double => Value::Real(read::<f64>(bytes, 0)?),
        BasicType::LongDouble => Value::Real(read_long_double(bytes, 0)?),
        BasicType::ComplexFloat => Value::reals(vec![
            read::<f32>(bytes, 0)? as f64,
            read::<f32>(bytes, size_of::<f32>())? as f64,
        ]),
        BasicType::ComplexDouble => Value::reals(vec![
            read::<f64>(bytes, 0)?,
            read::<f64>(bytes, size_of::<f64>())?,
        ]),
        BasicType::ComplexLongDouble => {
            let ld_size = BasicType::LongDouble.size();
            Value::reals(vec![
                read_long_double(bytes, 0)?,
                read_long_double(bytes, ld_size)?,
            ])
        }
        BasicType::Pointer => {
            let ptr = NativePtr::new(read::<*mut c_void>(bytes, 0)?);
            if ptr.is_null() {
                Value::Int(0)
            } else {
                let handle = table.allocate(
                    NativePayload::RawPointer(RawBuffer::borrowed(ptr)),
                    None,
                    BasicType::Pointer.code(),
                )?;
                Value::Boxed(handle)
            }
        }
        // Integer types were handled above.
        _ => Value::Int(read_integer(bytes, basic.size(), true, source)?),
    })
}
