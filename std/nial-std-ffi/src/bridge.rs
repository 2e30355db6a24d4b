///
/// Host boundary
///
/// `Bridge` bundles the configuration with the handle table and exposes the
/// operations nial primitives call. Each takes a single nial value (the
/// primitive's argument, usually a list) and returns a single nial value.
/// Every failure comes back as a fault; nothing here panics on bad input.
///
/// The process-wide instance lives behind a mutex and is reached through
/// the `nffi_*` functions. Tests build private instances.
///

use std::sync::{LazyLock, Mutex, PoisonError};

use nial_std_core::Value;

use crate::call;
use crate::cif;
use crate::config::FfiConfig;
use crate::error::{FfiError, FfiResult};
use crate::handle::{HandleTable, NativePayload, RawBuffer, Release, ResourceKind};
use crate::library;
use crate::marshal::{self, ArgSlot, Source};
use crate::types::{self, BasicType};

pub struct Bridge {
    config: FfiConfig,
    table: HandleTable,
}

impl Default for Bridge {
    fn default() -> Self {
        Self::new(FfiConfig::default())
    }
}

fn arity<const N: usize>(arg: &Value, what: &str) -> FfiResult<[Value; N]> {
    let items = arg.items().unwrap_or_default();
    <[Value; N]>::try_from(items).map_err(|items| {
        FfiError::ArgShapeInvalid(format!(
            "{} expects {} arguments, got {}",
            what,
            N,
            items.len()
        ))
    })
}

fn int_arg(value: &Value, what: &str) -> FfiResult<i64> {
    value
        .as_int()
        .ok_or_else(|| FfiError::ArgShapeInvalid(format!("{} must be an integer", what)))
}

fn offset_arg(value: &Value) -> FfiResult<usize> {
    let n = int_arg(value, "offset")?;
    usize::try_from(n).map_err(|_| FfiError::ArgShapeInvalid(format!("negative offset {}", n)))
}

fn text_arg<'a>(value: &'a Value, what: &str) -> FfiResult<&'a str> {
    value
        .as_text()
        .ok_or_else(|| FfiError::ArgShapeInvalid(format!("{} must be text", what)))
}

fn respond(result: FfiResult<Value>) -> Value {
    result.unwrap_or_else(FfiError::into_value)
}

impl Bridge {
    pub fn new(config: FfiConfig) -> Self {
        let table = HandleTable::new(&config.handles);
        Self { config, table }
    }

    pub fn config(&self) -> &FfiConfig {
        &self.config
    }

    pub fn table(&self) -> &HandleTable {
        &self.table
    }

    /// `[[name, handle], ...]` for the basic types, in code order
    pub fn initialize(&mut self, _arg: Value) -> Value {
        let pairs = BasicType::ALL
            .iter()
            .map(|basic| {
                Value::pair(
                    Value::text(basic.name()),
                    Value::Boxed(self.table.builtin_handle(*basic)),
                )
            })
            .collect();
        Value::list(pairs)
    }

    /// `true` if the resource was released, `false` if nial still references it
    pub fn free_handle(&mut self, arg: Value) -> Value {
        respond(self.try_free_handle(arg))
    }

    fn try_free_handle(&mut self, arg: Value) -> FfiResult<Value> {
        let handle = match &arg {
            Value::Boxed(handle) => handle,
            Value::Int(n) => return Err(FfiError::InvalidHandle(*n)),
            _ => {
                return Err(FfiError::ArgShapeInvalid(
                    "free expects a handle".to_string(),
                ));
            }
        };
        let released = self.table.release(handle)?;
        Ok(Value::Bool(released == Release::Released))
    }

    /// `[abi, rtype, atypes]` -> call interface handle
    pub fn new_cif(&mut self, arg: Value) -> Value {
        respond(self.try_new_cif(&arg))
    }

    fn try_new_cif(&mut self, arg: &Value) -> FfiResult<Value> {
        let [abi, rtype, atypes] = arity::<3>(arg, "new_cif")?;
        let abi = int_arg(&abi, "abi")?;
        cif::build_cif(&mut self.table, &self.config.calls, abi, &rtype, &atypes)
    }

    /// `[cif, fn, args]` -> return value
    pub fn call(&mut self, arg: Value) -> Value {
        respond(self.try_call(&arg))
    }

    fn try_call(&mut self, arg: &Value) -> FfiResult<Value> {
        let [cif, function, args] = arity::<3>(arg, "call")?;
        call::call(&mut self.table, &cif, &function, &args)
    }

    /// library name -> library handle
    pub fn load_library(&mut self, arg: Value) -> Value {
        respond(self.try_load_library(&arg))
    }

    fn try_load_library(&mut self, arg: &Value) -> FfiResult<Value> {
        let name = text_arg(arg, "library name")?;
        library::load_library(&mut self.table, &self.config.library, name)
    }

    /// `[lib, name]` -> function handle
    pub fn get_symbol(&mut self, arg: Value) -> Value {
        respond(self.try_get_symbol(&arg))
    }

    fn try_get_symbol(&mut self, arg: &Value) -> FfiResult<Value> {
        let [lib, name] = arity::<2>(arg, "get_sym")?;
        let name = text_arg(&name, "symbol name")?;
        library::resolve_symbol(&mut self.table, &lib, name)
    }

    /// member types -> struct type handle
    pub fn new_struct_type(&mut self, arg: Value) -> Value {
        respond(types::new_struct_type(&mut self.table, &arg))
    }

    /// size in bytes -> zeroed buffer handle
    pub fn alloc_buffer(&mut self, arg: Value) -> Value {
        respond(self.try_alloc_buffer(&arg))
    }

    fn try_alloc_buffer(&mut self, arg: &Value) -> FfiResult<Value> {
        let size = int_arg(arg, "buffer size")?;
        let size = usize::try_from(size)
            .ok()
            .filter(|n| *n > 0)
            .ok_or_else(|| FfiError::ArgShapeInvalid(format!("bad buffer size {}", size)))?;
        let buffer = RawBuffer::allocate(size)?;
        let handle = self.table.allocate(NativePayload::RawPointer(buffer), None, -1)?;
        Ok(Value::Boxed(handle))
    }

    /// `[buffer, type, offset]` -> value read from the buffer
    pub fn peek(&mut self, arg: Value) -> Value {
        respond(self.try_peek(&arg))
    }

    fn try_peek(&mut self, arg: &Value) -> FfiResult<Value> {
        let [buffer, ty, offset] = arity::<3>(arg, "peek")?;
        let offset = offset_arg(&offset)?;
        let code = types::resolve_code(&self.table, &ty)?;
        let size = code.size();
        let bytes = {
            let ptr = self.buffer_ptr(&buffer, offset, size)?;
            unsafe { std::slice::from_raw_parts(ptr as *const u8, size) }.to_vec()
        };
        marshal::from_native(&mut self.table, &bytes, code, Source::Memory)
    }

    /// `[buffer, type, offset, value]` -> `true`
    pub fn poke(&mut self, arg: Value) -> Value {
        respond(self.try_poke(&arg))
    }

    fn try_poke(&mut self, arg: &Value) -> FfiResult<Value> {
        let [buffer, ty, offset, value] = arity::<4>(arg, "poke")?;
        let offset = offset_arg(&offset)?;
        let code = types::resolve_code(&self.table, &ty)?;
        let size = code.size();
        let native = marshal::to_native(&self.table, &value, code)?;
        let dst = self.buffer_ptr(&buffer, offset, size)?;
        let mut slot = ArgSlot::zeroed();
        let src = native.write(&mut slot);
        unsafe { std::ptr::copy(src as *const u8, dst, size) };
        Ok(Value::Bool(true))
    }

    /// Address of `size` bytes at `offset` inside a buffer handle
    fn buffer_ptr(&self, buffer: &Value, offset: usize, size: usize) -> FfiResult<*mut u8> {
        let handle = buffer.as_boxed().ok_or_else(|| {
            FfiError::ArgShapeInvalid("expected a buffer handle".to_string())
        })?;
        let record = self.table.get(handle, ResourceKind::RawPointer)?;
        let NativePayload::RawPointer(raw) = record.payload() else {
            return Err(FfiError::InvalidHandle(handle.value()));
        };
        raw.check_range(offset, size)?;
        if raw.ptr().is_null() {
            return Err(FfiError::InvalidHandle(handle.value()));
        }
        Ok(unsafe { (raw.ptr().as_ptr() as *mut u8).add(offset) })
    }
}

static BRIDGE: LazyLock<Mutex<Bridge>> =
    LazyLock::new(|| Mutex::new(Bridge::new(FfiConfig::from_env())));

/// Run `f` against the process-wide bridge
pub fn with_bridge<R>(f: impl FnOnce(&mut Bridge) -> R) -> R {
    let mut bridge = BRIDGE.lock().unwrap_or_else(PoisonError::into_inner);
    f(&mut bridge)
}

pub fn nffi_initialise(arg: Value) -> Value {
    with_bridge(|b| b.initialize(arg))
}

pub fn nffi_free(arg: Value) -> Value {
    with_bridge(|b| b.free_handle(arg))
}

pub fn nffi_new_cif(arg: Value) -> Value {
    with_bridge(|b| b.new_cif(arg))
}

pub fn nffi_call(arg: Value) -> Value {
    with_bridge(|b| b.call(arg))
}

pub fn nffi_load_lib(arg: Value) -> Value {
    with_bridge(|b| b.load_library(arg))
}

pub fn nffi_get_sym(arg: Value) -> Value {
    with_bridge(|b| b.get_symbol(arg))
}

pub fn nffi_new_struct_type(arg: Value) -> Value {
    with_bridge(|b| b.new_struct_type(arg))
}

pub fn nffi_alloc_buffer(arg: Value) -> Value {
    with_bridge(|b| b.alloc_buffer(arg))
}

pub fn nffi_peek(arg: Value) -> Value {
    with_bridge(|b| b.peek(arg))
}

pub fn nffi_poke(arg: Value) -> Value {
    with_bridge(|b| b.poke(arg))
}
