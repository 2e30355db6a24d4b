///
/// Handle Table
///
/// Owns every native resource the bridge hands to nial. nial only ever sees
/// a handle: a boxed integer whose value indexes this table.
///
/// - Values below `NUM_BASIC_TYPES` are the built-in type descriptors. They
///   live in a fixed array, are created with the table and are never freed.
/// - Values from `NUM_BASIC_TYPES` up index the dynamic slots.
///
/// The table keeps one clone of each handle it issued. A handle presented by
/// nial is accepted only if it is that very object, so a stale handle whose
/// slot has since been reused is rejected even though its number matches.
/// The same clone makes the nial reference count observable: a record may be
/// destroyed only when the table's copy and the presented one are the last two.
///

use std::ffi::c_void;
use std::ptr;

use nial_std_core::{BoxedInt, Value};
use tracing::{debug, trace, warn};

use crate::cif::PreparedCif;
use crate::config::HandleConfig;
use crate::error::{FfiError, FfiResult};
use crate::library::LoadedLibrary;
use crate::types::{BasicType, NUM_BASIC_TYPES, TypeDescriptor};

pub type Handle = BoxedInt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    CallDescriptor,
    TypeDescriptor,
    Library,
    Function,
    RawPointer,
    BuiltinType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// Allocated by the bridge with `calloc`, freed on release
    Owned,
    /// Belongs to native code; never freed here
    Borrowed,
}

/// A raw native address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativePtr(*mut c_void);

// Addresses are plain data; whoever dereferences one is responsible for it.
unsafe impl Send for NativePtr {}

impl NativePtr {
    pub fn new(ptr: *mut c_void) -> Self {
        Self(ptr)
    }

    pub fn null() -> Self {
        Self(ptr::null_mut())
    }

    pub fn as_ptr(self) -> *mut c_void {
        self.0
    }

    pub fn is_null(self) -> bool {
        self.0.is_null()
    }
}

/// A native memory block, with its length when the bridge knows it
#[derive(Debug)]
pub struct RawBuffer {
    ptr: NativePtr,
    len: Option<usize>,
    ownership: Ownership,
}

impl RawBuffer {
    /// Zeroed block of `len` bytes owned by the bridge
    pub fn allocate(len: usize) -> FfiResult<Self> {
        let ptr = unsafe { libc::calloc(len.max(1), 1) };
        if ptr.is_null() {
            return Err(FfiError::ResourceExhausted(format!(
                "calloc of {} bytes failed",
                len
            )));
        }
        Ok(Self {
            ptr: NativePtr::new(ptr),
            len: Some(len),
            ownership: Ownership::Owned,
        })
    }

    /// Owned copy of `bytes`
    pub fn copy_from(bytes: &[u8]) -> FfiResult<Self> {
        let buffer = Self::allocate(bytes.len())?;
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), buffer.ptr.as_ptr() as *mut u8, bytes.len())
        };
        Ok(buffer)
    }

    /// An address handed back by native code; its extent is unknown
    pub fn borrowed(ptr: NativePtr) -> Self {
        Self {
            ptr,
            len: None,
            ownership: Ownership::Borrowed,
        }
    }

    pub fn ptr(&self) -> NativePtr {
        self.ptr
    }

    pub fn len(&self) -> Option<usize> {
        self.len
    }

    pub fn ownership(&self) -> Ownership {
        self.ownership
    }

    /// Check that `size` bytes at `offset` lie inside the block
    pub fn check_range(&self, offset: usize, size: usize) -> FfiResult<()> {
        let Some(len) = self.len else {
            return Ok(());
        };
        match offset.checked_add(size) {
            Some(end) if end <= len => Ok(()),
            _ => Err(FfiError::OutOfBounds { offset, size, len }),
        }
    }

    fn free(self) {
        if self.ownership == Ownership::Owned {
            unsafe { libc::free(self.ptr.as_ptr()) };
        }
    }
}

/// A native resource together with its ownership
pub enum NativePayload {
    CallDescriptor(PreparedCif),
    TypeDescriptor(TypeDescriptor),
    Library(LoadedLibrary),
    Function(NativePtr),
    RawPointer(RawBuffer),
}

impl NativePayload {
    pub fn kind(&self) -> ResourceKind {
        match self {
            NativePayload::CallDescriptor(_) => ResourceKind::CallDescriptor,
            NativePayload::TypeDescriptor(TypeDescriptor::Builtin(_)) => ResourceKind::BuiltinType,
            NativePayload::TypeDescriptor(TypeDescriptor::Owned(_)) => ResourceKind::TypeDescriptor,
            NativePayload::Library(_) => ResourceKind::Library,
            NativePayload::Function(_) => ResourceKind::Function,
            NativePayload::RawPointer(_) => ResourceKind::RawPointer,
        }
    }

    /// The address nial code gets when it passes this handle as a pointer
    pub fn native_ptr(&self) -> NativePtr {
        match self {
            NativePayload::CallDescriptor(cif) => NativePtr::new(cif.as_raw_ptr() as *mut c_void),
            NativePayload::TypeDescriptor(TypeDescriptor::Builtin(basic)) => {
                NativePtr::new(basic.ffi_type().as_raw_ptr() as *mut c_void)
            }
            NativePayload::TypeDescriptor(TypeDescriptor::Owned(st)) => {
                NativePtr::new(st.as_raw_ptr() as *mut c_void)
            }
            NativePayload::Library(lib) => lib.raw_handle(),
            NativePayload::Function(addr) => *addr,
            NativePayload::RawPointer(buffer) => buffer.ptr(),
        }
    }

    fn release(self) {
        match self {
            NativePayload::CallDescriptor(cif) => drop(cif),
            NativePayload::TypeDescriptor(TypeDescriptor::Owned(st)) => drop(st),
            NativePayload::TypeDescriptor(TypeDescriptor::Builtin(_)) => {}
            NativePayload::Library(lib) => {
                let name = lib.name().to_string();
                if let Err(e) = lib.close() {
                    warn!(library = %name, error = %e, "failed to close library");
                }
            }
            NativePayload::Function(_) => {}
            NativePayload::RawPointer(buffer) => buffer.free(),
        }
    }
}

pub struct Record {
    payload: NativePayload,
    mirror: Handle,
    companion: Option<Value>,
    aux_code: i64,
}

impl Record {
    pub fn kind(&self) -> ResourceKind {
        self.payload.kind()
    }

    pub fn payload(&self) -> &NativePayload {
        &self.payload
    }

    /// Host data retained with the resource (a cif's argument types, a struct's members)
    pub fn companion(&self) -> Option<&Value> {
        self.companion.as_ref()
    }

    /// Kind-specific integer (a cif's return type code); -1 when unused
    pub fn aux_code(&self) -> i64 {
        self.aux_code
    }

    pub fn handle(&self) -> &Handle {
        &self.mirror
    }

    fn release(self) {
        let Record {
            payload,
            mirror,
            companion,
            ..
        } = self;
        drop(companion);
        payload.release();
        drop(mirror);
    }
}

pub enum Slot {
    Free,
    Occupied(Record),
}

/// Outcome of a release request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    Released,
    /// nial still holds other references; nothing was done
    StillReferenced,
    /// Built-in type descriptors are never released
    Permanent,
}

pub struct HandleTable {
    builtins: Vec<Record>,
    slots: Vec<Slot>,
    growth_chunk: usize,
    max_slots: usize,
}

impl HandleTable {
    pub fn new(config: &HandleConfig) -> Self {
        let builtins = BasicType::ALL
            .iter()
            .map(|basic| Record {
                payload: NativePayload::TypeDescriptor(TypeDescriptor::Builtin(*basic)),
                mirror: BoxedInt::new(basic.code()),
                companion: Some(Value::text(basic.name())),
                aux_code: basic.code(),
            })
            .collect();
        Self {
            builtins,
            slots: Vec::new(),
            growth_chunk: config.growth_chunk.max(1),
            max_slots: config.max_slots,
        }
    }

    /// The permanent handle of a basic type
    pub fn builtin_handle(&self, basic: BasicType) -> Handle {
        self.builtins[basic as usize].mirror.clone()
    }

    /// Register a resource, returning its new handle.
    ///
    /// On failure the payload is released, so the caller never leaks it.
    pub fn allocate(
        &mut self,
        payload: NativePayload,
        companion: Option<Value>,
        aux_code: i64,
    ) -> FfiResult<Handle> {
        let index = match self.first_free() {
            Some(index) => index,
            None => match self.grow() {
                Ok(index) => index,
                Err(e) => {
                    payload.release();
                    return Err(e);
                }
            },
        };
        let kind = payload.kind();
        let handle = BoxedInt::new((NUM_BASIC_TYPES + index) as i64);
        self.slots[index] = Slot::Occupied(Record {
            payload,
            mirror: handle.clone(),
            companion,
            aux_code,
        });
        debug!(handle = handle.value(), ?kind, "allocated handle");
        Ok(handle)
    }

    fn first_free(&self) -> Option<usize> {
        self.slots.iter().position(|slot| matches!(slot, Slot::Free))
    }

    /// Add a chunk of free slots, returning the first new index
    fn grow(&mut self) -> FfiResult<usize> {
        let start = self.slots.len();
        if start >= self.max_slots {
            return Err(FfiError::ResourceExhausted(format!(
                "handle table is full ({} slots)",
                self.max_slots
            )));
        }
        let added = self.growth_chunk.min(self.max_slots - start);
        self.slots
            .try_reserve_exact(added)
            .map_err(|e| FfiError::ResourceExhausted(e.to_string()))?;
        self.slots.resize_with(start + added, || Slot::Free);
        debug!(capacity = self.slots.len(), "grew handle table");
        Ok(start)
    }

    /// Look up a handle of any kind
    pub fn lookup(&self, handle: &Handle) -> FfiResult<&Record> {
        let value = handle.value();
        let index = usize::try_from(value).map_err(|_| FfiError::InvalidHandle(value))?;
        let record = if index < NUM_BASIC_TYPES {
            &self.builtins[index]
        } else {
            match self.slots.get(index - NUM_BASIC_TYPES) {
                Some(Slot::Occupied(record)) => record,
                _ => return Err(FfiError::InvalidHandle(value)),
            }
        };
        if !record.mirror.same_object(handle) {
            return Err(FfiError::InvalidHandle(value));
        }
        Ok(record)
    }

    /// Look up a handle that must be of the `expected` kind
    pub fn get(&self, handle: &Handle, expected: ResourceKind) -> FfiResult<&Record> {
        let record = self.lookup(handle)?;
        if record.kind() != expected {
            return Err(FfiError::InvalidHandle(handle.value()));
        }
        Ok(record)
    }

    /// Destroy the record behind `handle` if nial holds no other reference to it
    pub fn release(&mut self, handle: &Handle) -> FfiResult<Release> {
        let value = handle.value();
        self.lookup(handle)?;
        let index = value as usize;
        if index < NUM_BASIC_TYPES {
            return Ok(Release::Permanent);
        }
        let index = index - NUM_BASIC_TYPES;
        // The table's own copy plus the one being presented.
        if handle.refcount() > 2 {
            trace!(handle = value, refs = handle.refcount(), "handle still referenced");
            return Ok(Release::StillReferenced);
        }
        match std::mem::replace(&mut self.slots[index], Slot::Free) {
            Slot::Occupied(record) => {
                let kind = record.kind();
                record.release();
                debug!(handle = value, ?kind, "released handle");
                Ok(Release::Released)
            }
            Slot::Free => Err(FfiError::InvalidHandle(value)),
        }
    }

    /// Kind of whatever currently occupies `value`, for diagnostics
    pub fn kind_of(&self, value: i64) -> Option<ResourceKind> {
        let index = usize::try_from(value).ok()?;
        if index < NUM_BASIC_TYPES {
            return Some(ResourceKind::BuiltinType);
        }
        match self.slots.get(index - NUM_BASIC_TYPES)? {
            Slot::Occupied(record) => Some(record.kind()),
            Slot::Free => None,
        }
    }

    /// Number of live dynamic records
    pub fn occupied(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| matches!(slot, Slot::Occupied(_)))
            .count()
    }

    /// Number of dynamic slots, free or not
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}

impl Drop for HandleTable {
    fn drop(&mut self) {
        for slot in self.slots.iter_mut() {
            if let Slot::Occupied(record) = std::mem::replace(slot, Slot::Free) {
                record.release();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_table(growth_chunk: usize, max_slots: usize) -> HandleTable {
        HandleTable::new(&HandleConfig {
            growth_chunk,
            max_slots,
        })
    }

    fn buffer(len: usize) -> NativePayload {
        NativePayload::RawPointer(RawBuffer::allocate(len).unwrap())
    }

    #[test]
    fn test_first_handle_follows_builtins() {
        let mut table = small_table(4, 16);
        let h = table.allocate(buffer(8), None, -1).unwrap();
        assert_eq!(h.value(), NUM_BASIC_TYPES as i64);
        assert_eq!(table.capacity(), 4);
        assert_eq!(table.occupied(), 1);
        let record = table.get(&h, ResourceKind::RawPointer).unwrap();
        assert_eq!(record.aux_code(), -1);
        assert!(record.companion().is_none());
    }

    #[test]
    fn test_kind_mismatch_is_invalid() {
        let mut table = small_table(4, 16);
        let h = table.allocate(buffer(8), None, -1).unwrap();
        assert!(matches!(
            table.get(&h, ResourceKind::Library),
            Err(FfiError::InvalidHandle(24))
        ));
    }

    #[test]
    fn test_release_and_reuse_rejects_stale_handle() {
        let mut table = small_table(4, 16);
        let h = table.allocate(buffer(8), None, -1).unwrap();
        let stale = BoxedInt::new(h.value());
        assert_eq!(table.release(&h).unwrap(), Release::Released);
        assert!(matches!(table.release(&h), Err(FfiError::InvalidHandle(_))));
        drop(h);

        let reused = table.allocate(buffer(8), None, -1).unwrap();
        assert_eq!(reused.value(), stale.value());
        assert!(table.lookup(&stale).is_err());
        assert!(table.lookup(&reused).is_ok());
    }

    #[test]
    fn test_release_waits_for_other_references() {
        let mut table = small_table(4, 16);
        let h = table.allocate(buffer(8), None, -1).unwrap();
        let held_elsewhere = Value::Boxed(h.clone());
        assert_eq!(table.release(&h).unwrap(), Release::StillReferenced);
        assert_eq!(table.occupied(), 1);
        drop(held_elsewhere);
        assert_eq!(table.release(&h).unwrap(), Release::Released);
        assert_eq!(table.occupied(), 0);
    }

    #[test]
    fn test_release_drops_companion() {
        let mut table = small_table(4, 16);
        let member = table.allocate(buffer(4), None, -1).unwrap();
        let owner = table
            .allocate(buffer(4), Some(Value::Boxed(member.clone())), -1)
            .unwrap();
        assert_eq!(member.refcount(), 3);
        assert_eq!(table.release(&owner).unwrap(), Release::Released);
        assert_eq!(member.refcount(), 2);
        assert_eq!(table.release(&member).unwrap(), Release::Released);
    }

    #[test]
    fn test_builtins_are_permanent() {
        let mut table = small_table(4, 16);
        let int32 = table.builtin_handle(BasicType::SInt32);
        assert_eq!(int32.value(), 6);
        assert_eq!(table.release(&int32).unwrap(), Release::Permanent);
        assert!(table.get(&int32, ResourceKind::BuiltinType).is_ok());
        assert_eq!(table.kind_of(6), Some(ResourceKind::BuiltinType));
        assert!(table.release(&BoxedInt::new(6)).is_err());
    }

    #[test]
    fn test_growth_and_exhaustion() {
        let mut table = small_table(2, 3);
        let handles: Vec<_> = (0..3)
            .map(|_| table.allocate(buffer(1), None, -1).unwrap())
            .collect();
        assert_eq!(table.capacity(), 3);
        let err = table.allocate(buffer(1), None, -1).unwrap_err();
        assert!(matches!(err, FfiError::ResourceExhausted(_)));
        for h in &handles {
            assert!(table.lookup(h).is_ok());
        }
        assert_eq!(table.occupied(), 3);
    }

    #[test]
    fn test_unknown_handles() {
        let table = small_table(4, 16);
        assert!(table.lookup(&BoxedInt::new(-1)).is_err());
        assert!(table.lookup(&BoxedInt::new(500)).is_err());
        assert_eq!(table.kind_of(500), None);
    }

    #[test]
    fn test_buffer_range() {
        let owned = RawBuffer::allocate(8).unwrap();
        assert!(owned.check_range(4, 4).is_ok());
        assert!(matches!(
            owned.check_range(6, 4),
            Err(FfiError::OutOfBounds { len: 8, .. })
        ));
        assert!(owned.check_range(usize::MAX, 2).is_err());
        owned.free();

        let borrowed = RawBuffer::borrowed(NativePtr::null());
        assert!(borrowed.check_range(1 << 20, 8).is_ok());
        assert_eq!(borrowed.ownership(), Ownership::Borrowed);
    }
}
