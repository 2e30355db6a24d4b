///
/// Library Loader / Symbol Resolver
///
/// Opens shared libraries and resolves function addresses in them. On Unix
/// libraries are opened with `RTLD_NOW | RTLD_GLOBAL`, so unresolved symbols
/// fail at load time and the library's symbols are visible to libraries
/// loaded after it.
///

use std::ffi::{CString, c_void};
use std::path::{Path, PathBuf};

use libloading::{Library, Symbol};
use nial_std_core::Value;
use tracing::debug;

use crate::config::LibraryConfig;
use crate::error::{FfiError, FfiResult};
use crate::handle::{HandleTable, NativePayload, NativePtr, ResourceKind};

/// An open library, closed when its handle is released
pub struct LoadedLibrary {
    library: Library,
    raw: NativePtr,
    name: String,
}

impl LoadedLibrary {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The loader's own handle (`dlopen` result), null where unavailable
    pub fn raw_handle(&self) -> NativePtr {
        self.raw
    }

    pub fn close(self) -> Result<(), libloading::Error> {
        self.library.close()
    }

    /// Address of `name`; a symbol that resolves to null counts as missing
    pub fn symbol(&self, name: &str) -> FfiResult<NativePtr> {
        let not_found = |reason: String| FfiError::SymbolNotFound {
            name: name.to_string(),
            reason,
        };
        let c_name = CString::new(name).map_err(|_| not_found("name contains a NUL byte".to_string()))?;
        let symbol: Symbol<*mut c_void> = unsafe { self.library.get(c_name.as_bytes_with_nul()) }
            .map_err(|e| not_found(e.to_string()))?;
        let addr = *symbol;
        if addr.is_null() {
            return Err(not_found("symbol resolves to null".to_string()));
        }
        Ok(NativePtr::new(addr))
    }
}

/// Paths to try for `name`, in order
fn candidates(name: &str, config: &LibraryConfig) -> Vec<PathBuf> {
    let path = Path::new(name);
    let mut out = Vec::new();
    if path.components().count() == 1 && !path.is_absolute() {
        out.extend(config.search_paths.iter().map(|dir| dir.join(name)));
    }
    out.push(path.to_path_buf());
    out
}

#[cfg(unix)]
fn open_native(path: &Path) -> Result<(Library, NativePtr), libloading::Error> {
    use libloading::os::unix::{Library as UnixLibrary, RTLD_GLOBAL, RTLD_NOW};

    let lib = unsafe { UnixLibrary::open(Some(path), RTLD_NOW | RTLD_GLOBAL) }?;
    let raw = lib.into_raw();
    let lib = unsafe { UnixLibrary::from_raw(raw) };
    Ok((lib.into(), NativePtr::new(raw)))
}

#[cfg(not(unix))]
fn open_native(path: &Path) -> Result<(Library, NativePtr), libloading::Error> {
    let lib = unsafe { Library::new(path) }?;
    Ok((lib, NativePtr::null()))
}

/// Open a library, trying the configured search paths for bare names
pub fn open_library(name: &str, config: &LibraryConfig) -> FfiResult<LoadedLibrary> {
    let mut reason = String::from("no candidate paths");
    for candidate in candidates(name, config) {
        match open_native(&candidate) {
            Ok((library, raw)) => {
                debug!(library = name, path = %candidate.display(), "loaded library");
                return Ok(LoadedLibrary {
                    library,
                    raw,
                    name: name.to_string(),
                });
            }
            Err(e) => reason = e.to_string(),
        }
    }
    Err(FfiError::LoadFailed {
        name: name.to_string(),
        reason,
    })
}

/// Open a library and register it
pub fn load_library(table: &mut HandleTable, config: &LibraryConfig, name: &str) -> FfiResult<Value> {
    let library = open_library(name, config)?;
    let handle = table.allocate(NativePayload::Library(library), Some(Value::text(name)), -1)?;
    Ok(Value::Boxed(handle))
}

/// Resolve `name` in the library behind `library` and register the function.
///
/// The function record keeps the library handle as companion data, so the
/// library cannot be closed while any of its functions is still registered.
pub fn resolve_symbol(table: &mut HandleTable, library: &Value, name: &str) -> FfiResult<Value> {
    let not_a_library = || FfiError::NotALibrary(library.as_int().unwrap_or(-1));
    let handle = library.as_boxed().ok_or_else(not_a_library)?;
    let record = table
        .get(handle, ResourceKind::Library)
        .map_err(|_| not_a_library())?;
    let NativePayload::Library(lib) = record.payload() else {
        return Err(not_a_library());
    };
    let addr = lib.symbol(name)?;
    debug!(library = lib.name(), symbol = name, "resolved symbol");
    let companion = Value::pair(library.clone(), Value::text(name));
    let handle = table.allocate(NativePayload::Function(addr), Some(companion), -1)?;
    Ok(Value::Boxed(handle))
}
