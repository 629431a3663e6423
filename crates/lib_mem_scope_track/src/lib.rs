//! Companion crate to [`mem_scope_track`].  This crate compiles into a
//! dynamic library that can be loaded via `LD_PRELOAD` to intercept the
//! program's `malloc`, `free` and `calloc` calls and attribute them to the
//! current scope.

use std::ffi::CStr;

use libc::{c_char, c_void, size_t};
use mem_scope_track::ScopeTracker;

/// When this library is loaded with `LD_PRELOAD`, this `malloc`
/// implementation records the allocation against the current scope before
/// handing the caller the memory from the original `libc` malloc.
///
/// # Safety
///
/// This method forwards to the host allocator's `malloc`, which is
/// `unsafe extern "C"`.
#[no_mangle]
pub unsafe extern "C" fn malloc(size: size_t) -> *mut c_void {
    ScopeTracker::malloc(size)
}

/// Interposed `free`: the release is recorded first, then the pointer goes
/// back to the original `libc` free.
///
/// # Safety
///
/// `ptr` must be null or a pointer previously returned by the interposed
/// allocation entry points.
#[no_mangle]
pub unsafe extern "C" fn free(ptr: *mut c_void) {
    ScopeTracker::free(ptr)
}

/// Interposed `calloc`.  Also serves the dynamic linker's own allocations
/// during symbol resolution, via a small static bootstrap buffer.
///
/// # Safety
///
/// This method forwards to the host allocator's `calloc`, which is
/// `unsafe extern "C"`.
#[no_mangle]
pub unsafe extern "C" fn calloc(nmemb: size_t, size: size_t) -> *mut c_void {
    ScopeTracker::calloc(nmemb, size)
}

/// Set the scope label that subsequent allocations are attributed to.
/// Target programs running under the preload call this to annotate their
/// phases; passing an empty string (or null) suspends attribution.
///
/// # Safety
///
/// `label` must be null or a valid NUL-terminated C string.
#[no_mangle]
pub unsafe extern "C" fn mem_scope_track_set_scope(label: *const c_char) {
    if label.is_null() {
        mem_scope_track::set_scope("");
        return;
    }
    let label = CStr::from_ptr(label).to_string_lossy();
    mem_scope_track::set_scope(&label);
}
