//! Handles to the host allocator, plus the bump-pointer `calloc` stub used
//! while those handles are still being resolved.
//!
//! Resolving `calloc` through the dynamic linker can itself call `calloc`
//! (glibc's TLS machinery does).  The stub breaks that cycle: it hands out
//! slices of a static, pre-zeroed buffer and never frees.  It is installed
//! before resolution starts and overwritten once the real symbol is known.

use std::cell::UnsafeCell;
use std::mem;
use std::process::abort;
use std::sync::atomic::{AtomicUsize, Ordering};

use libc::{c_char, c_void, dlsym, size_t, RTLD_NEXT};

type MallocFn = unsafe extern "C" fn(size: size_t) -> *mut c_void;
type FreeFn = unsafe extern "C" fn(ptr: *mut c_void);
type CallocFn = unsafe extern "C" fn(nmemb: size_t, size: size_t) -> *mut c_void;

static REAL_MALLOC: AtomicUsize = AtomicUsize::new(0);
static REAL_FREE: AtomicUsize = AtomicUsize::new(0);
static REAL_CALLOC: AtomicUsize = AtomicUsize::new(0);

const BOOTSTRAP_CAPACITY: usize = 1024;

// Hands out disjoint slices: the offset is claimed atomically before any
// byte of the buffer is touched.
struct BootstrapArena(UnsafeCell<[u8; BOOTSTRAP_CAPACITY]>);

unsafe impl Sync for BootstrapArena {}

static BOOTSTRAP_BUF: BootstrapArena = BootstrapArena(UnsafeCell::new([0; BOOTSTRAP_CAPACITY]));
static BOOTSTRAP_OFFSET: AtomicUsize = AtomicUsize::new(0);

/// Write one diagnostic line to stderr and abort.
///
/// Fatal paths run while the allocator may be unusable, so this stays off
/// the Rust formatting machinery entirely.
pub(crate) fn fatal(msg: &[u8]) -> ! {
    unsafe {
        let _ = libc::write(2, msg.as_ptr() as *const c_void, msg.len() as size_t);
    }
    abort();
}

// The buffer lives in .bss, so memory handed out here is already zeroed.
// It is never returned to any allocator; callers check `is_bootstrap_ptr`
// before forwarding a pointer to the real `free`.
unsafe extern "C" fn bootstrap_calloc(nmemb: size_t, size: size_t) -> *mut c_void {
    let bytes = (nmemb as usize).saturating_mul(size as usize);
    let offset = BOOTSTRAP_OFFSET.fetch_add(bytes, Ordering::Relaxed);
    if offset.saturating_add(bytes) > BOOTSTRAP_CAPACITY {
        fatal(b"mem_scope_track: bootstrap calloc buffer exhausted\n");
    }
    BOOTSTRAP_BUF.0.get().cast::<u8>().add(offset).cast()
}

/// True when `ptr` points into the bootstrap buffer.
pub(crate) fn is_bootstrap_ptr(ptr: *mut c_void) -> bool {
    let base = BOOTSTRAP_BUF.0.get() as usize;
    let addr = ptr as usize;
    addr >= base && addr < base + BOOTSTRAP_CAPACITY
}

/// Preseed the `calloc` handle with the stub.  Must happen before
/// `resolve_real_handles` so the dynamic linker can allocate mid-lookup.
pub(crate) fn install_bootstrap_calloc() {
    REAL_CALLOC.store(bootstrap_calloc as usize, Ordering::SeqCst);
}

fn resolve_or_abort(symbol: &'static [u8]) -> usize {
    let sym = unsafe { dlsym(RTLD_NEXT, symbol.as_ptr() as *const c_char) };
    if sym.is_null() {
        fatal(b"mem_scope_track: could not resolve a host allocator symbol\n");
    }
    sym as usize
}

/// Resolve the host `malloc`, `free` and `calloc`.  `calloc` goes last so
/// the stub stays installed for the linker's own allocations.
pub(crate) fn resolve_real_handles() {
    REAL_MALLOC.store(resolve_or_abort(b"malloc\0"), Ordering::SeqCst);
    REAL_FREE.store(resolve_or_abort(b"free\0"), Ordering::SeqCst);
    REAL_CALLOC.store(resolve_or_abort(b"calloc\0"), Ordering::SeqCst);
}

/// # Safety
///
/// Forwards to the host allocator's `malloc`.
pub(crate) unsafe fn real_malloc(size: size_t) -> *mut c_void {
    let raw = REAL_MALLOC.load(Ordering::Acquire);
    if raw == 0 {
        fatal(b"mem_scope_track: malloc intercepted before the host allocator was resolved\n");
    }
    let real: MallocFn = mem::transmute(raw);
    real(size)
}

/// # Safety
///
/// Forwards to the host allocator's `free`.  `ptr` must have come from the
/// host allocator (bootstrap pointers are filtered out by the caller).
pub(crate) unsafe fn real_free(ptr: *mut c_void) {
    let raw = REAL_FREE.load(Ordering::Acquire);
    if raw == 0 {
        fatal(b"mem_scope_track: free intercepted before the host allocator was resolved\n");
    }
    let real: FreeFn = mem::transmute(raw);
    real(ptr);
}

/// # Safety
///
/// Forwards to the host allocator's `calloc`, or to the bootstrap stub
/// while resolution is still in flight.
pub(crate) unsafe fn real_calloc(nmemb: size_t, size: size_t) -> *mut c_void {
    let raw = REAL_CALLOC.load(Ordering::Acquire);
    if raw == 0 {
        fatal(b"mem_scope_track: calloc intercepted before the host allocator was resolved\n");
    }
    let real: CallocFn = mem::transmute(raw);
    real(nmemb, size)
}
