//! `mem_scope_track` records how much live heap memory each annotated
//! *scope* of a program is holding, over time.  The program names the
//! current scope with a short string label; every heap allocation made
//! while that label is set is attributed to it, and the matching `free`
//! is subtracted from the scope that allocated the block.  A background
//! sampler snapshots the per-scope totals every 100 ms and appends them to
//! a timestamped trace file that an external plotter turns into a
//! timeline.
//!
//! Tracking works for programs in any compiled language: the companion
//! [`lib_mem_scope_track`] crate builds a dynamic library that interposes
//! `malloc`, `free` and `calloc` when loaded via `LD_PRELOAD`:
//!
//! ```bash
//! LD_PRELOAD=liblib_mem_scope_track.so ./my_program
//! ```
//!
//! The target program annotates phases by calling the exported
//! `mem_scope_track_set_scope` symbol (or [`set_scope`] from Rust):
//!
//! ```c
//! mem_scope_track_set_scope("parse");
//! /* ... allocations attributed to "parse" ... */
//! mem_scope_track_set_scope("");      /* stop attributing */
//! ```
//!
//! ## Output
//!
//! The trace lands in `mem-scope-track.<random>.gz` in the current
//! directory (override with `MEMSCOPETRACK_OUTFILE`; a name without the
//! `.gz` suffix writes plain text).  Each record is a `---<microseconds>`
//! delimiter line followed by one `scope|bytes` line per scope.  On clean
//! exit the library prints the `python .../timeline.py <trace>` command
//! that plots the file, and reports any scopes that still hold memory.
//!
//! Diagnostics (duplicate addresses, the unfreed-memory report) go to the
//! destination named by `MEMSCOPETRACK_LOGFILE`: `stdout`, `stderr`, or a
//! file path (`.gz` honored).  Leaving it unset discards them.
//!
//! ## Viewing traces
//!
//! Use the `mst_print` tool from this crate to inspect a trace without
//! plotting it, e.g.:
//!
//! ```bash
//! mst_print --file mem-scope-track.h3bQxp01Zk.gz
//! ```

use std::env;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use libc::{c_void, size_t};
use once_cell::sync::Lazy;

mod bootstrap;
mod guard;
mod output;
mod sampler;
mod table;

use guard::RecursionGuard;
use output::Logger;
use sampler::Sampler;
use table::AllocationTable;

pub(crate) const ERR_POISONED_LOCK: &str = "a tracker lock was poisoned";

static TRACKING_ENABLED: AtomicBool = AtomicBool::new(false);

static TABLE: Lazy<AllocationTable> = Lazy::new(AllocationTable::new);
static LOGGER: Lazy<Logger> = Lazy::new(Logger::from_env);
static SAMPLER: Mutex<Option<Sampler>> = Mutex::new(None);

pub(crate) fn logger() -> &'static Logger {
    &LOGGER
}

const UNINITIALIZED: u8 = 0;
const INITIALIZING: u8 = 1;
const READY: u8 = 2;

static INIT_STATE: AtomicU8 = AtomicU8::new(UNINITIALIZED);
static INIT_THREAD: AtomicUsize = AtomicUsize::new(0);

/// Run one-time initialization if it has not happened yet.
///
/// Returns false only for the initializing thread's own nested calls:
/// resolving the real symbols can allocate through the dynamic linker, and
/// those allocations must pass straight through to whatever handles are
/// installed at that moment (the bootstrap `calloc` stub, in particular).
/// Any other thread arriving mid-initialization yields until it completes.
fn ensure_init() -> bool {
    match INIT_STATE.compare_exchange(
        UNINITIALIZED,
        INITIALIZING,
        Ordering::AcqRel,
        Ordering::Acquire,
    ) {
        Ok(_) => {
            INIT_THREAD.store(unsafe { libc::pthread_self() } as usize, Ordering::SeqCst);
            initialize();
            INIT_STATE.store(READY, Ordering::Release);
            true
        }
        Err(READY) => true,
        Err(_) => {
            if unsafe { libc::pthread_self() } as usize == INIT_THREAD.load(Ordering::SeqCst) {
                return false;
            }
            while INIT_STATE.load(Ordering::Acquire) != READY {
                thread::yield_now();
            }
            true
        }
    }
}

fn initialize() {
    bootstrap::install_bootstrap_calloc();
    bootstrap::resolve_real_handles();

    Lazy::force(&LOGGER);
    Lazy::force(&TABLE);

    // The plotter ships next to the preload library, so the script path
    // has to be derived before the variable is cleared.
    let plot_script = plot_script_path();

    match Sampler::start(&TABLE, plot_script) {
        Ok(sampler) => *SAMPLER.lock().expect(ERR_POISONED_LOCK) = Some(sampler),
        Err(err) => LOGGER.log(format_args!("cannot start the sampler: {err}")),
    }

    // Children spawned by the target program should run uninstrumented.
    env::remove_var("LD_PRELOAD");

    unsafe {
        libc::atexit(teardown);
    }

    TRACKING_ENABLED.store(true, Ordering::SeqCst);
}

fn plot_script_path() -> PathBuf {
    let Ok(preload) = env::var("LD_PRELOAD") else {
        bootstrap::fatal(b"mem_scope_track: LD_PRELOAD is not set\n");
    };
    // LD_PRELOAD may list several objects; pick the one this tracker was
    // loaded from.
    let entry = preload
        .split([':', ' '])
        .find(|entry| entry.contains("mem_scope_track"))
        .unwrap_or(preload.as_str());
    let dir = Path::new(entry).parent().unwrap_or(Path::new("."));
    dir.join("timeline.py")
}

extern "C" fn teardown() {
    // Everything intercepted from here on is a plain pass-through.
    TRACKING_ENABLED.store(false, Ordering::SeqCst);

    if let Some(sampler) = SAMPLER.lock().expect(ERR_POISONED_LOCK).take() {
        sampler.stop();
    }

    report_leaks(&LOGGER, &TABLE);

    TABLE.clear();
    LOGGER.shutdown();
}

fn report_leaks(logger: &Logger, table: &AllocationTable) {
    let leaked: Vec<_> = table
        .extents()
        .into_iter()
        .filter(|(_, bytes)| *bytes != 0)
        .collect();
    if leaked.is_empty() {
        return;
    }
    logger.log(format_args!("Unfreed memory:"));
    for (scope, bytes) in leaked {
        logger.log(format_args!("  {scope} - {bytes}"));
    }
}

/// Set the scope label that subsequent heap allocations are attributed to.
/// The empty string suspends attribution.
///
/// The label is process-wide.  Writes are deliberately not ordered against
/// concurrent allocations on other threads; an allocation racing with
/// `set_scope` lands in either the old or the new scope.
pub fn set_scope(label: &str) {
    let guard = RecursionGuard::enter();
    table::replace_scope(label);
    if guard.reentered() || !TRACKING_ENABLED.load(Ordering::Relaxed) {
        return;
    }
    // Register the label right away so the scope shows up in every later
    // sampler record, even if it never allocates.
    if !label.is_empty() {
        TABLE.declare_scope(Arc::from(label));
    }
}

/// Attribute `size` bytes at `addr` to the current scope.
///
/// This is the bookkeeping half of the interposed `malloc`/`calloc`; it is
/// public so embedders and tests can drive the table without going through
/// the allocator.  No-op while the current scope is empty, while tracking
/// is disabled, or on a nested call from the tracker's own bookkeeping.
pub fn track(addr: usize, size: usize) {
    let guard = RecursionGuard::enter();
    if guard.reentered() || !TRACKING_ENABLED.load(Ordering::Relaxed) {
        return;
    }
    let scope = table::current_scope();
    if scope.is_empty() {
        return;
    }
    if !TABLE.add(addr, scope, size) {
        LOGGER.log(format_args!("duplicate memory address {addr:#x}"));
    }
}

/// Subtract the allocation recorded at `addr` from its scope and drop the
/// record.  Unknown addresses are ignored; see [`track`].
pub fn release(addr: usize) {
    let guard = RecursionGuard::enter();
    if guard.reentered() || !TRACKING_ENABLED.load(Ordering::Relaxed) {
        return;
    }
    TABLE.remove(addr);
}

/// The interposer entry points behind the exported C symbols.
///
/// When the companion `lib_mem_scope_track` library is loaded with
/// `LD_PRELOAD`, its `malloc`/`free`/`calloc` exports forward here.
pub struct ScopeTracker;

impl ScopeTracker {
    /// # Safety
    ///
    /// Must only be called as the body of an interposed C `malloc`: it
    /// forwards to the host allocator's `malloc`.
    pub unsafe fn malloc(size: size_t) -> *mut c_void {
        if !ensure_init() {
            return bootstrap::real_malloc(size);
        }
        let ptr = bootstrap::real_malloc(size);
        track(ptr as usize, size as usize);
        ptr
    }

    /// # Safety
    ///
    /// Must only be called as the body of an interposed C `free`; `ptr`
    /// must be null or a pointer obtained from the interposed allocation
    /// entry points.
    pub unsafe fn free(ptr: *mut c_void) {
        if !ensure_init() {
            if !bootstrap::is_bootstrap_ptr(ptr) {
                bootstrap::real_free(ptr);
            }
            return;
        }
        release(ptr as usize);
        // Bootstrap memory is carved out of a static buffer; the host
        // allocator has never seen it.
        if bootstrap::is_bootstrap_ptr(ptr) {
            return;
        }
        bootstrap::real_free(ptr);
    }

    /// # Safety
    ///
    /// Must only be called as the body of an interposed C `calloc`: it
    /// forwards to the host allocator's `calloc` (or the bootstrap stub
    /// during initialization).
    pub unsafe fn calloc(nmemb: size_t, size: size_t) -> *mut c_void {
        if !ensure_init() {
            return bootstrap::real_calloc(nmemb, size);
        }
        let ptr = bootstrap::real_calloc(nmemb, size);
        if !ptr.is_null() {
            track(ptr as usize, (nmemb as usize).saturating_mul(size as usize));
        }
        ptr
    }
}
