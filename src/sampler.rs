//! The background sampler: snapshots per-scope totals every 100 ms and
//! appends timestamped records to the trace stream.

use std::env;
use std::fmt::Write as _;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use rand::distr::Alphanumeric;
use rand::Rng;

use crate::guard::RecursionGuard;
use crate::output::TraceWriter;
use crate::table::AllocationTable;
use crate::ERR_POISONED_LOCK;

pub(crate) const SAMPLE_INTERVAL: Duration = Duration::from_millis(100);

struct StopSignal {
    stopped: Mutex<bool>,
    condvar: Condvar,
}

/// Handle to the sampling thread.  `stop` signals the thread, which writes
/// one final record, closes the trace and prints the plotter command, then
/// joins it.
pub(crate) struct Sampler {
    signal: Arc<StopSignal>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Sampler {
    /// Spawn the sampler against `table`.  `plot_script` is the resolved
    /// path of the external timeline plotter, echoed on stdout when
    /// sampling stops.  A spawn failure leaves the tracker running without
    /// a trace, which the caller logs.
    pub(crate) fn start(
        table: &'static AllocationTable,
        plot_script: PathBuf,
    ) -> io::Result<Sampler> {
        let signal = Arc::new(StopSignal {
            stopped: Mutex::new(false),
            condvar: Condvar::new(),
        });
        let thread_signal = Arc::clone(&signal);
        let thread = thread::Builder::new()
            .name("mem-scope-sampler".into())
            .spawn(move || {
                // Everything this thread allocates (snapshot copies, record
                // strings, gzip buffers) stays out of the table.
                RecursionGuard::pin_current_thread();
                if let Err(err) = run(table, &thread_signal, &plot_script) {
                    crate::logger().log(format_args!("sampler stopped working: {err}"));
                }
            })?;
        Ok(Sampler {
            signal,
            thread: Some(thread),
        })
    }

    pub(crate) fn stop(mut self) {
        *self.signal.stopped.lock().expect(ERR_POISONED_LOCK) = true;
        self.signal.condvar.notify_all();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn output_path() -> PathBuf {
    match env::var("MEMSCOPETRACK_OUTFILE") {
        Ok(path) => PathBuf::from(path),
        Err(_) => {
            let suffix: String = rand::rng()
                .sample_iter(Alphanumeric)
                .take(10)
                .map(char::from)
                .collect();
            PathBuf::from(format!("mem-scope-track.{suffix}.gz"))
        }
    }
}

fn run(table: &AllocationTable, signal: &StopSignal, plot_script: &Path) -> io::Result<()> {
    let path = output_path();
    let mut trace = TraceWriter::create(&path)?;
    let started = Instant::now();

    write_record(&mut trace, table, started)?;
    loop {
        let pending = signal.stopped.lock().expect(ERR_POISONED_LOCK);
        // Sleep out the interval, waking early only on a stop request.
        let (pending, _timed_out) = signal
            .condvar
            .wait_timeout_while(pending, SAMPLE_INTERVAL, |stopped| !*stopped)
            .expect(ERR_POISONED_LOCK);
        let stopped = *pending;
        drop(pending);

        write_record(&mut trace, table, started)?;
        if stopped {
            break;
        }
    }
    trace.flush()?;
    drop(trace);

    // Hand the user the exact plotter invocation instead of running it.
    println!("python {} {}", plot_script.display(), path.display());
    Ok(())
}

// One record: a `---<microseconds>` delimiter line stamped after the
// snapshot copy is taken, then one `scope|bytes` line per known scope.
fn write_record(
    trace: &mut TraceWriter,
    table: &AllocationTable,
    started: Instant,
) -> io::Result<()> {
    let extents = table.extents();
    let stamp = started.elapsed().as_micros();
    let mut record = format!("---{stamp}\n");
    for (scope, bytes) in &extents {
        let _ = writeln!(record, "{scope}|{bytes}");
    }
    trace.write_text(&record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::collections::HashMap;
    use std::fs::{self, File};
    use std::io::Read;

    fn leaked_table() -> &'static AllocationTable {
        Box::leak(Box::new(AllocationTable::new()))
    }

    fn parse(trace: &str) -> Vec<(u128, HashMap<String, usize>)> {
        let mut records = Vec::new();
        for line in trace.lines() {
            if let Some(stamp) = line.strip_prefix("---") {
                records.push((stamp.parse().unwrap(), HashMap::new()));
            } else {
                let (scope, bytes) = line.split_once('|').unwrap();
                let (_, scopes) = records.last_mut().unwrap();
                scopes.insert(scope.to_string(), bytes.parse().unwrap());
            }
        }
        records
    }

    fn run_sampler_to(path: &Path, table: &'static AllocationTable, work: impl FnOnce()) {
        let _global = crate::testutil::global_state_lock();
        env::set_var("MEMSCOPETRACK_OUTFILE", path);
        let sampler = Sampler::start(table, PathBuf::from("timeline.py")).unwrap();
        work();
        sampler.stop();
        env::remove_var("MEMSCOPETRACK_OUTFILE");
    }

    #[test]
    fn records_reflect_table_state_and_timestamps_do_not_decrease() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.txt");
        let table = leaked_table();

        run_sampler_to(&path, table, || {
            table.add(0x10, Arc::from("main"), 4);
            table.add(0x20, Arc::from("two"), 40);
            thread::sleep(SAMPLE_INTERVAL * 3);
            table.remove(0x10);
        });

        let records = parse(&fs::read_to_string(&path).unwrap());
        // Initial record plus at least a couple of interval samples and the
        // final one.
        assert!(records.len() >= 3);
        for pair in records.windows(2) {
            assert!(pair[0].0 <= pair[1].0);
        }
        let (_, last) = records.last().unwrap();
        assert_eq!(last.get("main"), Some(&0));
        assert_eq!(last.get("two"), Some(&40));
    }

    #[test]
    fn gz_path_produces_a_readable_compressed_trace() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.gz");
        let table = leaked_table();

        run_sampler_to(&path, table, || {
            table.add(0x30, Arc::from("gz"), 8);
        });

        let mut text = String::new();
        GzDecoder::new(File::open(&path).unwrap())
            .read_to_string(&mut text)
            .unwrap();
        let records = parse(&text);
        assert!(!records.is_empty());
        let (_, last) = records.last().unwrap();
        assert_eq!(last.get("gz"), Some(&8));
    }

    #[test]
    fn immediate_stop_still_writes_initial_and_final_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.txt");
        let table = leaked_table();

        run_sampler_to(&path, table, || {});

        let records = parse(&fs::read_to_string(&path).unwrap());
        assert!(records.len() >= 2);
    }
}
