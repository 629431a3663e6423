use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use args::Args;
use flate2::read::GzDecoder;
use getopts::Occur;
use glob::glob;
use num_format::{Locale, ToFormattedString};

const PROGRAM_DESC: &str = "Inspect mem-scope-track trace files";
const PROGRAM_NAME: &str = "mst_print";

// One trace record: microseconds since sampling started, and the live
// bytes per scope at that instant.
struct Record {
    stamp: u128,
    extents: Vec<(String, u64)>,
}

fn main() -> Result<(), anyhow::Error> {
    let mut args = Args::new(PROGRAM_NAME, PROGRAM_DESC);
    args.flag("h", "help", "Print a help message")
        .flag("d", "dump", "Print every record instead of the peak summary")
        .option(
            "f",
            "file",
            "Trace file to read (default: mem-scope-track.*.gz in the current directory)",
            "FILE",
            Occur::Optional,
            None,
        );

    args.parse_from_cli()?;

    if args.value_of::<bool>("help").unwrap() == true {
        println!("{}", args.full_usage());
        return Ok(());
    }

    let files: Vec<String> = match args.value_of::<String>("file") {
        Ok(file) => vec![file],
        Err(_) => {
            let mut found = vec![];
            for path in glob("mem-scope-track.*.gz")? {
                found.push(path?.display().to_string());
            }
            if found.is_empty() {
                return Err(anyhow::Error::msg("no trace files found"));
            }
            found
        }
    };

    let dump = args.value_of::<bool>("dump").unwrap();

    for file in files.iter() {
        eprintln!("reading trace {}", file);
        let records = parse_trace(&read_trace(Path::new(file))?)?;
        if dump {
            print_records(&records);
        } else {
            print_peaks(&records);
        }
    }

    Ok(())
}

// Traces are gzipped unless the sampler was pointed at a non-.gz path.
fn read_trace(path: &Path) -> Result<String, anyhow::Error> {
    let mut text = String::new();
    if path.extension().is_some_and(|ext| ext == "gz") {
        GzDecoder::new(File::open(path)?).read_to_string(&mut text)?;
    } else {
        File::open(path)?.read_to_string(&mut text)?;
    }
    Ok(text)
}

fn parse_trace(text: &str) -> Result<Vec<Record>, anyhow::Error> {
    let mut records: Vec<Record> = vec![];
    for line in text.lines() {
        if let Some(stamp) = line.strip_prefix("---") {
            records.push(Record {
                stamp: stamp.parse()?,
                extents: vec![],
            });
        } else {
            let (scope, bytes) = line
                .split_once('|')
                .ok_or_else(|| anyhow::Error::msg(format!("malformed trace line: {line}")))?;
            let record = records
                .last_mut()
                .ok_or_else(|| anyhow::Error::msg("trace does not start with a record delimiter"))?;
            record.extents.push((scope.to_string(), bytes.parse()?));
        }
    }
    Ok(records)
}

fn print_records(records: &[Record]) {
    for record in records.iter() {
        println!("{}us", record.stamp);
        for (scope, bytes) in record.extents.iter() {
            println!("  {} - {}B", scope, bytes.to_formatted_string(&Locale::en));
        }
    }
}

fn print_peaks(records: &[Record]) {
    let mut peaks: HashMap<&str, u64> = HashMap::new();
    for record in records.iter() {
        for (scope, bytes) in record.extents.iter() {
            let peak = peaks.entry(scope.as_str()).or_insert(0);
            if *bytes > *peak {
                *peak = *bytes;
            }
        }
    }

    let mut sorted: Vec<_> = peaks.into_iter().collect();
    sorted.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));

    println!("peak live bytes per scope over {} records:", records.len());
    for (scope, peak) in sorted.iter() {
        println!("  {} - {}B", scope, peak.to_formatted_string(&Locale::en));
    }
}
