//! Packing tool: bundle loose `.tbl` table files into a PAK archive the
//! data registry can load.
//!
//! Usage:
//!   cargo run -p wyd-server --bin tblpack -- <table-dir> <output.pak> [--no-compress]
//!
//! Every known table file found in `<table-dir>` is validated by parsing
//! it with the registry's own parsers before it goes into the archive, so
//! a bad table fails here instead of at server reload time.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process;
use std::time::Instant;

use anyhow::{bail, Context};

use wyd_core::pak::PakBuilder;
use wyd_server::registry;

/// The table files the registry knows how to load, with their archive
/// paths and validation parsers.
const TABLES: &[(&str, fn(&[u8]) -> anyhow::Result<usize>)] = &[
    ("item.tbl", validate_items),
    ("mob.tbl", validate_mobs),
    ("skill.tbl", validate_skills),
    ("drop.tbl", validate_drops),
    ("event.tbl", validate_events),
    ("quest.tbl", validate_quests),
];

fn validate_items(bytes: &[u8]) -> anyhow::Result<usize> {
    Ok(registry::parse_items(bytes)?.len())
}

fn validate_mobs(bytes: &[u8]) -> anyhow::Result<usize> {
    Ok(registry::parse_mobs(bytes)?.len())
}

fn validate_skills(bytes: &[u8]) -> anyhow::Result<usize> {
    Ok(registry::parse_skills(bytes)?.len())
}

fn validate_drops(bytes: &[u8]) -> anyhow::Result<usize> {
    Ok(registry::parse_drops(bytes)?.values().map(|v| v.len()).sum())
}

fn validate_events(bytes: &[u8]) -> anyhow::Result<usize> {
    Ok(registry::parse_events(bytes)?.len())
}

fn validate_quests(bytes: &[u8]) -> anyhow::Result<usize> {
    Ok(registry::parse_quests(bytes)?.len())
}

fn pack(table_dir: &Path, output: &Path, compress: bool) -> anyhow::Result<()> {
    let started = Instant::now();
    let mut builder = PakBuilder::new();
    let mut packed = 0usize;

    for (file_name, validate) in TABLES {
        let path = table_dir.join(file_name);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(_) => {
                println!("  skip  {file_name} (not present)");
                continue;
            }
        };
        let rows = validate(&bytes)
            .with_context(|| format!("{file_name} failed validation"))?;
        let archive_path = format!("tables/{file_name}");
        builder.add(&archive_path, &bytes, compress, 0);
        println!("  pack  {file_name}: {rows} rows, {} bytes", bytes.len());
        packed += 1;
    }

    if packed == 0 {
        bail!("no table files found in {}", table_dir.display());
    }

    let raw = builder.finish()?;
    fs::write(output, &raw).with_context(|| format!("writing {}", output.display()))?;
    println!(
        "Wrote {} ({} tables, {} bytes) in {:.2?}",
        output.display(),
        packed,
        raw.len(),
        started.elapsed()
    );
    Ok(())
}

fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() < 3 {
        eprintln!("Usage: tblpack <table-dir> <output.pak> [--no-compress]");
        process::exit(2);
    }
    let table_dir = PathBuf::from(&args[1]);
    let output = PathBuf::from(&args[2]);
    let compress = !args.iter().any(|a| a == "--no-compress");

    if let Err(e) = pack(&table_dir, &output, compress) {
        eprintln!("tblpack failed: {e:#}");
        process::exit(1);
    }
}
