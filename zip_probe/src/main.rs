use std::io;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use log::*;
use structopt::*;

use ziprw::*;

#[derive(Debug, StructOpt)]
#[structopt(
    name = "zip_probe",
    about = "Lists, tests, or repairs a .zip file"
)]
struct Opt {
    /// Pass multiple times for additional verbosity (info, debug, trace)
    #[structopt(short, long, parse(from_occurrences))]
    verbosity: usize,

    /// Password for encrypted entries
    #[structopt(short, long)]
    password: Option<String>,

    /// The archive is split into .z01, .z02, ... volumes, ending with the given .zip
    #[structopt(short, long)]
    split: bool,

    #[structopt(name("ZIP file"))]
    zip_path: PathBuf,

    #[structopt(subcommand)]
    command: Command,
}

#[derive(Debug, StructOpt)]
enum Command {
    /// Prints each entry's name, sizes, and modification time
    List,
    /// Reads out every entry, checking its integrity
    Test,
    /// Scans a damaged archive for entries and copies them into a new one
    Repair {
        #[structopt(name("output ZIP file"))]
        output: PathBuf,
    },
}

fn main() -> Result<()> {
    let args = Opt::from_args();

    let mut errlog = stderrlog::new();
    errlog.verbosity(args.verbosity + 1);
    errlog.init()?;

    let storage = open(&args.zip_path, args.split)?;
    match &args.command {
        Command::List => list(storage),
        Command::Test => test(storage, args.password.as_deref()),
        Command::Repair { output } => repair_into(storage, output),
    }
}

fn open(zip_path: &Path, split: bool) -> Result<Box<dyn Storage>> {
    info!("Opening {:#?}", zip_path);
    let storage: Box<dyn Storage> = if split {
        Box::new(
            MultiVolumeFile::open(zip_path, OpenMode::Read, 0)
                .context("Couldn't open split zip file")?,
        )
    } else {
        Box::new(LocalFile::open(zip_path, OpenMode::Read).context("Couldn't open zip file")?)
    };
    Ok(storage)
}

fn list(storage: Box<dyn Storage>) -> Result<()> {
    let archive = ZipReader::new(storage).context("Couldn't load archive")?;
    for entry in archive.entries() {
        println!(
            "{:>12} {:>12} {} {}{}",
            entry.size,
            entry.compressed_size,
            entry.last_modified.format("%Y-%m-%d %H:%M"),
            entry.name,
            if entry.is_encrypted() { " (encrypted)" } else { "" }
        );
    }
    if !archive.comment().is_empty() {
        println!("{}", String::from_utf8_lossy(archive.comment()));
    }
    Ok(())
}

fn test(storage: Box<dyn Storage>, password: Option<&str>) -> Result<()> {
    let mut archive = ZipReader::new(storage).context("Couldn't load archive")?;
    archive.set_password(password.map(str::as_bytes));

    let mut failures = 0;
    for index in 0..archive.len() {
        let name = archive.entries()[index].name.clone();
        match test_entry(&mut archive, index) {
            Ok(size) => debug!("{}: OK ({} bytes)", name, size),
            Err(e) => {
                error!("{}: {}", name, e);
                failures += 1;
            }
        }
    }
    archive.close()?;
    if failures > 0 {
        bail!("{} of {} entries failed", failures, archive.len());
    }
    info!("All {} entries OK", archive.len());
    Ok(())
}

fn test_entry(archive: &mut ZipReader<Box<dyn Storage>>, index: usize) -> Result<u64> {
    archive.open_entry(index, None)?;
    let copied = io::copy(&mut archive.entry_reader()?, &mut io::sink());
    archive.close_entry()?;
    Ok(copied?)
}

fn repair_into(mut damaged: Box<dyn Storage>, output: &Path) -> Result<()> {
    let fixed = LocalFile::open(output, OpenMode::Create)
        .with_context(|| format!("Couldn't create {}", output.display()))?;
    let (_, report) = repair(&mut damaged, fixed).context("Couldn't repair archive")?;
    println!(
        "Recovered {} entries ({} bytes); rejected {} candidates",
        report.entries_recovered, report.bytes_recovered, report.candidates_rejected
    );
    Ok(())
}
