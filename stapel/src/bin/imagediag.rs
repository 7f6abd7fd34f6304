use std::fmt::Write as _;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Seek, SeekFrom};
use std::path::Path;
use std::process::ExitCode;

use byteorder::{LittleEndian, ReadBytesExt};
use clap::Parser;

use stapel::{
    IMAGE_SUFFIX, PAGE_SIZE, PageCounts, process_page_map, read_image_units,
    read_unit_sections, render_letter_key, render_statistics,
    sort_sections_descending,
};

/// Reports resident-page statistics for the bytecode images mapped by a
/// running process.
#[derive(Debug, Parser)]
#[command(name = "imagediag")]
struct Args {
    /// Shows a key to verbose display characters.
    #[arg(short = 'k')]
    key: bool,

    /// Shows section statistics for individual images.
    #[arg(short = 's')]
    stats: bool,

    /// Verbosely displays resident pages for images.
    #[arg(short = 'v')]
    verbose: bool,

    /// Target process id.
    pid: u32,
}

#[derive(Debug)]
struct Mapping {
    start: u64,
    end: u64,
    path: String,
}

fn read_process_maps(pid: u32) -> io::Result<Vec<Mapping>> {
    let file = File::open(format!("/proc/{pid}/maps"))?;
    let mut mappings = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        let mut fields = line.split_whitespace();
        let Some(range) = fields.next() else {
            continue;
        };
        let Some((start, end)) = range.split_once('-') else {
            continue;
        };
        let (Ok(start), Ok(end)) = (
            u64::from_str_radix(start, 16),
            u64::from_str_radix(end, 16),
        ) else {
            continue;
        };
        // perms, offset, dev, inode
        let path: Vec<&str> = fields.skip(4).collect();
        if path.is_empty() {
            continue;
        }
        mappings.push(Mapping {
            start,
            end,
            path: path.join(" "),
        });
    }
    Ok(mappings)
}

fn round_up_pages(bytes: u64) -> u64 {
    bytes.div_ceil(PAGE_SIZE as u64)
}

/// Builds the whole report for one mapping before anything is printed, so
/// a mid-mapping failure never leaves half a report on stdout.
fn report_mapping(pagemap: &mut File, map: &Mapping, args: &Args) -> io::Result<String> {
    let mut out = String::new();
    let _ = writeln!(out, "MAPPING {}: {:x}-{:x}", map.path, map.start, map.end);

    let mut image = BufReader::new(File::open(&map.path)?);
    let units = read_image_units(&mut image)?;

    let n_pages = ((map.end - map.start) as usize) / PAGE_SIZE;
    let first_page = map.start / PAGE_SIZE as u64;
    pagemap.seek(SeekFrom::Start(first_page * 8))?;
    let mut entries = vec![0u64; n_pages];
    pagemap.read_u64_into::<LittleEndian>(&mut entries)?;

    for unit in &units {
        image.seek(SeekFrom::Start(unit.offset))?;
        let mut sections = read_unit_sections(&mut image)?;
        sort_sections_descending(&mut sections);

        let start_page = (unit.offset / PAGE_SIZE as u64) as usize;
        let end_page = (round_up_pages(unit.offset + unit.size) as usize).min(n_pages);
        log::info!(
            "unit at {:#x}+{:#x} of {} spans pages {start_page}..{end_page}",
            unit.offset,
            unit.size,
            map.path
        );
        let _ = writeln!(
            out,
            "UNIT {}: {:x}-{:x}",
            map.path,
            map.start + (start_page * PAGE_SIZE) as u64,
            map.start + (end_page * PAGE_SIZE) as u64
        );

        let mut counts = PageCounts::new();
        process_page_map(
            &mut out,
            &entries[start_page..end_page],
            &sections,
            &mut counts,
            args.verbose,
        );
        if args.stats {
            render_statistics(
                &mut out,
                (end_page - start_page) as u64,
                &counts,
                &sections,
            );
        }
    }
    Ok(out)
}

fn run(args: &Args) -> Result<(), String> {
    if !Path::new(&format!("/proc/{}", args.pid)).exists() {
        return Err(format!("no such process: {}", args.pid));
    }

    let mappings = read_process_maps(args.pid)
        .map_err(|e| format!("cannot list mappings of {}: {e}", args.pid))?;
    let mut pagemap = File::open(format!("/proc/{}/pagemap", args.pid))
        .map_err(|e| format!("cannot read page residency of {}: {e}", args.pid))?;

    for mapping in mappings.iter().filter(|m| m.path.ends_with(IMAGE_SUFFIX)) {
        let report = report_mapping(&mut pagemap, mapping, args)
            .map_err(|e| format!("{}: {e}", mapping.path))?;
        print!("{report}");
    }

    if args.key {
        let mut key = String::new();
        render_letter_key(&mut key);
        print!("{key}");
    }
    Ok(())
}

fn main() -> ExitCode {
    env_logger::init();

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) if e.use_stderr() => {
            let _ = e.print();
            return ExitCode::FAILURE;
        }
        Err(e) => {
            // --help and --version are not failures.
            let _ = e.print();
            return ExitCode::SUCCESS;
        }
    };

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(msg) => {
            eprintln!("imagediag: {msg}");
            ExitCode::FAILURE
        }
    }
}
