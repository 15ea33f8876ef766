use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use log::{error, info};

use uefi_fw::parser::FfsParser;
use uefi_fw::tree::{ItemId, ItemType, TreeModel};

#[derive(Subcommand)]
enum Command {
    /// Display the parsed image tree, diagnostics and FIT table
    Show {
        /// File to read
        file_name: PathBuf,
    },
    /// Extract file bodies by GUID into <GUID>.bin files.
    /// The exit code is a bitmask: bits 0-6 set mean the matching GUID was
    /// not found (GUIDs past the seventh share bit 6); bit 7 flags an
    /// output write failure for a GUID that was found.
    #[clap(verbatim_doc_comment)]
    Extract {
        /// File to read
        file_name: PathBuf,
        /// File GUIDs to extract
        guids: Vec<String>,
    },
}

/// UEFI firmware image parser and extractor
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Command to run
    #[command(subcommand)]
    cmd: Command,
}

fn main() -> ExitCode {
    // Default to log level "info". Otherwise, you get no "regular" logs.
    let env = env_logger::Env::default().default_filter_or("info");
    env_logger::Builder::from_env(env).init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(error) => {
            let _ = error.print();
            return ExitCode::from(1);
        }
    };

    match cli.cmd {
        Command::Show { file_name } => show(&file_name),
        Command::Extract { file_name, guids } => extract(&file_name, &guids),
    }
}

fn read_image(file_name: &PathBuf) -> Option<Vec<u8>> {
    match std::fs::read(file_name) {
        Ok(image) => Some(image),
        Err(io_error) => {
            error!("cannot read {}: {io_error}", file_name.display());
            None
        }
    }
}

fn show(file_name: &PathBuf) -> ExitCode {
    let Some(image) = read_image(file_name) else {
        return ExitCode::from(1);
    };

    let mut parser = FfsParser::new(&image);
    if let Err(status) = parser.parse() {
        error!("parsing failed: {status}");
    }

    let model = parser.model();
    for row in 0..model.row_count(model.root()) {
        let child = model.child(model.root(), row).unwrap();
        print_tree(model, child, 0);
    }

    if !parser.diagnostics().is_empty() {
        println!("\nDiagnostics:");
        for diagnostic in parser.diagnostics() {
            println!("  {diagnostic}");
        }
    }

    if !parser.fit_table().is_empty() {
        println!("\nFIT table:");
        println!("  Address   Size      Version  Type              Checksum");
        for entry in parser.fit_table() {
            println!(
                "  {:<8}  {:<8}  {:<7}  {}  {}",
                entry.address, entry.size, entry.version, entry.entry_type, entry.checksum
            );
        }
    }

    if !parser.bootguard_info().is_empty() {
        println!("\nSecurity info:");
        for line in parser.bootguard_info().lines() {
            println!("  {line}");
        }
    }

    ExitCode::SUCCESS
}

fn extract(file_name: &PathBuf, guids: &[String]) -> ExitCode {
    let Some(image) = read_image(file_name) else {
        return ExitCode::from(1);
    };

    let mut parser = FfsParser::new(&image);
    if let Err(status) = parser.parse() {
        error!("parsing failed: {status}");
    }

    // Bit 7 of the exit code is reserved for write failures, so a found
    // GUID with a broken output path never reads as "not found".
    let mut missing_mask: u8 = 0;
    let mut write_failed = false;
    for (index, guid) in guids.iter().enumerate() {
        let model = parser.model();
        match find_file_by_guid(model, model.root(), guid) {
            Some(file) => {
                let body = model.bytes(model.body(file));
                let out_name = format!("{}.bin", guid.to_uppercase());
                match std::fs::write(&out_name, body) {
                    Ok(()) => info!("{guid} extracted to {out_name}"),
                    Err(io_error) => {
                        error!("cannot write {out_name}: {io_error}");
                        write_failed = true;
                    }
                }
            }
            None => {
                info!("{guid} not found");
                missing_mask |= missing_bit(index);
            }
        }
    }

    if write_failed {
        missing_mask |= WRITE_FAILURE_BIT;
    }
    ExitCode::from(missing_mask)
}

/// Exit-code bit flagging an output write failure.
const WRITE_FAILURE_BIT: u8 = 0x80;

fn missing_bit(index: usize) -> u8 {
    if index < 7 {
        1u8 << index
    } else {
        // Exit codes carry 7 usable bits here; later misses share the
        // last one.
        0x40
    }
}

fn find_file_by_guid(model: &TreeModel, item: ItemId, guid: &str) -> Option<ItemId> {
    if model.item_type(item) == ItemType::File && model.name(item).eq_ignore_ascii_case(guid) {
        return Some(item);
    }
    for row in 0..model.row_count(item) {
        let child = model.child(item, row)?;
        if let Some(found) = find_file_by_guid(model, child, guid) {
            return Some(found);
        }
    }
    None
}

fn print_tree(model: &TreeModel, item: ItemId, depth: usize) {
    let indent = "  ".repeat(depth);
    let name = model.name(item);
    let text = model.text(item);
    let offset = model.offset(item);
    let size = model.full_size(item);
    let text_part = if text.is_empty() {
        String::new()
    } else {
        format!("  [{}]", text.trim_end())
    };
    println!(
        "{indent}{:<10} {name}{text_part}  @ {offset:08x} ({size:x}h)",
        model.item_type(item).as_str()
    );
    for row in 0..model.row_count(item) {
        let child = model.child(item, row).unwrap();
        print_tree(model, child, depth + 1);
    }
}
