use clap::Parser;
use std::fs::File;
use std::io::BufReader;
use std::process;

use modcache::{read_header, DepEntry};

#[derive(Parser, Debug)]
#[command(author, version, about = "Inspect incremental cache files", long_about = None)]
struct Cli {
    /// The cache file to inspect
    file: String,

    /// Also list the recorded include-dependencies
    #[arg(long)]
    deps: bool,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    let file = match File::open(&cli.file) {
        Ok(file) => file,
        Err(err) => {
            eprintln!("Error opening '{}': {}", cli.file, err);
            process::exit(1);
        }
    };
    let mut reader = BufReader::new(file);

    let header = match read_header(&mut reader) {
        Ok(header) => header,
        Err(err) => {
            eprintln!("Error reading header of '{}': {}", cli.file, err);
            process::exit(1);
        }
    };

    println!("format version : {}", header.format_version);
    println!("pointer size   : {}", header.pointer_size);
    println!("build os/arch  : {}/{}", header.os, header.arch);
    println!("runtime version: {}", header.version);
    println!("source         : {} @ {}", header.branch, header.commit);

    if cli.deps {
        match read_deps_section(&mut reader) {
            Ok(deps) => {
                println!("dependencies   : {}", deps.len());
                for dep in deps {
                    println!("  {} (mtime {})", dep.path, dep.mtime);
                }
            }
            Err(err) => {
                eprintln!("Error reading dependency list: {err}");
                process::exit(1);
            }
        }
    }
}

/// Skip the worklist section, then parse the dependency list.
fn read_deps_section(r: &mut dyn std::io::Read) -> Result<Vec<DepEntry>, modcache::RestoreError> {
    modcache::inspect::skip_work_list(r)?;
    modcache::inspect::read_dependency_list(r)
}
