use std::fs::File;
use std::process;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use package::{read_package_asm, write_package_asm, Package};

/// Assemble text packages to binary, or disassemble binary back to text.
#[derive(Parser, Debug)]
#[command(name = "cswasm", version, about)]
struct Cli {
    /// Disassemble a binary package instead of assembling
    #[arg(short = 'd', long = "disassemble")]
    disassemble: bool,

    /// Output file
    #[arg(short = 'o', long = "output")]
    output: String,

    /// Input file (.csws text, or .cswp binary with -d)
    input: String,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(message) = run(&cli) {
        eprintln!("{message}");
        process::exit(1);
    }
}

fn run(cli: &Cli) -> Result<(), String> {
    vm::init();
    if cli.disassemble {
        let package =
            Package::read_from_file(&cli.input).map_err(|e| e.to_string())?;
        let mut out = File::create(&cli.output)
            .map_err(|e| format!("{}: cannot create: {e}", cli.output))?;
        write_package_asm(&mut out, &package).map_err(|e| e.to_string())
    } else {
        let mut input = File::open(&cli.input)
            .map_err(|e| format!("{}: cannot open: {e}", cli.input))?;
        let package = read_package_asm(&cli.input, &mut input)
            .map_err(|e| e.to_string())?;
        package.write_to_file(&cli.output).map_err(|e| e.to_string())
    }
}
