use std::process;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use package::Package;
use vm::{interpret, Interpreted};

/// Interpret a compiled package, starting at its `main` function.
#[derive(Parser, Debug)]
#[command(name = "cswi", version, about)]
struct Cli {
    /// Validate all packages before interpreting anything
    #[arg(short = 'v', long = "validate")]
    validate: bool,

    /// The .cswp package to run
    input: String,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(&cli) {
        Ok(Interpreted::Finished) => {}
        Ok(Interpreted::Exit(status)) => process::exit(status as i32),
        Err(message) => {
            eprintln!("{message}");
            process::exit(1);
        }
    }
}

fn run(cli: &Cli) -> Result<Interpreted, String> {
    vm::init();
    let package =
        Package::read_from_file(&cli.input).map_err(|e| e.to_string())?;
    if cli.validate {
        package.validate().map_err(|e| e.to_string())?;
    }
    let entry = package
        .function_by_name("main")
        .map_err(|e| e.to_string())?
        .ok_or_else(|| {
            format!("{}: could not find entry function 'main'", cli.input)
        })?;

    let mut stdout = std::io::stdout();
    interpret(&package, &entry, &mut stdout).map_err(|e| e.to_string())
}
