use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use tosca_spec_rs::logging::Level;
use tosca_spec_rs::{load_topology, CompilerConfig, Registry, SpecAssembler, TypeIndex};

#[derive(Parser, Debug)]
#[command(name = "tosca-compile")]
#[command(about = "Compile a TOSCA topology into a deployment spec tree")]
struct CliOptions {
    /// Topology document to compile (YAML/JSON)
    #[arg(long = "topology", short = 't')]
    topology: PathBuf,

    /// Type documents to index (repeatable)
    #[arg(long = "types", short = 'T')]
    types: Vec<PathBuf>,

    /// Compiler configuration (TOML)
    #[arg(long = "config", short = 'c')]
    config: Option<PathBuf>,

    /// Override the archive repository root
    #[arg(long = "archives")]
    archives: Option<PathBuf>,

    /// Write the spec tree here instead of stdout
    #[arg(long = "output", short = 'o')]
    output: Option<PathBuf>,

    /// Echo compiler logs to stdout/stderr
    #[arg(long = "verbose", short = 'v', action = ArgAction::SetTrue)]
    verbose: bool,
}

fn main() {
    if let Err(err) = run() {
        eprintln!("Error: {err:#}");
        std::process::exit(1);
    }
}

fn load_config(path: Option<&Path>) -> Result<CompilerConfig> {
    let Some(path) = path else {
        return Ok(CompilerConfig::default());
    };
    let config = CompilerConfig::load(path)?;
    let base = path.parent().unwrap_or_else(|| Path::new("."));
    Ok(config.anchor_paths(base))
}

fn run() -> Result<()> {
    let options = CliOptions::parse();

    let mut config = load_config(options.config.as_deref())?;
    if let Some(archives) = options.archives {
        config.artifacts.repository = archives;
    }
    if options.verbose {
        config.logging.echo = true;
        config.logging.level = config.logging.level.min(Level::Debug);
    }

    let mut types = TypeIndex::new();
    for path in &options.types {
        types.load(path)?;
    }
    let topology = load_topology(&options.topology)?;

    let mut assembler = SpecAssembler::with_config(topology, Arc::new(types), Registry::new(), config);
    let tree = assembler.compile()?;
    let rendered = serde_json::to_string_pretty(&*tree)?;

    match options.output {
        Some(path) => fs::write(&path, rendered)
            .with_context(|| format!("unable to write spec tree: {}", path.display()))?,
        None => println!("{rendered}"),
    }
    Ok(())
}
