use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "piper")]
#[command(about = "Project source records into FHIR resources, validate them and load the valid ones")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Pipeline config file (TOML or YAML)
    #[arg(short, long, global = true, env = "PIPER_CONFIG", default_value = "piper.toml")]
    pub config: PathBuf,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the pipeline
    Run(RunArgs),
    /// Load config and templates and validate the mapping table, then exit
    Check,
    /// Print the resolved mapping table
    Bindings(BindingsArgs),
}

#[derive(clap::Args)]
pub struct RunArgs {
    /// Only produce resources for these entity types or template ids (repeatable)
    #[arg(long = "only", value_name = "ID")]
    pub only: Vec<String>,

    /// Render every record without contacting the validator or the load target
    #[arg(long)]
    pub dry_run: bool,
}

#[derive(clap::Args)]
pub struct BindingsArgs {
    /// Print as `[[bindings]]` TOML tables instead of a table
    #[arg(long)]
    pub toml: bool,
}
