use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use resumable_protocol::{BudgetRecord, StatusRecord};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use resumable_llm::{CallKind, Engine, EngineConfig, EngineError, QuantizedModel};

/// Operator front end: runs one engine operation and prints its record as JSON.
#[derive(Parser)]
#[command(name = "resumable-llm", version)]
struct Cli {
    /// TOML configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum Kind {
    Update,
    Query,
}

impl From<Kind> for CallKind {
    fn from(kind: Kind) -> Self {
        match kind {
            Kind::Update => CallKind::Update,
            Kind::Query => CallKind::Query,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Load a model (`-m <gguf>`) and report readiness.
    Load {
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// One budget-capped generation call.
    Run {
        #[arg(long, value_enum, default_value = "update")]
        kind: Kind,
        #[arg(long)]
        principal: String,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Start a new chat and delete the named session cache.
    NewChat {
        #[arg(long)]
        principal: String,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    RemoveCache {
        #[arg(long)]
        principal: String,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    CopyCache {
        #[arg(long)]
        principal: String,
        #[arg(long)]
        from: String,
        #[arg(long)]
        to: String,
    },
    /// Print the effective per-call token ceilings.
    Budget,
}

fn print_json<T: Serialize>(record: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(record)?);
    Ok(())
}

fn print_status(result: std::result::Result<StatusRecord, EngineError>) -> Result<bool> {
    let record = match result {
        Ok(record) => record,
        Err(e) => StatusRecord::failure(e.status_code(), e.to_string()),
    };
    print_json(&record)?;
    Ok(record.error.is_empty())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = EngineConfig::load(cli.config.as_deref())?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let mut engine: Engine<QuantizedModel> = Engine::new(config);

    let ok = match cli.command {
        Command::Load { args } => print_status(engine.load_model(&args))?,
        Command::Run { kind, principal, args } => {
            let record = engine.run(kind.into(), &args, &principal);
            print_json(&record)?;
            record.is_success()
        }
        Command::NewChat { principal, args } => {
            print_status(engine.start_new_conversation(&args, &principal))?
        }
        Command::RemoveCache { principal, args } => {
            print_status(engine.remove_prompt_cache(&args, &principal))?
        }
        Command::CopyCache { principal, from, to } => {
            print_status(engine.copy_prompt_cache(&principal, &from, &to))?
        }
        Command::Budget => {
            print_json(&BudgetRecord::from(engine.budget_limits()))?;
            true
        }
    };

    if !ok {
        std::process::exit(1);
    }
    Ok(())
}
