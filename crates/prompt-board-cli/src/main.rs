use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::{Args, Parser, Subcommand, ValueEnum};
use prompt_board_api::PromptBoardApi;
use prompt_board_core::WriteStrategy;
use prompt_board_store_sqlite::SqliteStore;
use serde_json::{json, Value};

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "pb")]
#[command(about = "Prompt Board companion tool: provision, seed, submit, inspect")]
struct Cli {
    #[arg(long, env = "PROMPT_BOARD_DB", default_value = "./prompt_board.sqlite3")]
    db: PathBuf,

    #[arg(long, env = "PROMPT_BOARD_TABLE", default_value = "prompt_responses")]
    table: String,

    #[arg(long, env = "PROMPT_BOARD_STRATEGY", value_enum, default_value = "atomic-append")]
    strategy: StrategyArg,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    /// Write the sample prompts the original data loader shipped with.
    Seed,
    Submit(SubmitArgs),
    /// Print the grouped board view.
    Board,
    /// Print raw stored records in insertion order.
    Records,
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    /// Create the record table and prompt index if absent.
    Provision,
    /// Report whether the record table exists, without creating it.
    Status,
}

#[derive(Debug, Args)]
struct SubmitArgs {
    #[arg(long)]
    prompt: String,
    #[arg(long)]
    response: String,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StrategyArg {
    IndexLookup,
    AtomicAppend,
    FlatInsert,
}

impl From<StrategyArg> for WriteStrategy {
    fn from(value: StrategyArg) -> Self {
        match value {
            StrategyArg::IndexLookup => Self::IndexLookup,
            StrategyArg::AtomicAppend => Self::AtomicAppend,
            StrategyArg::FlatInsert => Self::FlatInsert,
        }
    }
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Db { command } => run_db(command, &cli.db, &cli.table),
        Command::Seed => {
            let api = PromptBoardApi::open(&cli.db, &cli.table, cli.strategy.into())?;
            let seeded = api.seed_samples()?;
            emit_json(json!({ "table": cli.table, "seeded_records": seeded }))
        }
        Command::Submit(args) => {
            let api = PromptBoardApi::open(&cli.db, &cli.table, cli.strategy.into())?;
            let outcome = api.submit(&args.prompt, &args.response)?;
            emit_json(serde_json::to_value(&outcome)?)
        }
        Command::Board => {
            let api = PromptBoardApi::open(&cli.db, &cli.table, cli.strategy.into())?;
            let groups = api.board()?;
            emit_json(json!({ "groups": serde_json::to_value(&groups)? }))
        }
        Command::Records => {
            let api = PromptBoardApi::open(&cli.db, &cli.table, cli.strategy.into())?;
            let records = api.records()?;
            emit_json(json!({ "records": serde_json::to_value(&records)? }))
        }
    }
}

fn run_db(command: DbCommand, db: &Path, table: &str) -> Result<()> {
    match command {
        DbCommand::Provision => {
            let store = SqliteStore::open(db, table)?;
            store.provision()?;
            emit_json(json!({ "table": table, "provisioned": true }))
        }
        DbCommand::Status => {
            let store = SqliteStore::open(db, table)?;
            let provisioned = store.is_provisioned()?;
            emit_json(json!({ "table": table, "provisioned": provisioned }))
        }
    }
}
