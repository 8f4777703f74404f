//! Command surface for the code desk assistant.
//!
//! Host tooling embeds desk behavior through:
//! - [`run_cli`] for full parsed CLI execution.
//! - [`run_command_with_db`] for direct [`Command`] execution against a DB path.
//! - [`run_command`] for execution against an existing [`SqliteQueryStore`].

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use code_desk_core::{
    apply_file_blocks, extract_code_blocks, extract_file_references, fetch_existing_content,
    format_rfc3339, list_project_folders, ApplyReport, BlockOutcome, ModelSettings,
    NewQueryRecord, PromptComposer, QueryId, QueryRecord, QueryUpdate, DEFAULT_SOURCE_SUFFIX,
    SOURCE_SUFFIX_VAR,
};
use code_desk_provider::{error_exchange, GeminiModel, MockModel, ModelAdapter};
use code_desk_store_sqlite::SqliteQueryStore;
use ulid::Ulid;

#[derive(Debug, Parser)]
#[command(name = "cdesk")]
#[command(about = "Code desk AI assistant CLI")]
pub struct Cli {
    #[arg(long, default_value = "./code_desk.sqlite3")]
    db: PathBuf,

    #[arg(long, default_value = ".")]
    root: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Ask(AskArgs),
    Fetch(FetchArgs),
    Apply(ApplyArgs),
    History(HistoryArgs),
    Show(ShowArgs),
    Folders(FoldersArgs),
}

#[derive(Debug, Args)]
pub struct AskArgs {
    #[arg(long)]
    question: String,
    #[arg(long)]
    folder: Option<String>,
    #[arg(long, default_value_t = 0)]
    history: usize,
    #[arg(long, default_value = "gemini")]
    provider: ProviderArg,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct FetchArgs {
    #[arg(long)]
    id: String,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct ApplyArgs {
    #[arg(long)]
    id: String,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct HistoryArgs {
    #[arg(long, default_value_t = 10)]
    limit: usize,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct ShowArgs {
    #[arg(long)]
    id: String,
}

#[derive(Debug, Args)]
pub struct FoldersArgs {
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ProviderArg {
    Gemini,
    Mock,
}

/// Executes the parsed top-level CLI command graph.
///
/// # Errors
/// Returns an error when store open, migration, configuration, or command
/// execution fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    run_command_with_db(&cli.db, &cli.root, cli.command)
}

/// Executes a parsed command using the provided `SQLite` DB path.
///
/// # Errors
/// Returns an error when store open/migrate fails or the requested command fails.
pub fn run_command_with_db(db_path: &Path, root: &Path, command: Command) -> Result<()> {
    let mut store = SqliteQueryStore::open(db_path)?;
    store.migrate()?;
    run_command(command, &mut store, root)
}

/// Executes a parsed command against an existing store handle.
///
/// # Errors
/// Returns an error when the project root is missing or when configuration,
/// persistence, or file system operations fail.
pub fn run_command(command: Command, store: &mut SqliteQueryStore, root: &Path) -> Result<()> {
    if !root.is_dir() {
        return Err(anyhow!(
            "project root '{}' is not a directory",
            root.display()
        ));
    }

    match command {
        Command::Ask(args) => run_ask(&args, store, root),
        Command::Fetch(args) => run_fetch(&args, store, root),
        Command::Apply(args) => run_apply(&args, store, root),
        Command::History(args) => run_history(&args, store),
        Command::Show(args) => run_show(&args, store),
        Command::Folders(args) => run_folders(&args, root),
    }
}

/// Composes the prompt, calls the chosen provider, and persists the exchange.
///
/// Provider call failures are persisted as error-shaped records rather than
/// aborting, so the interaction history stays complete. Configuration problems
/// (a missing API key for the real provider) abort before anything is stored.
///
/// # Errors
/// Returns an error when adapter construction, history retrieval, or
/// persistence fails.
pub fn execute_ask(
    store: &mut SqliteQueryStore,
    root: &Path,
    settings: &ModelSettings,
    args: &AskArgs,
) -> Result<QueryRecord> {
    let adapter: Box<dyn ModelAdapter> = match args.provider {
        ProviderArg::Gemini => Box::new(GeminiModel::from_settings(settings)?),
        ProviderArg::Mock => Box::new(MockModel::new()),
    };
    ask_with_adapter(store, root, settings, args, adapter.as_ref())
}

fn ask_with_adapter(
    store: &mut SqliteQueryStore,
    root: &Path,
    settings: &ModelSettings,
    args: &AskArgs,
    adapter: &dyn ModelAdapter,
) -> Result<QueryRecord> {
    let history = store.latest(args.history)?;
    let composer = PromptComposer::new(root, settings);
    let composed = composer.compose(&args.question, args.folder.as_deref(), &history);

    tracing::info!(
        provider = adapter.provider_name(),
        history_turns = composed.turns.len(),
        "sending prompt"
    );

    let exchange = match adapter.send(&composed.prompt, &composed.turns) {
        Ok(exchange) => exchange,
        Err(err) => {
            tracing::warn!(error = %err, "model call failed, storing error response");
            error_exchange(&err, &composed.prompt)
        }
    };

    let record = store.insert(&NewQueryRecord {
        question: args.question.clone(),
        response: exchange.response_text,
        raw_response: Some(exchange.raw_response),
        token_count: exchange.token_count,
        request_payload: Some(exchange.request_payload),
    })?;

    Ok(record)
}

fn run_ask(args: &AskArgs, store: &mut SqliteQueryStore, root: &Path) -> Result<()> {
    let settings = ModelSettings::from_env()?;
    let record = execute_ask(store, root, &settings, args)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&record)?);
    } else {
        println!("query_id={}", record.id);
        match record.token_count {
            Some(tokens) => println!("AI query executed successfully. Tokens used: {tokens}"),
            None => println!("AI query executed successfully."),
        }
        println!();
        println!("{}", record.response);
    }
    Ok(())
}

fn run_fetch(args: &FetchArgs, store: &mut SqliteQueryStore, root: &Path) -> Result<()> {
    let id = parse_query_id(&args.id)?;
    let record = require_record(store, id)?;

    let references = extract_file_references(&record.response);
    let source_suffix = std::env::var(SOURCE_SUFFIX_VAR)
        .unwrap_or_else(|_| DEFAULT_SOURCE_SUFFIX.to_string());
    let existing = fetch_existing_content(root, &references, &source_suffix)?;

    let updated = store.update(
        id,
        &QueryUpdate {
            existing_content: Some(existing.clone()),
            is_integrated: None,
        },
    )?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&updated)?);
    } else {
        println!("{existing}");
    }
    Ok(())
}

fn run_apply(args: &ApplyArgs, store: &mut SqliteQueryStore, root: &Path) -> Result<()> {
    let id = parse_query_id(&args.id)?;
    let record = require_record(store, id)?;

    let blocks = extract_code_blocks(&record.response);
    let report = apply_file_blocks(root, &blocks);

    if report.all_succeeded() {
        store.update(
            id,
            &QueryUpdate {
                existing_content: None,
                is_integrated: Some(true),
            },
        )?;
    }

    if args.json {
        let payload = build_apply_json_payload(id, &report);
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else {
        println!("{}", report.render());
    }
    Ok(())
}

fn run_history(args: &HistoryArgs, store: &SqliteQueryStore) -> Result<()> {
    let records = store.latest(args.limit)?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&records)?);
    } else {
        print_history_table(&records)?;
        println!("total stored queries: {}", store.count()?);
    }
    Ok(())
}

fn run_show(args: &ShowArgs, store: &SqliteQueryStore) -> Result<()> {
    let id = parse_query_id(&args.id)?;
    let record = require_record(store, id)?;
    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(())
}

fn run_folders(args: &FoldersArgs, root: &Path) -> Result<()> {
    let folders = list_project_folders(root)?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&folders)?);
    } else {
        for folder in &folders {
            println!("{folder}");
        }
    }
    Ok(())
}

fn require_record(store: &SqliteQueryStore, id: QueryId) -> Result<QueryRecord> {
    let Some(record) = store.get(id)? else {
        return Err(anyhow!("no query record with id {id}"));
    };
    Ok(record)
}

fn parse_query_id(raw: &str) -> Result<QueryId> {
    let parsed = Ulid::from_string(raw).with_context(|| format!("invalid ULID: {raw}"))?;
    Ok(QueryId(parsed))
}

fn print_history_table(records: &[QueryRecord]) -> Result<()> {
    println!(
        "{:<27} {:<32} {:<10} {:<7} question",
        "query_id", "created_at", "integrated", "tokens"
    );
    println!("{}", "-".repeat(110));

    for record in records {
        println!(
            "{:<27} {:<32} {:<10} {:<7} {}",
            record.id,
            format_rfc3339(record.created_at)?,
            if record.is_integrated { "yes" } else { "no" },
            record
                .token_count
                .map_or_else(|| "n/a".to_string(), |value| value.to_string()),
            first_line(&record.question, 48)
        );
    }
    Ok(())
}

fn first_line(text: &str, max_chars: usize) -> String {
    let line = text.lines().next().unwrap_or_default();
    if line.chars().count() <= max_chars {
        return line.to_string();
    }
    let truncated: String = line.chars().take(max_chars).collect();
    format!("{truncated}...")
}

#[derive(Debug, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct ApplyJsonPayload {
    contract_version: String,
    query_id: String,
    all_succeeded: bool,
    outcomes: Vec<BlockOutcome>,
}

fn build_apply_json_payload(id: QueryId, report: &ApplyReport) -> ApplyJsonPayload {
    ApplyJsonPayload {
        contract_version: "apply_report.v1".to_string(),
        query_id: id.to_string(),
        all_succeeded: report.all_succeeded(),
        outcomes: report.outcomes.clone(),
    }
}
