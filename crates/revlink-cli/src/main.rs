use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use revlink_core::{BranchId, ContainerAssignment, Link, ObjectId, VersionedRow, CURRENT_REV};
use revlink_store_sqlite::{InlineRequest, SqliteStore};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "revlink")]
#[command(about = "Temporal link-inlining migration CLI for a revision-versioned store")]
struct Cli {
    #[arg(long, default_value = "./revlink.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: Box<DbCommand>,
    },
    Row {
        #[command(subcommand)]
        command: Box<RowCommand>,
    },
    Link {
        #[command(subcommand)]
        command: Box<LinkCommand>,
    },
    Xref {
        #[command(subcommand)]
        command: Box<XrefCommand>,
    },
    Inline {
        #[command(subcommand)]
        command: Box<InlineCommand>,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Subcommand)]
enum RowCommand {
    Add(RowAddArgs),
    List(RowListArgs),
}

#[derive(Debug, Args)]
struct RowAddArgs {
    #[arg(long)]
    table: String,
    #[arg(long, default_value_t = 1)]
    branch: i64,
    #[arg(long)]
    id: i64,
    #[arg(long)]
    rev_min: i64,
    /// Omitted means the row is still current.
    #[arg(long)]
    rev_max: Option<i64>,
    /// Defaults to `rev_min`.
    #[arg(long)]
    rev_create: Option<i64>,
    /// Opaque row attributes as a JSON object.
    #[arg(long, default_value = "{}")]
    attributes: String,
    #[arg(long)]
    container_id: Option<i64>,
    #[arg(long)]
    container_type: Option<String>,
    #[arg(long)]
    container_reference: Option<i64>,
    #[arg(long)]
    sort_order: Option<i64>,
}

#[derive(Debug, Args)]
struct RowListArgs {
    #[arg(long)]
    table: String,
    #[arg(long, default_value_t = 1)]
    branch: i64,
    #[arg(long)]
    id: Option<i64>,
}

#[derive(Debug, Subcommand)]
enum LinkCommand {
    Add(LinkAddArgs),
}

#[derive(Debug, Args)]
struct LinkAddArgs {
    #[arg(long)]
    reference_id: i64,
    #[arg(long)]
    source_table: String,
    #[arg(long, default_value_t = 1)]
    branch: i64,
    #[arg(long)]
    id: i64,
    #[arg(long)]
    rev_min: i64,
    /// Omitted means the link is still current.
    #[arg(long)]
    rev_max: Option<i64>,
    #[arg(long)]
    src_id: i64,
    #[arg(long)]
    src_type: String,
    #[arg(long)]
    dest_id: i64,
    #[arg(long)]
    dest_type: String,
    #[arg(long)]
    sort_order: Option<i64>,
}

#[derive(Debug, Subcommand)]
enum XrefCommand {
    List(XrefListArgs),
}

#[derive(Debug, Args)]
struct XrefListArgs {
    #[arg(long, default_value_t = 1)]
    branch: i64,
    #[arg(long)]
    table: String,
}

#[derive(Debug, Subcommand)]
enum InlineCommand {
    Run(InlineRunArgs),
}

#[derive(Debug, Args)]
struct InlineRunArgs {
    #[arg(long, default_value_t = 1)]
    branch: i64,
    #[arg(long)]
    reference_id: i64,
    #[arg(long)]
    source_table: String,
    #[arg(long = "source-id")]
    source_ids: Vec<i64>,
    #[arg(long, default_value_t = false)]
    dry_run: bool,
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

// Diagnostics go to stderr so stdout stays pure JSON.
fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("revlink=info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(io::stderr).init();
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let mut store = SqliteStore::open(&cli.db)?;
    match cli.command {
        Command::Db { command } => run_db(*command, &mut store),
        Command::Row { command } => run_row(*command, &mut store),
        Command::Link { command } => run_link(*command, &mut store),
        Command::Xref { command } => run_xref(*command, &store),
        Command::Inline { command } => run_inline(*command, &mut store),
    }
}

fn run_db(command: DbCommand, store: &mut SqliteStore) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = store.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty()
            }))
        }
        DbCommand::Migrate(args) => {
            let before = store.schema_status()?;
            if args.dry_run {
                return emit_json(serde_json::json!({
                    "dry_run": true,
                    "current_version": before.current_version,
                    "target_version": before.target_version,
                    "would_apply_versions": before.pending_versions
                }));
            }

            store.migrate()?;
            let after = store.schema_status()?;
            emit_json(serde_json::json!({
                "dry_run": false,
                "before_version": before.current_version,
                "applied_versions": before.pending_versions,
                "after_version": after.current_version,
                "up_to_date": after.pending_versions.is_empty()
            }))
        }
    }
}

fn run_row(command: RowCommand, store: &mut SqliteStore) -> Result<()> {
    match command {
        RowCommand::Add(args) => {
            let attributes: BTreeMap<String, Value> = serde_json::from_str(&args.attributes)
                .context("--attributes must be a JSON object")?;
            let container = parse_container(
                args.container_id,
                args.container_type,
                args.container_reference,
                args.sort_order,
            )?;
            let row = VersionedRow {
                branch: BranchId(args.branch),
                id: ObjectId(args.id),
                rev_min: args.rev_min,
                rev_max: args.rev_max.unwrap_or(CURRENT_REV),
                rev_create: args.rev_create.unwrap_or(args.rev_min),
                container,
                attributes,
            };
            store.insert_row(&args.table, &row)?;
            emit_json(serde_json::json!({
                "inserted": true,
                "table": args.table,
                "branch": row.branch.0,
                "id": row.id.0,
                "rev_min": row.rev_min,
                "rev_max": row.rev_max
            }))
        }
        RowCommand::List(args) => {
            let rows = store.list_rows(
                &args.table,
                BranchId(args.branch),
                args.id.map(ObjectId),
            )?;
            emit_json(serde_json::json!({
                "table": args.table,
                "branch": args.branch,
                "count": rows.len(),
                "rows": serde_json::to_value(&rows).context("failed to serialize rows")?
            }))
        }
    }
}

fn run_link(command: LinkCommand, store: &mut SqliteStore) -> Result<()> {
    match command {
        LinkCommand::Add(args) => {
            let link = Link {
                branch: BranchId(args.branch),
                id: ObjectId(args.id),
                rev_min: args.rev_min,
                rev_max: args.rev_max.unwrap_or(CURRENT_REV),
                src_id: ObjectId(args.src_id),
                src_type: args.src_type,
                dest_id: ObjectId(args.dest_id),
                dest_type: args.dest_type,
                sort_order: args.sort_order,
            };
            store.insert_link(ObjectId(args.reference_id), &args.source_table, &link)?;
            emit_json(serde_json::json!({
                "inserted": true,
                "branch": link.branch.0,
                "id": link.id.0,
                "dest_type": link.dest_type,
                "dest_id": link.dest_id.0
            }))
        }
    }
}

fn run_xref(command: XrefCommand, store: &SqliteStore) -> Result<()> {
    match command {
        XrefCommand::List(args) => {
            let revisions = store.list_touched(BranchId(args.branch), &args.table)?;
            emit_json(serde_json::json!({
                "branch": args.branch,
                "table": args.table,
                "count": revisions.len(),
                "revisions": revisions
            }))
        }
    }
}

fn run_inline(command: InlineCommand, store: &mut SqliteStore) -> Result<()> {
    match command {
        InlineCommand::Run(args) => {
            let request = InlineRequest {
                branch: BranchId(args.branch),
                reference_id: ObjectId(args.reference_id),
                source_table: args.source_table,
                source_ids: args.source_ids.into_iter().map(ObjectId).collect(),
            };
            let summary = store.run_inline(&request, args.dry_run)?;
            emit_json(serde_json::to_value(&summary).context("failed to serialize summary")?)
        }
    }
}

fn parse_container(
    container_id: Option<i64>,
    container_type: Option<String>,
    container_reference: Option<i64>,
    sort_order: Option<i64>,
) -> Result<Option<ContainerAssignment>> {
    match (container_id, container_type) {
        (Some(container_id), Some(container_type)) => Ok(Some(ContainerAssignment {
            container_id: ObjectId(container_id),
            container_type,
            container_reference: container_reference.map(ObjectId),
            sort_order,
        })),
        (None, None) => Ok(None),
        _ => Err(anyhow!("--container-id and --container-type must be provided together")),
    }
}
