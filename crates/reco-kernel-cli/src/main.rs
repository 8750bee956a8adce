use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use reco_kernel_api::{
    load_config, EngineRegistry, RecoKernelApi, RecommendationRequest, RedirectTarget,
    ScoreRecord,
};
use reco_kernel_core::{Item, RecoError};
use reco_kernel_store::SqliteKvStore;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing_subscriber::EnvFilter;
use ulid::Ulid;

const CLI_CONTRACT_VERSION: &str = "cli.v1";
const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Parser)]
#[command(name = "rk")]
#[command(about = "Recommendation kernel CLI")]
struct Cli {
    #[arg(long, default_value = "./reco_kernel.sqlite3")]
    db: PathBuf,

    /// Recommendation configuration (YAML or JSON). Required by every
    /// command except `db`.
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Catalog {
        #[command(subcommand)]
        command: CatalogCommand,
    },
    Filters {
        #[command(subcommand)]
        command: FiltersCommand,
    },
    Vector {
        #[command(subcommand)]
        command: VectorCommand,
    },
    Recommend(RecommendArgs),
    Redirect(RedirectArgs),
    /// Check a vector export directory against its manifest.
    VerifyExport {
        #[arg(long = "in")]
        input: PathBuf,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaStatus,
    Migrate,
    Backup(BackupArgs),
}

#[derive(Debug, Args)]
struct BackupArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Args)]
struct CatalogTarget {
    #[arg(long)]
    item_type: String,
    #[arg(long)]
    store_id: String,
}

#[derive(Debug, Subcommand)]
enum CatalogCommand {
    /// Replace the stored records from a JSON array or NDJSON file.
    Load {
        #[command(flatten)]
        target: CatalogTarget,
        #[arg(long = "in")]
        input: PathBuf,
    },
    /// Insert or overwrite records, keeping the rest of the catalog.
    Upsert {
        #[command(flatten)]
        target: CatalogTarget,
        #[arg(long = "in")]
        input: PathBuf,
    },
    /// Drop the records whose identities are listed in the input file.
    Remove {
        #[command(flatten)]
        target: CatalogTarget,
        #[arg(long = "in")]
        input: PathBuf,
    },
    Reconcile(CatalogTarget),
}

#[derive(Debug, Subcommand)]
enum FiltersCommand {
    Rebuild(CatalogTarget),
}

#[derive(Debug, Subcommand)]
enum VectorCommand {
    /// Replace an engine vector from NDJSON score records.
    Ingest {
        #[arg(long)]
        engine: String,
        #[arg(long = "in")]
        input: PathBuf,
    },
    Export {
        #[arg(long)]
        engine: String,
        #[arg(long)]
        out: PathBuf,
    },
}

#[derive(Debug, Args)]
struct ListingArgs {
    #[arg(long)]
    placement: String,
    /// Request variable as `name=value`; JSON values are parsed, repeats form a list.
    #[arg(long = "var")]
    variables: Vec<String>,
    #[arg(long)]
    seed: Option<u64>,
    #[arg(long)]
    variation_idx: Option<usize>,
    #[arg(long)]
    distribute_items: Option<bool>,
}

#[derive(Debug, Args)]
struct RecommendArgs {
    #[command(flatten)]
    listing: ListingArgs,
    #[arg(long, default_value_t = false)]
    show_details: bool,
    #[arg(long, default_value_t = false)]
    show_fallbacks: bool,
}

#[derive(Debug, Args)]
struct RedirectArgs {
    #[command(flatten)]
    listing: ListingArgs,
    #[arg(long)]
    item_idx: Option<usize>,
    #[arg(long)]
    slot_idx: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct ExportFile {
    path: String,
    records: usize,
    sha256: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct ExportManifest {
    export_id: String,
    engine: String,
    generated_at: String,
    files: Vec<ExportFile>,
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

fn emit<T: Serialize>(value: &T) -> Result<()> {
    emit_json(serde_json::to_value(value).context("failed to serialize command output")?)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Command::Db { command } => run_db(command, &SqliteKvStore::open(&cli.db)?),
        Command::VerifyExport { input } => emit(&verify_export(&input)?),
        Command::Catalog { command } => {
            run_catalog(command, &open_api(&cli.db, cli.config.as_deref())?).await
        }
        Command::Filters { command: FiltersCommand::Rebuild(target) } => {
            let api = open_api(&cli.db, cli.config.as_deref())?;
            emit(&api.rebuild_filters(&target.item_type, &target.store_id).await?)
        }
        Command::Vector { command } => {
            run_vector(command, &open_api(&cli.db, cli.config.as_deref())?).await
        }
        Command::Recommend(args) => {
            let api = open_api(&cli.db, cli.config.as_deref())?;
            let mut request = listing_request(&args.listing)?;
            request.show_details = args.show_details;
            request.show_fallbacks = args.show_fallbacks;
            emit(&api.recommend(&args.listing.placement, &request).await?)
        }
        Command::Redirect(args) => {
            let api = open_api(&cli.db, cli.config.as_deref())?;
            let request = listing_request(&args.listing)?;
            let target = RedirectTarget { item_idx: args.item_idx, slot_idx: args.slot_idx };
            emit(&api.redirect(&args.listing.placement, &request, target).await?)
        }
    }
}

fn open_api(db: &Path, config: Option<&Path>) -> Result<RecoKernelApi> {
    let config_path = config.ok_or_else(|| anyhow!("--config is required for this command"))?;
    let config = load_config(config_path)?;
    let store = SqliteKvStore::open_and_migrate(db)?;
    Ok(RecoKernelApi::new(Arc::new(store), config, EngineRegistry::with_defaults())?)
}

fn run_db(command: DbCommand, store: &SqliteKvStore) -> Result<()> {
    match command {
        DbCommand::SchemaStatus => {
            let status = store.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty()
            }))
        }
        DbCommand::Migrate => {
            let before = store.schema_status()?;
            store.migrate()?;
            let after = store.schema_status()?;
            emit_json(serde_json::json!({
                "before_version": before.current_version,
                "applied_versions": before.pending_versions,
                "after_version": after.current_version,
                "up_to_date": after.pending_versions.is_empty()
            }))
        }
        DbCommand::Backup(args) => {
            store.migrate()?;
            store.backup_database(&args.out)?;
            emit_json(serde_json::json!({
                "backup_path": args.out,
                "status": "ok"
            }))
        }
    }
}

async fn run_catalog(command: CatalogCommand, api: &RecoKernelApi) -> Result<()> {
    match command {
        CatalogCommand::Load { target, input } => {
            let items: Vec<Item> = read_records(&input)?;
            emit(&api.load_items(&target.item_type, &target.store_id, items).await?)
        }
        CatalogCommand::Upsert { target, input } => {
            let items: Vec<Item> = read_records(&input)?;
            emit(&api.upsert_items(&target.item_type, &target.store_id, items).await?)
        }
        CatalogCommand::Remove { target, input } => {
            let identities: Vec<Item> = read_records(&input)?;
            emit(&api.remove_items(&target.item_type, &target.store_id, &identities).await?)
        }
        CatalogCommand::Reconcile(target) => {
            emit(&api.reconcile(&target.item_type, &target.store_id).await?)
        }
    }
}

async fn run_vector(command: VectorCommand, api: &RecoKernelApi) -> Result<()> {
    match command {
        VectorCommand::Ingest { engine, input } => {
            let records: Vec<ScoreRecord> = read_records(&input)?;
            emit(&api.ingest(&engine, &records).await?)
        }
        VectorCommand::Export { engine, out } => {
            let records = api.export(&engine).await?;
            let manifest = write_export(&out, &engine, &records)?;
            emit_json(serde_json::json!({
                "out_dir": out,
                "manifest": manifest
            }))
        }
    }
}

fn listing_request(args: &ListingArgs) -> Result<RecommendationRequest, RecoError> {
    Ok(RecommendationRequest {
        variables: parse_variables(&args.variables)?,
        distribute_items: args.distribute_items,
        variation_idx: args.variation_idx,
        seed: args.seed,
        ..RecommendationRequest::default()
    })
}

/// Parse `name=value` pairs. Values are JSON when they parse and strings
/// otherwise; a repeated name collects its values into a list.
fn parse_variables(pairs: &[String]) -> Result<BTreeMap<String, Value>, RecoError> {
    let mut collected: BTreeMap<String, Vec<Value>> = BTreeMap::new();
    for pair in pairs {
        let (name, raw) = pair.split_once('=').ok_or_else(|| {
            RecoError::InvalidRequest(format!("variable must be name=value, got {pair}"))
        })?;
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        collected.entry(name.to_string()).or_default().push(value);
    }

    Ok(collected
        .into_iter()
        .map(|(name, mut values)| {
            let value = if values.len() == 1 { values.remove(0) } else { Value::Array(values) };
            (name, value)
        })
        .collect())
}

/// Read a JSON array, or one JSON document per non-empty line.
fn read_records<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read input file {}", path.display()))?;
    parse_records(&raw).with_context(|| format!("failed to parse records in {}", path.display()))
}

fn parse_records<T: DeserializeOwned>(raw: &str) -> Result<Vec<T>> {
    if raw.trim_start().starts_with('[') {
        return serde_json::from_str(raw).context("invalid JSON array");
    }
    raw.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(number, line)| {
            serde_json::from_str(line).with_context(|| format!("invalid record on line {}", number + 1))
        })
        .collect()
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

fn write_export(out_dir: &Path, engine: &str, records: &[ScoreRecord]) -> Result<ExportManifest> {
    fs::create_dir_all(out_dir)
        .with_context(|| format!("failed to create export directory {}", out_dir.display()))?;

    let mut body = String::new();
    for record in records {
        body.push_str(&serde_json::to_string(record)?);
        body.push('\n');
    }
    let file_name = format!("{engine}.ndjson");
    let file_path = out_dir.join(&file_name);
    fs::write(&file_path, body.as_bytes())
        .with_context(|| format!("failed to write export file {}", file_path.display()))?;

    let manifest = ExportManifest {
        export_id: Ulid::new().to_string(),
        engine: engine.to_string(),
        generated_at: OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .context("failed to format export timestamp")?,
        files: vec![ExportFile {
            path: file_name,
            records: records.len(),
            sha256: sha256_hex(body.as_bytes()),
        }],
    };
    let manifest_path = out_dir.join(MANIFEST_FILE);
    fs::write(&manifest_path, serde_json::to_vec_pretty(&manifest)?)
        .with_context(|| format!("failed to write manifest {}", manifest_path.display()))?;
    tracing::info!(engine, records = records.len(), out = %out_dir.display(), "vector exported");
    Ok(manifest)
}

fn verify_export(in_dir: &Path) -> Result<ExportManifest> {
    let manifest_path = in_dir.join(MANIFEST_FILE);
    let raw = fs::read(&manifest_path)
        .with_context(|| format!("failed to read manifest {}", manifest_path.display()))?;
    let manifest: ExportManifest = serde_json::from_slice(&raw)
        .with_context(|| format!("failed to parse manifest {}", manifest_path.display()))?;

    for file in &manifest.files {
        let path = in_dir.join(&file.path);
        let bytes =
            fs::read(&path).with_context(|| format!("failed to read export file {}", path.display()))?;
        let actual = sha256_hex(&bytes);
        if actual != file.sha256 {
            return Err(anyhow!(
                "checksum mismatch for {}: manifest {}, actual {actual}",
                file.path,
                file.sha256
            ));
        }
        let records = parse_records::<ScoreRecord>(&String::from_utf8_lossy(&bytes))?.len();
        if records != file.records {
            return Err(anyhow!(
                "record count mismatch for {}: manifest {}, actual {records}",
                file.path,
                file.records
            ));
        }
    }
    Ok(manifest)
}
