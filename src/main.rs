//! Run artifact store CLI
//!
//! Entry point for the `run-artifacts` command-line tool. Every command prints
//! a JSON document on stdout; diagnostics go to stderr.

use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use run_artifact_protocol::{ApiError, ApiRequest, ApiResponse};
use run_artifact_store::config::ENV_SIGNING_KEY;
use run_artifact_store::schema::{AdvisoryKind, ExplanationStatus};
use run_artifact_store::{
    dispatch, Access, AccessApi, AdvisoryRequest, EffectiveConfig, ListFilter, Migrator, RiskLevel,
    RunArtifactBuilder, RunStatus, Scope, StoreError,
};
use serde::Serialize;
use serde_json::{json, Value};
use std::fmt::Display;
use std::io::{BufRead, Read, Write};
use std::path::{Path, PathBuf};
use std::process;
use tracing::{debug, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Operation failed (validation, conflict, missing record, storage).
const EXIT_FAILURE: i32 = 1;
/// Configuration could not be resolved.
const EXIT_CONFIG: i32 = 2;

#[derive(Parser)]
#[command(name = "run-artifacts")]
#[command(about = "Immutable run artifact store for CAM decisions", version)]
struct Cli {
    /// Path to config file (default: run-artifacts.toml when present)
    #[arg(long, short = 'c', global = true)]
    config: Option<PathBuf>,

    /// Override the artifact store root
    #[arg(long, global = true)]
    artifact_root: Option<PathBuf>,

    /// Override the attachment store root
    #[arg(long, global = true)]
    attachment_root: Option<PathBuf>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a run artifact from a JSON document
    Create {
        /// JSON file to read, or `-` for stdin
        #[arg(long, short = 'f', default_value = "-")]
        file: PathBuf,
    },

    /// Print the merged view of a run
    Get {
        run_id: String,
    },

    /// List runs, newest first
    List {
        /// First partition date to include (YYYY-MM-DD)
        #[arg(long)]
        from: Option<NaiveDate>,

        /// Last partition date to include (YYYY-MM-DD)
        #[arg(long)]
        to: Option<NaiveDate>,

        #[arg(long)]
        status: Option<RunStatus>,

        #[arg(long, alias = "risk")]
        risk_level: Option<RiskLevel>,

        #[arg(long, alias = "tool")]
        tool_id: Option<String>,

        #[arg(long)]
        mode: Option<String>,

        #[arg(long)]
        limit: Option<usize>,
    },

    /// Link an advisory to a run (idempotent per advisory id)
    AttachAdvisory {
        run_id: String,

        advisory_id: String,

        /// Advisory kind (advisory, explanation, ...)
        #[arg(long, default_value = "advisory")]
        kind: String,

        #[arg(long)]
        engine_id: String,

        #[arg(long)]
        engine_version: Option<String>,

        #[arg(long)]
        request_id: Option<String>,
    },

    /// Record the explanation state of a run
    SetExplanation {
        run_id: String,

        /// NONE, PENDING, READY or ERROR
        status: ExplanationStatus,

        #[arg(long)]
        summary: Option<String>,
    },

    /// Attachment blob commands
    Attach {
        #[command(subcommand)]
        action: AttachCommands,
    },

    /// Compare two stored runs
    Diff {
        a: String,
        b: String,
    },

    /// Legacy store migration
    Migrate {
        /// Legacy JSON store to migrate from
        #[arg(long)]
        legacy_path: Option<PathBuf>,

        /// Directory holding timestamped backups
        #[arg(long)]
        backup_dir: Option<PathBuf>,

        #[command(subcommand)]
        action: MigrateCommands,
    },

    /// Serve API requests as JSON lines on stdin/stdout
    Serve,

    /// Print the effective configuration (secrets redacted)
    Config,
}

#[derive(Subcommand)]
enum AttachCommands {
    /// Store a file as an attachment
    Put {
        file: PathBuf,

        /// MIME-like content kind
        #[arg(long, default_value = "application/octet-stream")]
        kind: String,

        /// Display filename (default: the file's name)
        #[arg(long)]
        filename: Option<String>,

        /// Extension (default: the file's extension)
        #[arg(long)]
        ext: Option<String>,
    },

    /// Write attachment bytes to a file or stdout
    Get {
        sha256: String,

        #[arg(long, short = 'o')]
        out: Option<PathBuf>,

        /// Query string of a signed link
        #[arg(long)]
        signed_query: Option<String>,
    },

    /// Recompute a blob digest
    Verify {
        sha256: String,
    },

    /// Issue a signed link for an attachment
    Sign {
        sha256: String,

        #[arg(long, default_value = "download")]
        scope: Scope,

        /// Ask for a download disposition
        #[arg(long)]
        download: bool,

        #[arg(long)]
        filename: Option<String>,

        /// Link lifetime in seconds (default from config)
        #[arg(long)]
        ttl: Option<u64>,
    },

    /// Blob count and total size
    Stats,
}

#[derive(Subcommand)]
enum MigrateCommands {
    /// Compare legacy records with the store
    Status,

    /// Migrate legacy records
    Run {
        /// Validate and count without writing
        #[arg(long)]
        dry_run: bool,
    },

    /// Check migrated records against the legacy source
    Verify,

    /// Undo a migration from its backup (default: latest)
    Rollback {
        #[arg(long)]
        backup: Option<String>,
    },
}

fn main() {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    let effective = match load_config(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading config: {}", e);
            process::exit(EXIT_CONFIG);
        }
    };

    match cli.command {
        Commands::Config => run_config(&effective),
        command => {
            let api = match AccessApi::from_config(&effective) {
                Ok(api) => api,
                Err(e) => fail("Error opening store", e),
            };
            run_command(&api, &effective, command);
        }
    }
}

fn run_command(api: &AccessApi, effective: &EffectiveConfig, command: Commands) {
    match command {
        Commands::Create { file } => run_create(api, &file),
        Commands::Get { run_id } => emit(&or_fail(api.get_artifact(&run_id))),
        Commands::List {
            from,
            to,
            status,
            risk_level,
            tool_id,
            mode,
            limit,
        } => {
            let filter = ListFilter {
                from,
                to,
                status,
                risk_level,
                tool_id,
                mode,
                limit,
            };
            run_list(api, &filter);
        }
        Commands::AttachAdvisory {
            run_id,
            advisory_id,
            kind,
            engine_id,
            engine_version,
            request_id,
        } => {
            let kind: AdvisoryKind = match kind.parse() {
                Ok(kind) => kind,
                Err(never) => match never {},
            };
            let mut request = AdvisoryRequest::new(advisory_id, kind, engine_id);
            if let Some(version) = engine_version {
                request = request.with_engine_version(version);
            }
            if let Some(id) = request_id {
                request = request.with_request_id(id);
            }
            emit(&or_fail(api.attach_advisory(&run_id, &request)));
        }
        Commands::SetExplanation {
            run_id,
            status,
            summary,
        } => emit(&or_fail(api.set_explanation(&run_id, status, summary))),
        Commands::Attach { action } => run_attach(api, action),
        Commands::Diff { a, b } => emit(&or_fail(api.diff_artifacts(&a, &b))),
        Commands::Migrate {
            legacy_path,
            backup_dir,
            action,
        } => {
            let migration = &effective.config.migration;
            let migrator = Migrator::new(
                api.artifacts().clone(),
                legacy_path.unwrap_or_else(|| migration.legacy_path.clone()),
                backup_dir.unwrap_or_else(|| migration.backup_dir.clone()),
            );
            run_migrate(&migrator, action);
        }
        Commands::Serve => run_serve(api),
        Commands::Config => run_config(effective),
    }
}

fn init_logging(log_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Resolve config, with root flags as the CLI layer.
fn load_config(cli: &Cli) -> Result<EffectiveConfig, run_artifact_store::ConfigError> {
    let mut store = serde_json::Map::new();
    if let Some(root) = &cli.artifact_root {
        store.insert("artifact_root".to_string(), json!(root));
    }
    if let Some(root) = &cli.attachment_root {
        store.insert("attachment_root".to_string(), json!(root));
    }
    let overrides = (!store.is_empty()).then(|| json!({ "store": store }));
    EffectiveConfig::build(cli.config.as_deref(), overrides)
}

fn run_config(effective: &EffectiveConfig) {
    match effective.to_redacted_json() {
        Ok(value) => emit(&value),
        Err(e) => fail("Error serializing config", e),
    }
    if effective.config.signing.key.is_none() {
        eprintln!("Note: signed links are disabled; set {} to enable them.", ENV_SIGNING_KEY);
    }
}

fn run_create(api: &AccessApi, file: &Path) {
    let raw = match read_input(file) {
        Ok(raw) => raw,
        Err(e) => fail("Error reading input", e),
    };
    let input: RunArtifactBuilder = match serde_json::from_slice(&raw) {
        Ok(input) => input,
        Err(e) => fail("Invalid artifact JSON", e),
    };
    let artifact = or_fail(api.create_artifact(input));
    info!(run_id = %artifact.run_id, "created");
    emit(&artifact);
}

fn run_list(api: &AccessApi, filter: &ListFilter) {
    let result = or_fail(api.list_artifacts(filter));
    for skipped in &result.skipped {
        eprintln!("Warning: skipped {}: {}", skipped.path.display(), skipped.reason);
    }
    emit(&json!({
        "artifacts": result.artifacts,
        "count": result.artifacts.len(),
        "skipped_count": result.skipped.len(),
        "partial": result.is_partial(),
    }));
}

fn run_attach(api: &AccessApi, action: AttachCommands) {
    match action {
        AttachCommands::Put {
            file,
            kind,
            filename,
            ext,
        } => {
            let data = match std::fs::read(&file) {
                Ok(data) => data,
                Err(e) => fail(&format!("Error reading {}", file.display()), e),
            };
            let filename = filename.or_else(|| {
                file.file_name().map(|n| n.to_string_lossy().to_string())
            });
            let ext = ext
                .or_else(|| file.extension().map(|e| e.to_string_lossy().to_string()))
                .unwrap_or_default();
            emit(&or_fail(api.put_attachment(&data, &kind, filename.as_deref(), &ext)));
        }
        AttachCommands::Get {
            sha256,
            out,
            signed_query,
        } => {
            let access = match signed_query {
                Some(query) => Access::Signed {
                    method: "GET".to_string(),
                    query,
                },
                None => Access::Trusted,
            };
            let fetched = or_fail(api.fetch_attachment(&sha256, &access));
            let written = match &out {
                Some(path) => std::fs::write(path, &fetched.data),
                None => std::io::stdout().write_all(&fetched.data),
            };
            if let Err(e) = written {
                fail("Error writing attachment", e);
            }
            if out.is_some() {
                emit(&fetched.blob);
            }
        }
        AttachCommands::Verify { sha256 } => {
            let report = or_fail(api.verify_attachment(&sha256));
            emit(&report);
            if !report.ok {
                process::exit(EXIT_FAILURE);
            }
        }
        AttachCommands::Sign {
            sha256,
            scope,
            download,
            filename,
            ttl,
        } => emit(&or_fail(api.sign_attachment_url(
            &sha256,
            scope,
            download,
            filename.as_deref(),
            ttl,
        ))),
        AttachCommands::Stats => emit(&or_fail(api.attachments().stats())),
    }
}

fn run_migrate(migrator: &Migrator, action: MigrateCommands) {
    let outcome = match action {
        MigrateCommands::Status => migrator.status().map(|s| (to_value(&s), false)),
        MigrateCommands::Run { dry_run } => {
            let report = if dry_run {
                migrator.dry_run()
            } else {
                migrator.migrate()
            };
            report.map(|r| (to_value(&r), r.has_failures()))
        }
        MigrateCommands::Verify => migrator.verify().map(|r| (to_value(&r), !r.is_clean())),
        MigrateCommands::Rollback { backup } => migrator
            .rollback(backup.as_deref())
            .map(|r| (to_value(&r), false)),
    };

    match outcome {
        Ok((value, failed)) => {
            emit(&value);
            if failed {
                process::exit(EXIT_FAILURE);
            }
        }
        Err(e) => fail("Migration failed", e),
    }
}

/// One request per input line, one response per output line.
fn run_serve(api: &AccessApi) {
    let stdin = std::io::stdin();
    let mut stdout = std::io::stdout().lock();
    info!("serving requests on stdin");

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => fail("Error reading request", e),
        };
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<ApiRequest>(&line) {
            Ok(request) => {
                debug!(op = %request.op, request_id = %request.request_id, "request");
                dispatch(api, request)
            }
            Err(e) => ApiResponse::error(
                String::new(),
                ApiError::invalid_request(format!("malformed request: {}", e)),
            ),
        };
        let encoded = match serde_json::to_string(&response) {
            Ok(encoded) => encoded,
            Err(e) => fail("Error serializing response", e),
        };
        if let Err(e) = writeln!(stdout, "{}", encoded).and_then(|_| stdout.flush()) {
            fail("Error writing response", e);
        }
    }
}

fn read_input(file: &Path) -> std::io::Result<Vec<u8>> {
    if file.as_os_str() == "-" {
        let mut buf = Vec::new();
        std::io::stdin().read_to_end(&mut buf)?;
        Ok(buf)
    } else {
        std::fs::read(file)
    }
}

fn to_value<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

fn emit<T: Serialize + ?Sized>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{}", json),
        Err(e) => fail("Error serializing output", e),
    }
}

/// Print a store error as its API body and exit.
fn or_fail<T>(result: Result<T, StoreError>) -> T {
    match result {
        Ok(value) => value,
        Err(e) => {
            let body = ApiError::from(e);
            eprintln!("Error: {}", body);
            if let Some(data) = &body.data {
                eprintln!("  {}", data);
            }
            process::exit(EXIT_FAILURE);
        }
    }
}

fn fail(context: &str, err: impl Display) -> ! {
    eprintln!("{}: {}", context, err);
    process::exit(EXIT_FAILURE);
}
