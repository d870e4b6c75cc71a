use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use roaring::RoaringTreemap;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt};

use docshred::backend::Backend;
use docshred::config::{DialectKind, StoreConfig};
use docshred::document::Document;
use docshred::error::{DocShredError, Result};
use docshred::meta::MetaSnapshot;
use docshred::plan::plan_insert;

/// Stores JSON documents in SQL tables derived from their shape
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// Settings file (TOML); DOCSHRED_* environment variables override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Database file, overriding the configured path
    #[arg(long, global = true)]
    path: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Insert documents read from a JSON Lines file
    Insert {
        database: String,
        collection: String,
        input: PathBuf,
        /// Did of the first document; the following ones count up from it
        #[arg(long, default_value_t = 1)]
        first_did: u64,
        /// Defer internal indexes until the import is finished
        #[arg(long)]
        import: bool,
    },
    /// Print documents one per line: the did, a tab, then the document as JSON
    Read {
        database: String,
        collection: String,
        /// Dids to read; every document when absent
        #[arg(long, value_delimiter = ',')]
        dids: Vec<u64>,
    },
    /// Print the statements inserting a JSON Lines file into an empty store would run
    Plan {
        database: String,
        collection: String,
        input: PathBuf,
        #[arg(long, value_enum, default_value = "sqlite")]
        dialect: DialectArg,
        #[arg(long, default_value_t = 1)]
        first_did: u64,
    },
    /// Build the internal indexes deferred by imports
    FinishImport,
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum DialectArg {
    Sqlite,
    Postgres,
}

impl From<DialectArg> for DialectKind {
    fn from(arg: DialectArg) -> Self {
        match arg {
            DialectArg::Sqlite => DialectKind::Sqlite,
            DialectArg::Postgres => DialectKind::Postgres,
        }
    }
}

fn read_documents(input: &Path, first_did: u64) -> Result<Vec<(u64, Document)>> {
    let text = fs::read_to_string(input)
        .map_err(|e| DocShredError::Document(format!("{}: {}", input.display(), e)))?;
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .zip(first_did..)
        .map(|(line, did)| Document::from_json_str(line).map(|document| (did, document)))
        .collect()
}

fn run(cli: Cli) -> Result<()> {
    let mut config = StoreConfig::load(cli.config.as_deref())?;
    if cli.path.is_some() {
        config.path = cli.path;
    }
    match cli.command {
        Command::Insert { database, collection, input, first_did, import } => {
            let documents = read_documents(&input, first_did)?;
            config.data_import_mode = import;
            let backend = Backend::open(config)?;
            let rows = backend.insert_documents(&database, &collection, &documents)?;
            info!(documents = documents.len(), rows, "inserted");
        }
        Command::Read { database, collection, dids } => {
            let backend = Backend::open(config)?;
            let dids: RoaringTreemap = if dids.is_empty() {
                backend.with_read_retry(|transaction| transaction.list_dids(&database, &collection))?
            } else {
                dids.into_iter().collect()
            };
            for (did, document) in backend.read_documents(&database, &collection, &dids)? {
                println!("{}\t{}", did, document.to_json());
            }
        }
        Command::Plan { database, collection, input, dialect, first_did } => {
            let documents = read_documents(&input, first_did)?;
            config.dialect = dialect.into();
            let sql = config.dialect.build()?;
            let statements = plan_insert(
                &*sql,
                &config,
                &MetaSnapshot::new(),
                &database,
                &collection,
                documents.iter().map(|(did, document)| (*did, document)),
            )?;
            for statement in statements {
                println!("{}", statement);
            }
        }
        Command::FinishImport => {
            config.data_import_mode = true;
            let backend = Backend::open(config)?;
            backend.set_data_import_mode(false)?;
            info!("internal indexes built");
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "failed");
            ExitCode::FAILURE
        }
    }
}
