//! The SQLite backend: connection pools per connection class, the bootstrap
//! of the metadata tables and the committed metadata repository, and the
//! retrying entry points used by callers that do not manage transactions.
//!
//! A file database runs in WAL mode with a busy timeout. Without a path the
//! backend uses a named shared-cache in-memory database, kept alive by one
//! connection held for the lifetime of the backend.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// used for persistence
use rusqlite::{Connection, OpenFlags};
// used for did sets
use roaring::RoaringTreemap;

use tracing::{debug, info, instrument, warn};

use crate::config::StoreConfig;
use crate::dialect::{ConnectionClass, SqlDialect};
use crate::document::Document;
use crate::error::{DocShredError, Result};
use crate::handler::{Context, ErrorHandler, Retrier};
use crate::identifier::IdentifierFactory;
use crate::meta::{MetaIndexField, MetaSnapshot};
use crate::persist::MetaPersistor;
use crate::pool::fan_out;
use crate::repository::MetaRepository;
use crate::transaction::{ReadTransaction, WriteTransaction};

static MEMORY_DATABASES: AtomicUsize = AtomicUsize::new(0);

// ------------- Connections -------------
/// Idle connections of one class. Connections are opened on demand and up to
/// `capacity` of them are kept after use.
#[derive(Debug)]
struct ConnectionPool {
    class: ConnectionClass,
    idle: Mutex<Vec<Connection>>,
    capacity: usize,
}

impl ConnectionPool {
    fn new(class: ConnectionClass, capacity: usize) -> Self {
        Self {
            class,
            idle: Mutex::new(Vec::new()),
            capacity,
        }
    }
}

/// A connection on loan from a pool; it goes back when dropped unless discarded.
#[derive(Debug)]
pub struct PooledConnection<'p> {
    pool: &'p ConnectionPool,
    connection: Option<Connection>,
    discard: bool,
}

impl PooledConnection<'_> {
    pub fn get(&self) -> Result<&Connection> {
        self.connection
            .as_ref()
            .ok_or_else(|| DocShredError::Invariant(String::from("the connection was already released")))
    }
    /// Closes the connection instead of returning it, for connections left in an unknown state.
    pub fn discard(&mut self) {
        self.discard = true;
    }
}

impl Drop for PooledConnection<'_> {
    fn drop(&mut self) {
        let Some(connection) = self.connection.take() else { return };
        if self.discard {
            debug!(class = self.pool.class.name(), "discarding connection");
            return;
        }
        if let Ok(mut idle) = self.pool.idle.lock() {
            if idle.len() < self.pool.capacity {
                idle.push(connection);
            }
        }
    }
}

// ------------- Backend -------------
pub struct Backend {
    config: StoreConfig,
    dialect: Arc<dyn SqlDialect>,
    handler: ErrorHandler,
    factory: IdentifierFactory,
    repository: MetaRepository,
    location: String,
    in_memory: bool,
    session: ConnectionPool,
    system: ConnectionPool,
    read_only: ConnectionPool,
    import_mode: AtomicBool,
    retrier: Retrier,
    // keeps a shared-cache in-memory database alive
    _keeper: Option<Mutex<Connection>>,
}

impl Backend {
    /// Opens (or creates) the store described by `config`, creating the
    /// metadata tables and loading the committed metadata.
    #[instrument(skip_all, fields(path = ?config.path, dialect = ?config.dialect))]
    pub fn open(config: StoreConfig) -> Result<Self> {
        let dialect = config.dialect.build()?;
        if !dialect.can_execute() {
            return Err(DocShredError::Unsupported(format!(
                "the {} dialect only renders statements",
                dialect.name()
            )));
        }
        let (location, in_memory) = match &config.path {
            Some(path) => (path.to_string_lossy().into_owned(), false),
            None => (
                format!(
                    "file:docshred-{}-{}?mode=memory&cache=shared",
                    std::process::id(),
                    MEMORY_DATABASES.fetch_add(1, Ordering::Relaxed)
                ),
                true,
            ),
        };
        let mut backend = Self {
            handler: dialect.error_handler(),
            factory: IdentifierFactory::new(dialect.identifier_constraints()),
            repository: MetaRepository::new(MetaSnapshot::new(), 0),
            location,
            in_memory,
            session: ConnectionPool::new(ConnectionClass::Session, config.pool_size),
            system: ConnectionPool::new(ConnectionClass::System, config.pool_size),
            read_only: ConnectionPool::new(ConnectionClass::ReadOnly, config.pool_size),
            import_mode: AtomicBool::new(config.data_import_mode),
            retrier: Retrier::new(config.max_retries, Duration::from_millis(config.retry_backoff_ms)),
            _keeper: None,
            dialect,
            config,
        };
        if backend.in_memory {
            backend._keeper = Some(Mutex::new(backend.open_connection(ConnectionClass::System)?));
        }
        backend.retrier.run(|_| backend.bootstrap())?;
        info!(location = %backend.location, "store opened");
        Ok(backend)
    }
    pub fn open_in_memory() -> Result<Self> {
        Self::open(StoreConfig::in_memory())
    }
    pub fn open_path(path: impl AsRef<Path>) -> Result<Self> {
        Self::open(StoreConfig::with_path(path.as_ref()))
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }
    pub fn dialect(&self) -> &dyn SqlDialect {
        &*self.dialect
    }
    pub fn factory(&self) -> &IdentifierFactory {
        &self.factory
    }
    pub(crate) fn handler(&self) -> &ErrorHandler {
        &self.handler
    }
    pub fn is_in_memory(&self) -> bool {
        self.in_memory
    }
    /// The committed metadata as last seen by this backend.
    pub fn snapshot(&self) -> Result<Arc<MetaSnapshot>> {
        self.repository.snapshot()
    }
    pub(crate) fn repository(&self) -> &MetaRepository {
        &self.repository
    }
    pub fn is_data_import_mode(&self) -> bool {
        self.import_mode.load(Ordering::Acquire)
    }

    fn pool(&self, class: ConnectionClass) -> &ConnectionPool {
        match class {
            ConnectionClass::Session => &self.session,
            ConnectionClass::System => &self.system,
            ConnectionClass::ReadOnly => &self.read_only,
        }
    }
    fn open_connection(&self, class: ConnectionClass) -> Result<Connection> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let connection = self
            .handler
            .check(Context::Connect, Connection::open_with_flags(&self.location, flags))?;
        self.apply_pragmas(&connection, class)?;
        debug!(class = class.name(), "connection opened");
        Ok(connection)
    }
    fn apply_pragmas(&self, connection: &Connection, class: ConnectionClass) -> Result<()> {
        let handler = &self.handler;
        handler.check(
            Context::Connect,
            connection.busy_timeout(Duration::from_millis(self.config.busy_timeout_ms)),
        )?;
        handler.check(Context::Connect, connection.pragma_update(None, "foreign_keys", true))?;
        if !self.in_memory {
            let mode: String = handler.check(
                Context::Connect,
                connection.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0)),
            )?;
            if !mode.eq_ignore_ascii_case("wal") {
                warn!(mode = %mode, "write-ahead logging unavailable");
            }
            handler.check(Context::Connect, connection.pragma_update(None, "synchronous", "NORMAL"))?;
        }
        if class == ConnectionClass::ReadOnly {
            handler.check(Context::Connect, connection.pragma_update(None, "query_only", true))?;
        }
        Ok(())
    }
    pub(crate) fn acquire(&self, class: ConnectionClass) -> Result<PooledConnection<'_>> {
        let pool = self.pool(class);
        let idle = pool.idle.lock()?.pop();
        let connection = match idle {
            Some(connection) => connection,
            None => self.open_connection(class)?,
        };
        Ok(PooledConnection {
            pool,
            connection: Some(connection),
            discard: false,
        })
    }
    /// The committed snapshot matching the stored version, reloading it
    /// through `connection` when the repository is behind.
    pub(crate) fn snapshot_for(&self, connection: &Connection) -> Result<Arc<MetaSnapshot>> {
        let persistor = MetaPersistor::new(connection, &*self.dialect);
        let version = persistor.version()?;
        match self.repository.snapshot_at(version)? {
            Some(snapshot) => Ok(snapshot),
            None => {
                debug!(version, "metadata behind the stored version");
                self.repository.replace(persistor.load_snapshot()?, version)
            }
        }
    }
    fn bootstrap(&self) -> Result<()> {
        let mut pooled = self.acquire(ConnectionClass::System)?;
        let connection = pooled.get()?;
        self.handler.check(
            Context::Connect,
            connection.execute_batch(self.dialect.begin_statement(ConnectionClass::System)),
        )?;
        let loaded = (|| -> Result<(MetaSnapshot, u64)> {
            let persistor = MetaPersistor::new(connection, &*self.dialect);
            persistor.create_tables()?;
            Ok((persistor.load_snapshot()?, persistor.version()?))
        })();
        match loaded {
            Ok((snapshot, version)) => {
                self.handler
                    .check(Context::Commit, connection.execute_batch(self.dialect.commit_statement()))?;
                self.repository.replace(snapshot, version)?;
                Ok(())
            }
            Err(e) => {
                if connection.execute_batch(self.dialect.rollback_statement()).is_err() {
                    pooled.discard();
                }
                Err(e)
            }
        }
    }

    // ------------- Transactions -------------
    pub fn begin_write(&self) -> Result<WriteTransaction<'_>> {
        WriteTransaction::begin(self, ConnectionClass::Session)
    }
    pub fn begin_exclusive(&self) -> Result<WriteTransaction<'_>> {
        WriteTransaction::begin(self, ConnectionClass::System)
    }
    pub fn begin_read(&self) -> Result<ReadTransaction<'_>> {
        ReadTransaction::begin(self)
    }
    fn with_retry<T>(
        &self,
        class: ConnectionClass,
        mut body: impl FnMut(&mut WriteTransaction<'_>) -> Result<T>,
    ) -> Result<T> {
        self.retrier.run(|attempt| {
            if attempt > 1 {
                debug!(attempt, class = class.name(), "running the transaction again");
            }
            let mut transaction = WriteTransaction::begin(self, class)?;
            let outcome = body(&mut transaction)?;
            transaction.commit()?;
            Ok(outcome)
        })
    }
    /// Runs `body` in a session transaction and commits, starting over on
    /// failures classified as rollbacks.
    pub fn with_write_retry<T>(&self, body: impl FnMut(&mut WriteTransaction<'_>) -> Result<T>) -> Result<T> {
        self.with_retry(ConnectionClass::Session, body)
    }
    /// Like [`Backend::with_write_retry`] on the exclusive connection class.
    pub fn with_exclusive_retry<T>(&self, body: impl FnMut(&mut WriteTransaction<'_>) -> Result<T>) -> Result<T> {
        self.with_retry(ConnectionClass::System, body)
    }
    pub fn with_read_retry<T>(&self, mut body: impl FnMut(&ReadTransaction<'_>) -> Result<T>) -> Result<T> {
        self.retrier.run(|_| {
            let transaction = self.begin_read()?;
            let outcome = body(&transaction)?;
            transaction.close()?;
            Ok(outcome)
        })
    }

    // ------------- Operations -------------
    /// Stores documents keyed by did and returns the number of rows written.
    #[instrument(skip(self, documents), fields(documents = documents.len()))]
    pub fn insert_documents(&self, database: &str, collection: &str, documents: &[(u64, Document)]) -> Result<usize> {
        self.with_write_retry(|transaction| {
            transaction.insert(database, collection, documents.iter().map(|(did, document)| (*did, document)))
        })
    }
    #[instrument(skip(self, dids), fields(dids = dids.len()))]
    pub fn read_documents(
        &self,
        database: &str,
        collection: &str,
        dids: &RoaringTreemap,
    ) -> Result<BTreeMap<u64, Document>> {
        self.with_read_retry(|transaction| transaction.read_documents(database, collection, dids))
    }
    #[instrument(skip(self, dids), fields(dids = dids.len()))]
    pub fn delete_documents(&self, database: &str, collection: &str, dids: &RoaringTreemap) -> Result<u64> {
        self.with_write_retry(|transaction| transaction.delete_documents(database, collection, dids))
    }
    #[instrument(skip(self, fields))]
    pub fn create_index(
        &self,
        database: &str,
        collection: &str,
        name: &str,
        unique: bool,
        fields: &[MetaIndexField],
    ) -> Result<()> {
        self.with_exclusive_retry(|transaction| {
            transaction.create_index(database, collection, name, unique, fields.to_vec())
        })
    }
    #[instrument(skip(self))]
    pub fn drop_index(&self, database: &str, collection: &str, name: &str) -> Result<()> {
        self.with_exclusive_retry(|transaction| transaction.drop_index(database, collection, name))
    }
    #[instrument(skip(self))]
    pub fn drop_collection(&self, database: &str, collection: &str) -> Result<()> {
        self.with_exclusive_retry(|transaction| transaction.drop_collection(database, collection))
    }
    #[instrument(skip(self))]
    pub fn drop_database(&self, database: &str) -> Result<()> {
        self.with_exclusive_retry(|transaction| transaction.drop_database(database))
    }
    #[instrument(skip(self))]
    pub fn rename_collection(
        &self,
        from_database: &str,
        from_collection: &str,
        to_database: &str,
        to_collection: &str,
    ) -> Result<()> {
        self.with_exclusive_retry(|transaction| {
            transaction.rename_collection(from_database, from_collection, to_database, to_collection)
        })
    }

    // ------------- Data import mode -------------
    /// Switches data import mode. While it is on, new document parts get no
    /// internal indexes; switching it off builds them for every document
    /// part and refreshes the statistics, spread over the worker threads.
    #[instrument(skip(self))]
    pub fn set_data_import_mode(&self, enabled: bool) -> Result<()> {
        let was_enabled = self.import_mode.swap(enabled, Ordering::AcqRel);
        if was_enabled && !enabled {
            self.build_internal_indexes()?;
        }
        Ok(())
    }
    fn build_internal_indexes(&self) -> Result<()> {
        let snapshot = self.with_read_retry(|transaction| Ok(Arc::clone(transaction.snapshot())))?;
        let tasks: Vec<(String, String, bool)> = snapshot
            .databases()
            .flat_map(|database| {
                database.collections().flat_map(move |collection| {
                    collection.doc_parts().map(move |doc_part| {
                        (
                            database.identifier().to_string(),
                            doc_part.identifier().to_string(),
                            doc_part.table_ref().is_root(),
                        )
                    })
                })
            })
            .collect();
        // writers of a shared-cache database serialize on table locks anyway
        let workers = if self.in_memory { 1 } else { self.config.worker_threads };
        info!(tables = tasks.len(), workers, "building internal indexes");
        fan_out(workers, &tasks, |(schema, table, is_root)| {
            self.with_write_retry(|transaction| transaction.build_internal_indexes(schema, table, *is_root))
        })
    }
}
