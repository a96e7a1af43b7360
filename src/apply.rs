//! Target database handles and the change applier
//!
//! `DbHandle` is the seam between the engine and a concrete database
//! client: execute one statement, report the dialect, and expose the column
//! catalog the reconciler diffs against. Implementations exist for the
//! PostgreSQL wire family (PostgreSQL, Redshift) over `tokio-postgres` and
//! for MySQL over `mysql_async`.
//!
//! The applier contract is statement-per-event: each rendered statement
//! runs in its own implicit transaction, and source transaction boundaries
//! are observed for logging only.

use crate::errors::{BridgeError, BridgeResult};
use crate::types::Dialect;
use async_trait::async_trait;
use tokio_postgres::NoTls;
use tracing::{debug, error, info};

/// A connected database endpoint the engine can run statements against.
#[async_trait]
pub trait DbHandle: Send {
    fn dialect(&self) -> Dialect;

    /// Execute one statement in its own implicit transaction, returning the
    /// affected row count where the client reports one.
    async fn execute(&mut self, sql: &str) -> BridgeResult<u64>;

    /// Column names and declared types for a table from
    /// `information_schema.columns`, in ordinal order. MySQL scopes the
    /// lookup by schema; the PostgreSQL family looks up by table name only.
    async fn table_columns(&mut self, table: &str) -> BridgeResult<Vec<(String, String)>>;
}

/// PostgreSQL-wire handle, also used for Redshift targets.
pub struct PostgresHandle {
    client: tokio_postgres::Client,
    dialect: Dialect,
}

impl PostgresHandle {
    pub async fn connect(url: &str, dialect: Dialect) -> BridgeResult<Self> {
        let (client, connection) = tokio_postgres::connect(url, NoTls)
            .await
            .map_err(|e| BridgeError::connection(format!("connecting to {dialect}: {e}")))?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("Postgres connection error: {e}");
            }
        });
        info!("Connected {dialect} handle");
        Ok(Self { client, dialect })
    }
}

#[async_trait]
impl DbHandle for PostgresHandle {
    fn dialect(&self) -> Dialect {
        self.dialect
    }

    async fn execute(&mut self, sql: &str) -> BridgeResult<u64> {
        Ok(self.client.execute(sql, &[]).await?)
    }

    async fn table_columns(&mut self, table: &str) -> BridgeResult<Vec<(String, String)>> {
        let rows = self
            .client
            .query(
                "SELECT column_name, data_type FROM information_schema.columns \
                 WHERE table_name = $1 ORDER BY ordinal_position",
                &[&table],
            )
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| (row.get(0), row.get(1)))
            .collect())
    }
}

/// MySQL handle over `mysql_async`.
pub struct MySqlHandle {
    conn: mysql_async::Conn,
    database: String,
}

impl MySqlHandle {
    pub async fn connect(url: &str) -> BridgeResult<Self> {
        let opts = mysql_async::Opts::from_url(url)
            .map_err(|e| BridgeError::connection(format!("invalid mysql url: {e}")))?;
        let database = opts.db_name().unwrap_or_default().to_string();
        let conn = mysql_async::Conn::new(opts)
            .await
            .map_err(|e| BridgeError::connection(format!("connecting to mysql: {e}")))?;
        info!("Connected mysql handle for database {database}");
        Ok(Self { conn, database })
    }
}

#[async_trait]
impl DbHandle for MySqlHandle {
    fn dialect(&self) -> Dialect {
        Dialect::Mysql
    }

    async fn execute(&mut self, sql: &str) -> BridgeResult<u64> {
        use mysql_async::prelude::*;
        self.conn.query_drop(sql).await?;
        Ok(self.conn.affected_rows())
    }

    async fn table_columns(&mut self, table: &str) -> BridgeResult<Vec<(String, String)>> {
        use mysql_async::prelude::*;
        let rows: Vec<(String, String)> = self
            .conn
            .exec(
                "SELECT column_name, data_type FROM information_schema.columns \
                 WHERE table_name = ? AND table_schema = ? \
                 ORDER BY ordinal_position",
                (table, &self.database),
            )
            .await?;
        Ok(rows)
    }
}

/// Connect a handle for the given dialect and connection string.
pub async fn connect_handle(dialect: Dialect, url: &str) -> BridgeResult<Box<dyn DbHandle>> {
    match dialect {
        Dialect::Postgresql | Dialect::Redshift => {
            Ok(Box::new(PostgresHandle::connect(url, dialect).await?))
        }
        Dialect::Mysql => Ok(Box::new(MySqlHandle::connect(url).await?)),
    }
}

/// Executes rendered statements on the target, one implicit transaction per
/// statement.
pub struct Applier {
    target: Box<dyn DbHandle>,
}

impl Applier {
    pub fn new(target: Box<dyn DbHandle>) -> Self {
        Self { target }
    }

    pub fn dialect(&self) -> Dialect {
        self.target.dialect()
    }

    /// Run one statement on the target. Failures come back as apply errors
    /// so the worker can log and move to the next record; the statement's
    /// implicit transaction has already rolled back on the server.
    pub async fn apply(&mut self, sql: &str) -> BridgeResult<u64> {
        debug!("Applying: {sql}");
        match self.target.execute(sql).await {
            Ok(rows) => {
                debug!("Applied, {rows} row(s) affected");
                Ok(rows)
            }
            Err(e) => Err(BridgeError::apply(format!("{e} while executing: {sql}"))),
        }
    }
}
