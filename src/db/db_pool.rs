use duckdb::{AccessMode, Config, Connection};
use r2d2::ManageConnection;
use std::sync::{Mutex, PoisonError};

pub const IN_MEMORY: &str = ":memory:";

/// r2d2 manager handing out connections to one DuckDB database.
///
/// The database is opened once; pooled connections are clones of that handle
/// so they share one instance and its access mode.
pub struct DuckDBConnectionManager {
    connection_string: String,
    read_only: bool,
    root: Mutex<Connection>,
}

impl DuckDBConnectionManager {
    /// Opens the database. `read_only` is ignored for in-memory databases,
    /// which DuckDB cannot open read-only.
    pub fn open(connection_string: &str, read_only: bool) -> Result<Self, duckdb::Error> {
        let in_memory = connection_string == IN_MEMORY;
        let root = if in_memory {
            Connection::open_in_memory()?
        } else if read_only {
            let config = Config::default().access_mode(AccessMode::ReadOnly)?;
            Connection::open_with_flags(connection_string, config)?
        } else {
            Connection::open(connection_string)?
        };

        Ok(Self {
            connection_string: connection_string.to_string(),
            read_only: read_only && !in_memory,
            root: Mutex::new(root),
        })
    }

    pub fn connection_string(&self) -> &str {
        &self.connection_string
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }
}

impl ManageConnection for DuckDBConnectionManager {
    type Connection = Connection;
    type Error = duckdb::Error;

    fn connect(&self) -> Result<Self::Connection, Self::Error> {
        self.root
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .try_clone()
    }

    fn is_valid(&self, conn: &mut Self::Connection) -> Result<(), Self::Error> {
        conn.execute_batch("SELECT 1")
    }

    fn has_broken(&self, _conn: &mut Self::Connection) -> bool {
        false
    }
}
