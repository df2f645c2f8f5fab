use chrono::Utc;
use fleet_core::model::{
    Agent, AgentId, Availability, Coordinates, Package, PackageId, PackageState, PositionSample,
};
use fleet_core::{FleetStore, StoreError};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

pub const FLEET_SCHEMA_VERSION: i64 = 1;
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
}

impl From<StorageError> for StoreError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Sqlite(err) => sqlite_to_store(err),
            other => StoreError::Rejected(other.to_string()),
        }
    }
}

/// Busy and locked databases clear on their own; everything else is a
/// rejection the caller should not retry.
fn sqlite_to_store(err: rusqlite::Error) -> StoreError {
    match &err {
        rusqlite::Error::SqliteFailure(failure, _)
            if matches!(
                failure.code,
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
            ) =>
        {
            StoreError::Unavailable(err.to_string())
        }
        rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound(err.to_string()),
        _ => StoreError::Rejected(err.to_string()),
    }
}

pub struct SqliteFleetStore {
    conn: Mutex<Connection>,
}

impl SqliteFleetStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        Self::open_with_busy_timeout(path, DEFAULT_BUSY_TIMEOUT)
    }

    pub fn open_with_busy_timeout(
        path: impl AsRef<Path>,
        busy_timeout: Duration,
    ) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StorageError> {
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn schema_version(&self) -> Result<i64, StorageError> {
        Ok(self
            .conn()
            .query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    pub fn migrate(&self) -> Result<(), StorageError> {
        let current = self.schema_version()?;
        if current > FLEET_SCHEMA_VERSION {
            return Err(StorageError::UnsupportedSchemaVersion {
                found: current,
                supported: FLEET_SCHEMA_VERSION,
            });
        }

        if current < 1 {
            let conn = self.conn();
            let sql = include_str!("../migrations/0001_fleet_schema.sql");
            conn.execute_batch(sql)?;
            conn.execute("PRAGMA user_version = 1", []).map(|_| ())?;
            debug!(event = "schema_migrated", version = 1);
        }

        Ok(())
    }

    /// Adds an agent row and returns it with its assigned id. New agents start
    /// Inactive until their first session connects.
    pub fn register_agent(&self, name: &str) -> Result<Agent, StorageError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO agents (name, availability, updated_at) VALUES (?1, ?2, ?3)",
            params![name, Availability::Inactive.as_str(), Utc::now().to_rfc3339()],
        )?;
        Ok(Agent {
            id: conn.last_insert_rowid(),
            name: name.to_string(),
            availability: Availability::Inactive,
            position: None,
        })
    }

    pub fn package(&self, package_id: PackageId) -> Result<Option<Package>, StorageError> {
        Ok(self
            .conn()
            .query_row(
                "SELECT id, destination, state, agent_id FROM packages WHERE id = ?1",
                params![package_id],
                package_from_row,
            )
            .optional()?)
    }

    fn query_packages(&self, pending_only: bool) -> Result<Vec<Package>, StorageError> {
        let conn = self.conn();
        let sql = if pending_only {
            "SELECT id, destination, state, agent_id FROM packages WHERE state = 'pending' ORDER BY id"
        } else {
            "SELECT id, destination, state, agent_id FROM packages ORDER BY id"
        };
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map([], package_from_row)?;
        let mut packages = Vec::new();
        for row in rows {
            packages.push(row?);
        }
        Ok(packages)
    }
}

fn package_from_row(row: &Row<'_>) -> rusqlite::Result<Package> {
    let raw_state: String = row.get(2)?;
    let state = raw_state.parse::<PackageState>().map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, err.into())
    })?;
    Ok(Package {
        id: row.get(0)?,
        destination: row.get(1)?,
        state,
        agent_id: row.get(3)?,
    })
}

fn agent_from_row(row: &Row<'_>) -> rusqlite::Result<Agent> {
    let raw_availability: String = row.get(2)?;
    let availability = raw_availability.parse::<Availability>().map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, err.into())
    })?;
    let lat: Option<f64> = row.get(3)?;
    let lng: Option<f64> = row.get(4)?;
    let position = match (lat, lng) {
        (Some(lat), Some(lng)) => Coordinates::new(lat, lng).ok(),
        _ => None,
    };
    Ok(Agent {
        id: row.get(0)?,
        name: row.get(1)?,
        availability,
        position,
    })
}

impl FleetStore for SqliteFleetStore {
    fn fetch_agents(&self) -> Result<Vec<Agent>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare("SELECT id, name, availability, lat, lng FROM agents ORDER BY id")
            .map_err(sqlite_to_store)?;
        let rows = stmt.query_map([], agent_from_row).map_err(sqlite_to_store)?;
        let mut agents = Vec::new();
        for row in rows {
            agents.push(row.map_err(sqlite_to_store)?);
        }
        Ok(agents)
    }

    fn fetch_pending_packages(&self) -> Result<Vec<Package>, StoreError> {
        Ok(self.query_packages(true)?)
    }

    fn fetch_packages(&self) -> Result<Vec<Package>, StoreError> {
        Ok(self.query_packages(false)?)
    }

    fn persist_presence(&self, agent_id: AgentId, state: Availability) -> Result<(), StoreError> {
        let changes = self
            .conn()
            .execute(
                "UPDATE agents SET availability = ?1, updated_at = ?2 WHERE id = ?3",
                params![state.as_str(), Utc::now().to_rfc3339(), agent_id],
            )
            .map_err(sqlite_to_store)?;
        if changes == 0 {
            return Err(StoreError::NotFound(format!("agent {agent_id}")));
        }
        Ok(())
    }

    fn persist_assignment(
        &self,
        package_id: PackageId,
        agent_id: AgentId,
    ) -> Result<(), StoreError> {
        let changes = self
            .conn()
            .execute(
                "UPDATE packages SET agent_id = ?1, state = ?2, updated_at = ?3
                 WHERE id = ?4 AND state = 'pending'",
                params![
                    agent_id,
                    PackageState::InTransit.as_str(),
                    Utc::now().to_rfc3339(),
                    package_id
                ],
            )
            .map_err(sqlite_to_store)?;
        if changes == 0 {
            return match self.package(package_id)? {
                Some(package) => Err(StoreError::Rejected(format!(
                    "package {package_id} is {}",
                    package.state
                ))),
                None => Err(StoreError::NotFound(format!("package {package_id}"))),
            };
        }
        Ok(())
    }

    fn persist_package_state(
        &self,
        package_id: PackageId,
        state: PackageState,
    ) -> Result<(), StoreError> {
        let changes = self
            .conn()
            .execute(
                "UPDATE packages SET state = ?1, updated_at = ?2 WHERE id = ?3",
                params![state.as_str(), Utc::now().to_rfc3339(), package_id],
            )
            .map_err(sqlite_to_store)?;
        if changes == 0 {
            return Err(StoreError::NotFound(format!("package {package_id}")));
        }
        Ok(())
    }

    fn create_package(&self, destination: &str) -> Result<Package, StoreError> {
        let conn = self.conn();
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO packages (destination, state, created_at, updated_at)
             VALUES (?1, 'pending', ?2, ?2)",
            params![destination, now],
        )
        .map_err(sqlite_to_store)?;
        Ok(Package::pending(conn.last_insert_rowid(), destination))
    }

    fn record_position(&self, sample: &PositionSample) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "UPDATE agents SET lat = ?1, lng = ?2, position_ts = ?3
                 WHERE id = ?4 AND (position_ts IS NULL OR position_ts <= ?3)",
                params![
                    sample.position.lat,
                    sample.position.lng,
                    sample.ts_ms,
                    sample.agent_id
                ],
            )
            .map_err(sqlite_to_store)?;
        Ok(())
    }
}
