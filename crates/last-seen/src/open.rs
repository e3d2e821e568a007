use crate::schema::MIG_0001_INIT;
use recon_core::{ReconError, Result};
use rusqlite::Connection;
use std::time::Duration;
use tracing::{debug, Span};

pub const DEFAULT_TTL: Duration = Duration::from_secs(86_400);

pub struct LastSeen {
    pub(crate) conn: Connection,
    pub(crate) ttl: Duration,
    pub(crate) log: Span,
}

impl LastSeen {
    pub fn open_or_create(path: impl AsRef<std::path::Path>, ttl: Duration, log: Span) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path).map_err(store_err)?;
        apply_pragmas(&conn)?;
        migrate(&conn)?;
        debug!(parent: &log, path = %path.display(), ttl_secs = ttl.as_secs(), "last-seen store open");
        Ok(LastSeen { conn, ttl, log })
    }
}

pub(crate) fn store_err(e: rusqlite::Error) -> ReconError {
    ReconError::Store(e.to_string())
}

fn apply_pragmas(conn: &Connection) -> Result<()> {
    conn.pragma_update(None, "journal_mode", "WAL").map_err(store_err)?;
    conn.pragma_update(None, "synchronous", "NORMAL").map_err(store_err)?;
    Ok(())
}

fn migrate(conn: &Connection) -> Result<()> {
    let exists: i64 = conn
        .query_row(
            "SELECT COUNT(1) FROM sqlite_master WHERE type='table' AND name='last_seen'",
            [],
            |r| r.get(0),
        )
        .map_err(store_err)?;
    if exists == 0 {
        conn.execute_batch(MIG_0001_INIT).map_err(store_err)?;
    }
    Ok(())
}
