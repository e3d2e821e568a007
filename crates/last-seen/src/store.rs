use crate::open::store_err;
use crate::LastSeen;
use recon_core::Result;
use rusqlite::{params, OptionalExtension};
use time::OffsetDateTime;
use tracing::debug;

fn now() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

impl LastSeen {
    /// Remember `port` as the last reachable port of `ip`.
    pub fn record(&self, ip: &str, port: u16) -> Result<()> {
        self.record_at(ip, port, now())
    }

    /// Last recorded port of `ip`; a hit refreshes its timestamp.
    pub fn lookup(&self, ip: &str) -> Result<Option<u16>> {
        self.lookup_at(ip, now())
    }

    /// Drop entries not touched within the TTL. Returns how many went.
    pub fn prune(&self) -> Result<usize> {
        self.prune_at(now())
    }

    pub(crate) fn record_at(&self, ip: &str, port: u16, at: i64) -> Result<()> {
        self.prune_at(at)?;
        self.conn
            .execute(
                "INSERT INTO last_seen(ip,port,seen_at) VALUES (?,?,?)
                 ON CONFLICT(ip) DO UPDATE SET port=excluded.port, seen_at=excluded.seen_at",
                params![ip, port as i64, at],
            )
            .map_err(store_err)?;
        Ok(())
    }

    pub(crate) fn lookup_at(&self, ip: &str, at: i64) -> Result<Option<u16>> {
        self.prune_at(at)?;
        let port: Option<i64> = self
            .conn
            .query_row("SELECT port FROM last_seen WHERE ip=?", [ip], |r| r.get(0))
            .optional()
            .map_err(store_err)?;
        if port.is_some() {
            self.conn
                .execute("UPDATE last_seen SET seen_at=? WHERE ip=?", params![at, ip])
                .map_err(store_err)?;
        }
        Ok(port.and_then(|p| u16::try_from(p).ok()))
    }

    pub(crate) fn prune_at(&self, at: i64) -> Result<usize> {
        let cutoff = at - self.ttl.as_secs() as i64;
        let n = self
            .conn
            .execute("DELETE FROM last_seen WHERE seen_at < ?", [cutoff])
            .map_err(store_err)?;
        if n > 0 {
            debug!(parent: &self.log, pruned = n, "expired last-seen entries");
        }
        Ok(n)
    }
}
