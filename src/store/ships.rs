//! Registry of known replicas and when they were last heard from
//! (master side).

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rusqlite::{params, Row};
use tracing::info;

use crate::error::Result;
use crate::types::{ConnectivityStatus, Ship};

use super::{parse_ts, ts, Db};

pub struct ShipTracker {
    db: Arc<Db>,
}

impl ShipTracker {
    pub fn new(db: Arc<Db>) -> Self {
        Self { db }
    }

    /// Record a sighting: inserts unknown ships, refreshes `last_seen_at`
    /// and flips the ship online.
    pub fn upsert_seen(&self, ship_id: &str, ship_name: &str) -> Result<()> {
        let now = ts(Utc::now());
        self.db.with_conn(|conn| {
            let inserted = conn.execute(
                "INSERT INTO ships (ship_id, ship_name, connectivity_status, last_seen_at, created_at)
                 VALUES (?1, ?2, 'online', ?3, ?3)
                 ON CONFLICT (ship_id) DO UPDATE SET
                     ship_name = excluded.ship_name,
                     connectivity_status = 'online',
                     last_seen_at = excluded.last_seen_at",
                params![ship_id, ship_name, now],
            )?;
            Ok(inserted)
        })?;
        Ok(())
    }

    pub fn set_status(&self, ship_id: &str, status: ConnectivityStatus) -> Result<bool> {
        self.db.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE ships SET connectivity_status = ?2 WHERE ship_id = ?1",
                params![ship_id, status.as_str()],
            )?;
            Ok(n > 0)
        })
    }

    /// Flip ships unseen for longer than `threshold` to offline.
    /// Returns how many transitioned.
    pub fn mark_stale(&self, threshold: Duration) -> Result<usize> {
        let cutoff = ts(Utc::now()
            - chrono::Duration::from_std(threshold).unwrap_or_else(|_| chrono::Duration::zero()));
        let flipped = self.db.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE ships SET connectivity_status = 'offline'
                  WHERE connectivity_status = 'online' AND last_seen_at < ?1",
                params![cutoff],
            )?;
            Ok(n)
        })?;
        if flipped > 0 {
            info!(flipped, "marked stale ships offline");
        }
        Ok(flipped)
    }

    pub fn list_ships(&self) -> Result<Vec<Ship>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT ship_id, ship_name, connectivity_status, last_seen_at, created_at
                   FROM ships ORDER BY ship_id",
            )?;
            let ships = stmt
                .query_map([], row_to_ship)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(ships)
        })
    }

    pub fn online_count(&self) -> Result<u64> {
        self.db.with_conn(|conn| {
            let n = conn.query_row(
                "SELECT COUNT(*) FROM ships WHERE connectivity_status = 'online'",
                [],
                |row| row.get(0),
            )?;
            Ok(n)
        })
    }

    pub fn total_count(&self) -> Result<u64> {
        self.db.with_conn(|conn| {
            let n = conn.query_row("SELECT COUNT(*) FROM ships", [], |row| row.get(0))?;
            Ok(n)
        })
    }
}

fn row_to_ship(row: &Row<'_>) -> rusqlite::Result<Ship> {
    let status: String = row.get(2)?;
    let last_seen: String = row.get(3)?;
    let created: String = row.get(4)?;
    Ok(Ship {
        ship_id: row.get(0)?,
        ship_name: row.get(1)?,
        connectivity_status: if status == "online" {
            ConnectivityStatus::Online
        } else {
            ConnectivityStatus::Offline
        },
        last_seen_at: parse_ts(&last_seen).unwrap_or_else(|_| Utc::now()),
        created_at: parse_ts(&created).unwrap_or_else(|_| Utc::now()),
    })
}
