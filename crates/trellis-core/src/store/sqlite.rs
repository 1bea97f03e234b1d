//! `SQLite`-backed implementation of the reservation store.

// SQLite reports counts as i64; they are always non-negative here.
// A poisoned connection mutex means another kernel thread panicked,
// which is unrecoverable.
#![allow(clippy::cast_sign_loss, clippy::missing_panics_doc)]

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use rusqlite::{Connection, OpenFlags, OptionalExtension, params};

use crate::error::{CoreError, Result};
use crate::model::{Delegation, Reservation, ReservationId, Slice, SliceId, SliceOwner};

use super::{LinkRecord, SiteRecord};

/// Schema SQL embedded at compile time.
const SCHEMA_SQL: &str = include_str!("schema.sql");

/// Row counts reported by [`SqliteStore::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Persisted slices.
    pub slices: u64,
    /// Persisted reservations.
    pub reservations: u64,
    /// Persisted delegations.
    pub delegations: u64,
}

/// Durable store for slices, reservations, delegations, and site state.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    #[allow(dead_code)]
    path: Option<PathBuf>,
}

impl SqliteStore {
    /// Opens or creates a store at the given path with WAL mode enabled.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Store`] if the database cannot be opened or
    /// initialized.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(path.to_path_buf()),
        })
    }

    /// Creates an in-memory store for tests.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Store`] if the database cannot be initialized.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: None,
        })
    }

    /// Persists dirty slices and reservations in one transaction.
    ///
    /// Upserts are idempotent by primary key, so replaying a commit after
    /// a crash is safe.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Store`] on database failure; nothing is
    /// written unless the whole batch commits.
    pub fn commit_batch(&self, slices: &[&Slice], reservations: &[&Reservation]) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        for slice in slices {
            Self::upsert_slice_tx(&tx, slice)?;
        }
        for reservation in reservations {
            Self::upsert_reservation_tx(&tx, reservation)?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Persists one slice outside a batch.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Store`] on database failure.
    pub fn upsert_slice(&self, slice: &Slice) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        Self::upsert_slice_tx(&conn, slice)
    }

    fn upsert_slice_tx(conn: &Connection, slice: &Slice) -> Result<()> {
        let payload = serde_json::to_vec(slice)?;
        conn.execute(
            "INSERT INTO slices (id, name, owner, project, state, lease_start, lease_end, last_update, graph_id, payload)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT (id) DO UPDATE SET
                 name = excluded.name,
                 state = excluded.state,
                 lease_start = excluded.lease_start,
                 lease_end = excluded.lease_end,
                 last_update = excluded.last_update,
                 graph_id = excluded.graph_id,
                 payload = excluded.payload",
            params![
                slice.id.as_str(),
                slice.name,
                slice.owner.user,
                slice.owner.project,
                slice.state.as_str(),
                slice.term.start_ms,
                slice.term.end_ms,
                slice.last_update_ms,
                slice.graph_id,
                payload,
            ],
        )?;
        Ok(())
    }

    /// Persists one reservation outside a batch.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Store`] on database failure.
    pub fn upsert_reservation(&self, reservation: &Reservation) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        Self::upsert_reservation_tx(&conn, reservation)
    }

    fn upsert_reservation_tx(conn: &Connection, reservation: &Reservation) -> Result<()> {
        let payload = serde_json::to_vec(reservation)?;
        let term = reservation.effective_term();
        let requested = serde_json::to_string(&reservation.requested)?;
        let approved = reservation
            .approved
            .map(|caps| serde_json::to_string(&caps))
            .transpose()?;
        let components = if reservation.assigned.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&reservation.assigned)?)
        };
        let node_map = reservation
            .node_map
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        conn.execute(
            "INSERT INTO reservations (id, slice_id, type, state, pending, requested_caps, approved_caps, components, node_map, lease_start, lease_end, host, ip_subnet, properties_blob)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
             ON CONFLICT (id) DO UPDATE SET
                 state = excluded.state,
                 pending = excluded.pending,
                 requested_caps = excluded.requested_caps,
                 approved_caps = excluded.approved_caps,
                 components = excluded.components,
                 node_map = excluded.node_map,
                 lease_start = excluded.lease_start,
                 lease_end = excluded.lease_end,
                 host = excluded.host,
                 ip_subnet = excluded.ip_subnet,
                 properties_blob = excluded.properties_blob",
            params![
                reservation.id.as_str(),
                reservation.slice_id.as_str(),
                reservation.rtype.as_str(),
                reservation.state.as_str(),
                reservation.pending.as_str(),
                requested,
                approved,
                components,
                node_map,
                term.start_ms,
                term.end_ms,
                reservation.node_map.as_ref().map(|m| m.node_id.clone()),
                reservation.properties.get("ip_subnet"),
                payload,
            ],
        )?;
        // Mirror attached components into the BDF index.
        conn.execute(
            "DELETE FROM components WHERE reservation_id = ?1",
            params![reservation.id.as_str()],
        )?;
        for component in &reservation.assigned {
            conn.execute(
                "INSERT OR IGNORE INTO components (reservation_id, component_bdf) VALUES (?1, ?2)",
                params![reservation.id.as_str(), component.bdf],
            )?;
        }
        Self::sync_links_tx(conn, reservation)?;
        Ok(())
    }

    /// Mirrors a network-service reservation's interface slivers into
    /// link rows, one per attached substrate node.
    fn sync_links_tx(conn: &Connection, reservation: &Reservation) -> Result<()> {
        conn.execute(
            "DELETE FROM links WHERE reservation_id = ?1",
            params![reservation.id.as_str()],
        )?;
        if !reservation.rtype.is_network_service() {
            return Ok(());
        }
        for ifs in &reservation.interfaces {
            let Some(node_id) = &ifs.parent_node_id else {
                continue;
            };
            let mut properties = std::collections::BTreeMap::new();
            properties.insert("burst_mbits".to_string(), ifs.burst_mbits.to_string());
            if let Some(vlan) = ifs.vlan {
                properties.insert("vlan".to_string(), vlan.to_string());
            }
            if let Some(mac) = &ifs.mac {
                properties.insert("mac".to_string(), mac.clone());
            }
            if let Some(peer_ifs) = &ifs.peer_ifs {
                properties.insert("peer_ifs".to_string(), peer_ifs.clone());
            }
            if let Some(peer_ns) = &ifs.peer_ns_id {
                properties.insert("peer_ns_id".to_string(), peer_ns.clone());
            }
            let properties = serde_json::to_vec(&properties)?;
            conn.execute(
                "INSERT INTO links (reservation_id, node_id, layer, type, bw, properties)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT (reservation_id, node_id) DO UPDATE SET
                     layer = excluded.layer,
                     type = excluded.type,
                     bw = excluded.bw,
                     properties = excluded.properties",
                params![
                    reservation.id.as_str(),
                    node_id,
                    reservation.rtype.layer(),
                    reservation.rtype.as_str(),
                    ifs.bandwidth_gbps,
                    properties,
                ],
            )?;
        }
        Ok(())
    }

    /// Persists a delegation.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Store`] on database failure.
    pub fn upsert_delegation(&self, delegation: &Delegation) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let payload = serde_json::to_vec(delegation)?;
        conn.execute(
            "INSERT INTO delegations (id, slice_id, actor_guid, graph_id, state, site, payload)
             VALUES (?1, NULL, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT (id) DO UPDATE SET
                 state = excluded.state,
                 payload = excluded.payload",
            params![
                delegation.id.as_str(),
                delegation.target.as_str(),
                delegation.graph_id,
                delegation.state.as_str(),
                delegation.site,
                payload,
            ],
        )?;
        Ok(())
    }

    /// Deletes a reservation once it is persisted-as-terminal and its
    /// slice is being garbage collected.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Store`] on database failure.
    pub fn remove_reservation(&self, id: &ReservationId) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM reservations WHERE id = ?1", params![id.as_str()])?;
        Ok(())
    }

    /// Deletes a dead slice and, by cascade, its reservations.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Store`] on database failure.
    pub fn remove_slice(&self, id: &SliceId) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM slices WHERE id = ?1", params![id.as_str()])?;
        Ok(())
    }

    /// Loads every persisted slice.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Store`] on database failure or
    /// [`CoreError::Serialization`] for an unreadable payload.
    pub fn load_slices(&self) -> Result<Vec<Slice>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT payload FROM slices ORDER BY id")?;
        let rows = stmt.query_map([], |row| row.get::<_, Vec<u8>>(0))?;
        let mut slices = Vec::new();
        for payload in rows {
            slices.push(serde_json::from_slice(&payload?)?);
        }
        Ok(slices)
    }

    /// Loads every persisted reservation.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Store`] on database failure or
    /// [`CoreError::Serialization`] for an unreadable payload.
    pub fn load_reservations(&self) -> Result<Vec<Reservation>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT properties_blob FROM reservations ORDER BY id")?;
        let rows = stmt.query_map([], |row| row.get::<_, Vec<u8>>(0))?;
        let mut reservations = Vec::new();
        for payload in rows {
            reservations.push(serde_json::from_slice(&payload?)?);
        }
        Ok(reservations)
    }

    /// Loads every persisted delegation.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Store`] on database failure or
    /// [`CoreError::Serialization`] for an unreadable payload.
    pub fn load_delegations(&self) -> Result<Vec<Delegation>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT payload FROM delegations ORDER BY id")?;
        let rows = stmt.query_map([], |row| row.get::<_, Vec<u8>>(0))?;
        let mut delegations = Vec::new();
        for payload in rows {
            delegations.push(serde_json::from_slice(&payload?)?);
        }
        Ok(delegations)
    }

    /// Finds a non-dead slice by owner and name, the name-collision check.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Store`] on database failure.
    pub fn find_live_slice(&self, owner: &SliceOwner, name: &str) -> Result<Option<Slice>> {
        let conn = self.conn.lock().unwrap();
        let payload: Option<Vec<u8>> = conn
            .query_row(
                "SELECT payload FROM slices
                 WHERE owner = ?1 AND project = ?2 AND name = ?3 AND state != 'DEAD'",
                params![owner.user, owner.project, name],
                |row| row.get(0),
            )
            .optional()?;
        payload
            .map(|bytes| serde_json::from_slice(&bytes).map_err(CoreError::from))
            .transpose()
    }

    /// Snapshot read of one reservation, for status queries off the
    /// kernel thread.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Store`] on database failure.
    pub fn reservation(&self, id: &ReservationId) -> Result<Option<Reservation>> {
        let conn = self.conn.lock().unwrap();
        let payload: Option<Vec<u8>> = conn
            .query_row(
                "SELECT properties_blob FROM reservations WHERE id = ?1",
                params![id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        payload
            .map(|bytes| serde_json::from_slice(&bytes).map_err(CoreError::from))
            .transpose()
    }

    /// Persists a site record.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Store`] on database failure.
    pub fn upsert_site(&self, site: &SiteRecord) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let payload = serde_json::to_vec(&site.properties)?;
        conn.execute(
            "INSERT INTO sites (id, name, state, properties_blob)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (id) DO UPDATE SET
                 name = excluded.name,
                 state = excluded.state,
                 properties_blob = excluded.properties_blob",
            params![
                site.id,
                site.name,
                if site.maintenance { "MAINT" } else { "ACTIVE" },
                payload,
            ],
        )?;
        Ok(())
    }

    /// Loads every site record.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Store`] on database failure.
    pub fn load_sites(&self) -> Result<Vec<SiteRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT id, name, state, properties_blob FROM sites ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Vec<u8>>(3)?,
            ))
        })?;
        let mut sites = Vec::new();
        for row in rows {
            let (id, name, state, blob) = row?;
            sites.push(SiteRecord {
                id,
                name,
                maintenance: state == "MAINT",
                properties: serde_json::from_slice(&blob)?,
            });
        }
        Ok(sites)
    }

    /// Snapshot read of the link rows recorded for a network-service
    /// reservation.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Store`] on database failure or
    /// [`CoreError::Serialization`] for an unreadable properties blob.
    pub fn load_links(&self, reservation: &ReservationId) -> Result<Vec<LinkRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT node_id, layer, type, bw, properties FROM links
             WHERE reservation_id = ?1 ORDER BY node_id",
        )?;
        let rows = stmt.query_map(params![reservation.as_str()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, u32>(3)?,
                row.get::<_, Vec<u8>>(4)?,
            ))
        })?;
        let mut links = Vec::new();
        for row in rows {
            let (node_id, layer, link_type, bandwidth_gbps, blob) = row?;
            links.push(LinkRecord {
                node_id,
                layer,
                link_type,
                bandwidth_gbps,
                properties: serde_json::from_slice(&blob)?,
            });
        }
        Ok(links)
    }

    /// Adjusts the per-owner slice count by `delta`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Store`] on database failure.
    pub fn bump_slice_count(&self, owner: &SliceOwner, delta: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO metrics (user, project, slice_count)
             VALUES (?1, ?2, MAX(?3, 0))
             ON CONFLICT (user, project) DO UPDATE SET
                 slice_count = MAX(slice_count + ?3, 0)",
            params![owner.user, owner.project, delta],
        )?;
        Ok(())
    }

    /// Reads the per-owner slice count.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Store`] on database failure.
    pub fn slice_count(&self, owner: &SliceOwner) -> Result<u64> {
        let conn = self.conn.lock().unwrap();
        let count: Option<i64> = conn
            .query_row(
                "SELECT slice_count FROM metrics WHERE user = ?1 AND project = ?2",
                params![owner.user, owner.project],
                |row| row.get(0),
            )
            .optional()?;
        Ok(count.unwrap_or(0).max(0) as u64)
    }

    /// Records the time of the last processed operational action.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Store`] on database failure.
    pub fn touch_poas(&self, last_update_ms: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM poas", [])?;
        conn.execute(
            "INSERT INTO poas (last_update_time) VALUES (?1)",
            params![last_update_ms],
        )?;
        Ok(())
    }

    /// Row counts for observability.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Store`] on database failure.
    pub fn stats(&self) -> Result<StoreStats> {
        let conn = self.conn.lock().unwrap();
        let count = |table: &str| -> Result<u64> {
            let n: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
                row.get(0)
            })?;
            Ok(n as u64)
        };
        Ok(StoreStats {
            slices: count("slices")?,
            reservations: count("reservations")?,
            delegations: count("delegations")?,
        })
    }
}
