//! SQLite-backed market storage.
//!
//! One connection behind a mutex; WAL mode for concurrent readers. All
//! multi-step mutations run inside `BEGIN IMMEDIATE` transactions through
//! [`MarketStore::with_tx`], which serializes writers the way the original
//! row-level locks did: any two mutators of one order observe each other as
//! strictly before or after.
//!
//! SQL lives here; domain orchestration (FSM, escrow) composes these
//! functions inside one transaction.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard};
use rusqlite::{params, Connection, OpenFlags};
use tracing::{info, warn};
use uuid::Uuid;

use crate::errors::MarketError;
use crate::models::{
    AssignmentStatus, AuditLog, Bid, BidStatus, Buyer, Escrow, EscrowStatus, Farmer, GeoPoint,
    LogisticsAssignment, Middleman, Order, OrderStatus, TruckType,
};

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA foreign_keys = ON;
PRAGMA temp_store = MEMORY;

CREATE TABLE IF NOT EXISTS farmers (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    phone TEXT NOT NULL UNIQUE,
    email TEXT NOT NULL UNIQUE,
    latitude REAL,
    longitude REAL,
    total_transactions INTEGER NOT NULL DEFAULT 0,
    stripe_account_id TEXT,
    created_at TEXT NOT NULL
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS buyers (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    phone TEXT NOT NULL UNIQUE,
    email TEXT NOT NULL UNIQUE,
    delivery_latitude REAL,
    delivery_longitude REAL,
    stripe_customer_id TEXT,
    created_at TEXT NOT NULL
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS middlemen (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    phone TEXT NOT NULL UNIQUE,
    email TEXT NOT NULL UNIQUE,
    current_latitude REAL,
    current_longitude REAL,
    truck_capacity_kg REAL NOT NULL,
    truck_plate TEXT NOT NULL UNIQUE,
    truck_type TEXT NOT NULL
        CHECK (truck_type IN ('REEFER', 'VENTILATED', 'INSULATED', 'DRY_VAN')),
    route_radius_km REAL NOT NULL DEFAULT 100.0,
    on_time_rating REAL NOT NULL DEFAULT 0.0,
    total_deliveries INTEGER NOT NULL DEFAULT 0,
    is_available INTEGER NOT NULL DEFAULT 1,
    stripe_account_id TEXT,
    created_at TEXT NOT NULL
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS orders (
    id TEXT PRIMARY KEY,
    farmer_id TEXT NOT NULL REFERENCES farmers(id),
    buyer_id TEXT REFERENCES buyers(id),
    crop_type TEXT NOT NULL,
    variety TEXT,
    total_volume_kg REAL NOT NULL,
    available_volume_kg REAL NOT NULL,
    unit_price_asking REAL NOT NULL,
    accepted_price REAL,
    status TEXT NOT NULL
        CHECK (status IN ('LISTED', 'NEGOTIATING', 'LOGISTICS_SEARCH',
                          'IN_TRANSIT', 'SETTLED', 'CANCELLED')),
    requires_cold_chain INTEGER NOT NULL DEFAULT 0,
    harvest_date TEXT,
    route_vector TEXT,
    crop_image_url TEXT,
    quality_grade TEXT,
    pickup_qr_hash TEXT,
    delivery_qr_hash TEXT,
    logistics_search_started_at TEXT,
    settled_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT,
    CHECK (available_volume_kg >= 0 AND available_volume_kg <= total_volume_kg)
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_orders_status ON orders(status, created_at DESC);
CREATE INDEX IF NOT EXISTS idx_orders_farmer ON orders(farmer_id, created_at DESC);

CREATE TABLE IF NOT EXISTS bids (
    id TEXT PRIMARY KEY,
    order_id TEXT NOT NULL REFERENCES orders(id),
    buyer_id TEXT NOT NULL REFERENCES buyers(id),
    offered_price_per_kg REAL NOT NULL,
    volume_kg REAL NOT NULL,
    status TEXT NOT NULL
        CHECK (status IN ('PENDING', 'ACCEPTED', 'REJECTED', 'WITHDRAWN')),
    message TEXT,
    expires_at TEXT,
    created_at TEXT NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_bids_order ON bids(order_id, status);

CREATE TABLE IF NOT EXISTS escrows (
    id TEXT PRIMARY KEY,
    order_id TEXT NOT NULL UNIQUE REFERENCES orders(id),
    total_amount_cents INTEGER NOT NULL,
    farmer_released_cents INTEGER NOT NULL DEFAULT 0,
    middleman_released_cents INTEGER NOT NULL DEFAULT 0,
    refunded_cents INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL
        CHECK (status IN ('WAITING_FUNDS', 'FUNDS_HELD', 'PICKED_UP',
                          'DELIVERED', 'CANCELLED')),
    stripe_payment_intent_id TEXT UNIQUE,
    stripe_transfer_farmer_pickup_id TEXT,
    stripe_transfer_farmer_final_id TEXT,
    stripe_transfer_middleman_id TEXT,
    funds_held_at TEXT,
    picked_up_at TEXT,
    delivered_at TEXT,
    cancelled_at TEXT,
    created_at TEXT NOT NULL,
    CHECK (farmer_released_cents + middleman_released_cents + refunded_cents
           <= total_amount_cents)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS logistics_assignments (
    id TEXT PRIMARY KEY,
    order_id TEXT NOT NULL UNIQUE REFERENCES orders(id),
    middleman_id TEXT NOT NULL REFERENCES middlemen(id),
    status TEXT NOT NULL
        CHECK (status IN ('OFFERED', 'ACCEPTED', 'REJECTED')),
    last_gps_ping_at TEXT,
    gps_alert_sent INTEGER NOT NULL DEFAULT 0,
    estimated_distance_km REAL,
    agreed_fee_cents INTEGER,
    offered_at TEXT NOT NULL,
    accepted_at TEXT
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_assignments_middleman
    ON logistics_assignments(middleman_id, status);

CREATE TABLE IF NOT EXISTS audit_logs (
    id TEXT PRIMARY KEY,
    order_id TEXT NOT NULL REFERENCES orders(id),
    from_status TEXT,
    to_status TEXT NOT NULL,
    actor_type TEXT NOT NULL,
    actor_id TEXT,
    reason TEXT,
    extra_data TEXT,
    created_at TEXT NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_audit_order ON audit_logs(order_id, created_at);

CREATE TABLE IF NOT EXISTS processed_webhook_events (
    event_id TEXT PRIMARY KEY,
    received_at TEXT NOT NULL
) WITHOUT ROWID;
"#;

const ORDER_COLS: &str = "id, farmer_id, buyer_id, crop_type, variety, total_volume_kg, \
     available_volume_kg, unit_price_asking, accepted_price, status, requires_cold_chain, \
     harvest_date, route_vector, crop_image_url, quality_grade, pickup_qr_hash, \
     delivery_qr_hash, logistics_search_started_at, settled_at, created_at, updated_at";

const BID_COLS: &str =
    "id, order_id, buyer_id, offered_price_per_kg, volume_kg, status, message, expires_at, created_at";

const ESCROW_COLS: &str = "id, order_id, total_amount_cents, farmer_released_cents, \
     middleman_released_cents, refunded_cents, status, stripe_payment_intent_id, \
     stripe_transfer_farmer_pickup_id, stripe_transfer_farmer_final_id, \
     stripe_transfer_middleman_id, funds_held_at, picked_up_at, delivered_at, cancelled_at, \
     created_at";

const ASSIGNMENT_COLS: &str = "id, order_id, middleman_id, status, last_gps_ping_at, \
     gps_alert_sent, estimated_distance_km, agreed_fee_cents, offered_at, accepted_at";

const MIDDLEMAN_COLS: &str = "id, name, phone, email, current_latitude, current_longitude, \
     truck_capacity_kg, truck_plate, truck_type, route_radius_km, on_time_rating, \
     total_deliveries, is_available, stripe_account_id, created_at";

const FARMER_COLS: &str =
    "id, name, phone, email, latitude, longitude, total_transactions, stripe_account_id, created_at";

const BUYER_COLS: &str =
    "id, name, phone, email, delivery_latitude, delivery_longitude, stripe_customer_id, created_at";

const AUDIT_COLS: &str =
    "id, order_id, from_status, to_status, actor_type, actor_id, reason, extra_data, created_at";

/// Market storage handle shared across handlers and monitors.
pub struct MarketStore {
    conn: Mutex<Connection>,
}

impl MarketStore {
    pub fn open(db_path: &str) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX; // We handle our own locking

        let conn = Connection::open_with_flags(db_path, flags)
            .with_context(|| format!("Failed to open database at {}", db_path))?;

        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to initialize database schema")?;

        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap_or_default();
        if journal_mode.to_lowercase() != "wal" {
            warn!("WAL mode not active, journal_mode = {}", journal_mode);
        }

        let order_count: i64 = conn
            .query_row("SELECT COUNT(*) FROM orders", [], |row| row.get(0))
            .unwrap_or(0);
        info!(
            "📦 Market database initialized at {} ({} existing orders)",
            db_path, order_count
        );

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run a closure against the connection without an explicit transaction.
    /// Suitable for single-statement reads.
    pub fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, MarketError>,
    ) -> Result<T, MarketError> {
        let conn = self.lock();
        f(&conn)
    }

    /// Run a closure inside one `BEGIN IMMEDIATE` transaction. Committed on
    /// `Ok`, rolled back on `Err`. Callers emit events only after this
    /// returns `Ok`.
    pub fn with_tx<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, MarketError>,
    ) -> Result<T, MarketError> {
        let conn = self.lock();
        conn.execute_batch("BEGIN IMMEDIATE")?;
        match f(&conn) {
            Ok(value) => {
                conn.execute_batch("COMMIT")?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback_err) = conn.execute_batch("ROLLBACK") {
                    warn!("rollback failed: {}", rollback_err);
                }
                Err(e)
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock()
    }
}

// ------------------------------------------------------------------------
// Timestamp / id helpers
// ------------------------------------------------------------------------

fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn opt_ts(dt: &Option<DateTime<Utc>>) -> Option<String> {
    dt.as_ref().map(ts)
}

fn conversion_err(msg: String) -> rusqlite::Error {
    rusqlite::Error::ToSqlConversionFailure(msg.into())
}

fn parse_ts(idx: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn parse_opt_ts(idx: usize, s: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    s.map(|v| parse_ts(idx, &v)).transpose()
}

fn parse_uuid(idx: usize, s: &str) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn parse_opt_uuid(idx: usize, s: Option<String>) -> rusqlite::Result<Option<Uuid>> {
    s.map(|v| parse_uuid(idx, &v)).transpose()
}

fn bad_enum(idx: usize, what: &str, value: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        format!("unknown {}: {}", what, value).into(),
    )
}

fn geo(lat: Option<f64>, lon: Option<f64>) -> Option<GeoPoint> {
    match (lat, lon) {
        (Some(latitude), Some(longitude)) => Some(GeoPoint { latitude, longitude }),
        _ => None,
    }
}

// ------------------------------------------------------------------------
// Row mappers
// ------------------------------------------------------------------------

pub fn row_to_order(row: &rusqlite::Row) -> rusqlite::Result<Order> {
    let id: String = row.get(0)?;
    let farmer_id: String = row.get(1)?;
    let buyer_id: Option<String> = row.get(2)?;
    let status: String = row.get(9)?;
    let harvest_date: Option<String> = row.get(11)?;
    let route_vector: Option<String> = row.get(12)?;
    let logistics_started: Option<String> = row.get(17)?;
    let settled: Option<String> = row.get(18)?;
    let created: String = row.get(19)?;
    let updated: Option<String> = row.get(20)?;

    let route_vector = route_vector
        .map(|raw| {
            serde_json::from_str::<Vec<GeoPoint>>(&raw).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    12,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                )
            })
        })
        .transpose()?;

    Ok(Order {
        id: parse_uuid(0, &id)?,
        farmer_id: parse_uuid(1, &farmer_id)?,
        buyer_id: parse_opt_uuid(2, buyer_id)?,
        crop_type: row.get(3)?,
        variety: row.get(4)?,
        total_volume_kg: row.get(5)?,
        available_volume_kg: row.get(6)?,
        unit_price_asking: row.get(7)?,
        accepted_price: row.get(8)?,
        status: OrderStatus::from_str(&status).ok_or_else(|| bad_enum(9, "order status", &status))?,
        requires_cold_chain: row.get(10)?,
        harvest_date: parse_opt_ts(11, harvest_date)?,
        route_vector,
        crop_image_url: row.get(13)?,
        quality_grade: row.get(14)?,
        pickup_qr_hash: row.get(15)?,
        delivery_qr_hash: row.get(16)?,
        logistics_search_started_at: parse_opt_ts(17, logistics_started)?,
        settled_at: parse_opt_ts(18, settled)?,
        created_at: parse_ts(19, &created)?,
        updated_at: parse_opt_ts(20, updated)?,
    })
}

pub fn row_to_bid(row: &rusqlite::Row) -> rusqlite::Result<Bid> {
    let id: String = row.get(0)?;
    let order_id: String = row.get(1)?;
    let buyer_id: String = row.get(2)?;
    let status: String = row.get(5)?;
    let expires: Option<String> = row.get(7)?;
    let created: String = row.get(8)?;

    Ok(Bid {
        id: parse_uuid(0, &id)?,
        order_id: parse_uuid(1, &order_id)?,
        buyer_id: parse_uuid(2, &buyer_id)?,
        offered_price_per_kg: row.get(3)?,
        volume_kg: row.get(4)?,
        status: BidStatus::from_str(&status).ok_or_else(|| bad_enum(5, "bid status", &status))?,
        message: row.get(6)?,
        expires_at: parse_opt_ts(7, expires)?,
        created_at: parse_ts(8, &created)?,
    })
}

pub fn row_to_escrow(row: &rusqlite::Row) -> rusqlite::Result<Escrow> {
    let id: String = row.get(0)?;
    let order_id: String = row.get(1)?;
    let status: String = row.get(6)?;
    let funds_held: Option<String> = row.get(11)?;
    let picked_up: Option<String> = row.get(12)?;
    let delivered: Option<String> = row.get(13)?;
    let cancelled: Option<String> = row.get(14)?;
    let created: String = row.get(15)?;

    Ok(Escrow {
        id: parse_uuid(0, &id)?,
        order_id: parse_uuid(1, &order_id)?,
        total_amount_cents: row.get(2)?,
        farmer_released_cents: row.get(3)?,
        middleman_released_cents: row.get(4)?,
        refunded_cents: row.get(5)?,
        status: EscrowStatus::from_str(&status)
            .ok_or_else(|| bad_enum(6, "escrow status", &status))?,
        stripe_payment_intent_id: row.get(7)?,
        stripe_transfer_farmer_pickup_id: row.get(8)?,
        stripe_transfer_farmer_final_id: row.get(9)?,
        stripe_transfer_middleman_id: row.get(10)?,
        funds_held_at: parse_opt_ts(11, funds_held)?,
        picked_up_at: parse_opt_ts(12, picked_up)?,
        delivered_at: parse_opt_ts(13, delivered)?,
        cancelled_at: parse_opt_ts(14, cancelled)?,
        created_at: parse_ts(15, &created)?,
    })
}

pub fn row_to_assignment(row: &rusqlite::Row) -> rusqlite::Result<LogisticsAssignment> {
    let id: String = row.get(0)?;
    let order_id: String = row.get(1)?;
    let middleman_id: String = row.get(2)?;
    let status: String = row.get(3)?;
    let last_ping: Option<String> = row.get(4)?;
    let offered: String = row.get(8)?;
    let accepted: Option<String> = row.get(9)?;

    Ok(LogisticsAssignment {
        id: parse_uuid(0, &id)?,
        order_id: parse_uuid(1, &order_id)?,
        middleman_id: parse_uuid(2, &middleman_id)?,
        status: AssignmentStatus::from_str(&status)
            .ok_or_else(|| bad_enum(3, "assignment status", &status))?,
        last_gps_ping_at: parse_opt_ts(4, last_ping)?,
        gps_alert_sent: row.get(5)?,
        estimated_distance_km: row.get(6)?,
        agreed_fee_cents: row.get(7)?,
        offered_at: parse_ts(8, &offered)?,
        accepted_at: parse_opt_ts(9, accepted)?,
    })
}

pub fn row_to_middleman(row: &rusqlite::Row) -> rusqlite::Result<Middleman> {
    let id: String = row.get(0)?;
    let lat: Option<f64> = row.get(4)?;
    let lon: Option<f64> = row.get(5)?;
    let truck_type: String = row.get(8)?;
    let created: String = row.get(14)?;

    Ok(Middleman {
        id: parse_uuid(0, &id)?,
        name: row.get(1)?,
        phone: row.get(2)?,
        email: row.get(3)?,
        current_location: geo(lat, lon),
        truck_capacity_kg: row.get(6)?,
        truck_plate: row.get(7)?,
        truck_type: TruckType::from_str(&truck_type)
            .ok_or_else(|| bad_enum(8, "truck type", &truck_type))?,
        route_radius_km: row.get(9)?,
        on_time_rating: row.get(10)?,
        total_deliveries: row.get(11)?,
        is_available: row.get(12)?,
        stripe_account_id: row.get(13)?,
        created_at: parse_ts(14, &created)?,
    })
}

pub fn row_to_farmer(row: &rusqlite::Row) -> rusqlite::Result<Farmer> {
    let id: String = row.get(0)?;
    let lat: Option<f64> = row.get(4)?;
    let lon: Option<f64> = row.get(5)?;
    let created: String = row.get(8)?;

    Ok(Farmer {
        id: parse_uuid(0, &id)?,
        name: row.get(1)?,
        phone: row.get(2)?,
        email: row.get(3)?,
        location: geo(lat, lon),
        total_transactions: row.get(6)?,
        stripe_account_id: row.get(7)?,
        created_at: parse_ts(8, &created)?,
    })
}

pub fn row_to_buyer(row: &rusqlite::Row) -> rusqlite::Result<Buyer> {
    let id: String = row.get(0)?;
    let lat: Option<f64> = row.get(4)?;
    let lon: Option<f64> = row.get(5)?;
    let created: String = row.get(7)?;

    Ok(Buyer {
        id: parse_uuid(0, &id)?,
        name: row.get(1)?,
        phone: row.get(2)?,
        email: row.get(3)?,
        delivery_location: geo(lat, lon),
        stripe_customer_id: row.get(6)?,
        created_at: parse_ts(7, &created)?,
    })
}

pub fn row_to_audit(row: &rusqlite::Row) -> rusqlite::Result<AuditLog> {
    let id: String = row.get(0)?;
    let order_id: String = row.get(1)?;
    let actor_id: Option<String> = row.get(5)?;
    let extra_data: Option<String> = row.get(7)?;
    let created: String = row.get(8)?;

    let extra_data = extra_data
        .map(|raw| {
            serde_json::from_str::<serde_json::Value>(&raw).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    7,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                )
            })
        })
        .transpose()?;

    Ok(AuditLog {
        id: parse_uuid(0, &id)?,
        order_id: parse_uuid(1, &order_id)?,
        from_status: row.get(2)?,
        to_status: row.get(3)?,
        actor_type: row.get(4)?,
        actor_id: parse_opt_uuid(5, actor_id)?,
        reason: row.get(6)?,
        extra_data,
        created_at: parse_ts(8, &created)?,
    })
}

// ------------------------------------------------------------------------
// Participants
// ------------------------------------------------------------------------

pub fn insert_farmer(conn: &Connection, farmer: &Farmer) -> Result<(), MarketError> {
    conn.execute(
        &format!("INSERT INTO farmers ({FARMER_COLS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"),
        params![
            farmer.id.to_string(),
            farmer.name,
            farmer.phone,
            farmer.email,
            farmer.location.map(|p| p.latitude),
            farmer.location.map(|p| p.longitude),
            farmer.total_transactions,
            farmer.stripe_account_id,
            ts(&farmer.created_at),
        ],
    )?;
    Ok(())
}

pub fn get_farmer(conn: &Connection, id: Uuid) -> Result<Option<Farmer>, MarketError> {
    let mut stmt =
        conn.prepare_cached(&format!("SELECT {FARMER_COLS} FROM farmers WHERE id = ?1"))?;
    let mut rows = stmt.query([id.to_string()])?;
    match rows.next()? {
        Some(row) => Ok(Some(row_to_farmer(row)?)),
        None => Ok(None),
    }
}

pub fn bump_farmer_transactions(conn: &Connection, id: Uuid) -> Result<(), MarketError> {
    conn.execute(
        "UPDATE farmers SET total_transactions = total_transactions + 1 WHERE id = ?1",
        [id.to_string()],
    )?;
    Ok(())
}

pub fn insert_buyer(conn: &Connection, buyer: &Buyer) -> Result<(), MarketError> {
    conn.execute(
        &format!("INSERT INTO buyers ({BUYER_COLS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"),
        params![
            buyer.id.to_string(),
            buyer.name,
            buyer.phone,
            buyer.email,
            buyer.delivery_location.map(|p| p.latitude),
            buyer.delivery_location.map(|p| p.longitude),
            buyer.stripe_customer_id,
            ts(&buyer.created_at),
        ],
    )?;
    Ok(())
}

pub fn get_buyer(conn: &Connection, id: Uuid) -> Result<Option<Buyer>, MarketError> {
    let mut stmt = conn.prepare_cached(&format!("SELECT {BUYER_COLS} FROM buyers WHERE id = ?1"))?;
    let mut rows = stmt.query([id.to_string()])?;
    match rows.next()? {
        Some(row) => Ok(Some(row_to_buyer(row)?)),
        None => Ok(None),
    }
}

pub fn insert_middleman(conn: &Connection, middleman: &Middleman) -> Result<(), MarketError> {
    conn.execute(
        &format!(
            "INSERT INTO middlemen ({MIDDLEMAN_COLS}) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"
        ),
        params![
            middleman.id.to_string(),
            middleman.name,
            middleman.phone,
            middleman.email,
            middleman.current_location.map(|p| p.latitude),
            middleman.current_location.map(|p| p.longitude),
            middleman.truck_capacity_kg,
            middleman.truck_plate,
            middleman.truck_type.as_str(),
            middleman.route_radius_km,
            middleman.on_time_rating,
            middleman.total_deliveries,
            middleman.is_available,
            middleman.stripe_account_id,
            ts(&middleman.created_at),
        ],
    )?;
    Ok(())
}

pub fn get_middleman(conn: &Connection, id: Uuid) -> Result<Option<Middleman>, MarketError> {
    let mut stmt =
        conn.prepare_cached(&format!("SELECT {MIDDLEMAN_COLS} FROM middlemen WHERE id = ?1"))?;
    let mut rows = stmt.query([id.to_string()])?;
    match rows.next()? {
        Some(row) => Ok(Some(row_to_middleman(row)?)),
        None => Ok(None),
    }
}

pub fn set_middleman_availability(
    conn: &Connection,
    id: Uuid,
    available: bool,
) -> Result<(), MarketError> {
    conn.execute(
        "UPDATE middlemen SET is_available = ?1 WHERE id = ?2",
        params![available, id.to_string()],
    )?;
    Ok(())
}

pub fn bump_middleman_deliveries(conn: &Connection, id: Uuid) -> Result<(), MarketError> {
    conn.execute(
        "UPDATE middlemen SET total_deliveries = total_deliveries + 1 WHERE id = ?1",
        [id.to_string()],
    )?;
    Ok(())
}

pub fn set_middleman_location(
    conn: &Connection,
    id: Uuid,
    location: GeoPoint,
) -> Result<(), MarketError> {
    conn.execute(
        "UPDATE middlemen SET current_latitude = ?1, current_longitude = ?2 WHERE id = ?3",
        params![location.latitude, location.longitude, id.to_string()],
    )?;
    Ok(())
}

/// Pre-filtered candidate set for the route matcher: available, located,
/// optionally restricted to reefer trucks. Corridor distance is computed by
/// the caller.
pub fn candidate_middlemen(
    conn: &Connection,
    reefer_only: bool,
    limit: usize,
) -> Result<Vec<Middleman>, MarketError> {
    let sql = format!(
        "SELECT {MIDDLEMAN_COLS} FROM middlemen \
         WHERE is_available = 1 \
           AND current_latitude IS NOT NULL \
           AND current_longitude IS NOT NULL \
           AND (?1 = 0 OR truck_type = 'REEFER') \
         LIMIT ?2"
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let rows = stmt
        .query_map(params![reefer_only, limit as i64], row_to_middleman)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

// ------------------------------------------------------------------------
// Orders
// ------------------------------------------------------------------------

pub fn insert_order(conn: &Connection, order: &Order) -> Result<(), MarketError> {
    let route_vector = order
        .route_vector
        .as_ref()
        .map(|points| serde_json::to_string(points))
        .transpose()
        .map_err(|e| MarketError::Db(conversion_err(e.to_string())))?;

    conn.execute(
        &format!(
            "INSERT INTO orders ({ORDER_COLS}) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, \
                     ?17, ?18, ?19, ?20, ?21)"
        ),
        params![
            order.id.to_string(),
            order.farmer_id.to_string(),
            order.buyer_id.map(|id| id.to_string()),
            order.crop_type,
            order.variety,
            order.total_volume_kg,
            order.available_volume_kg,
            order.unit_price_asking,
            order.accepted_price,
            order.status.as_str(),
            order.requires_cold_chain,
            opt_ts(&order.harvest_date),
            route_vector,
            order.crop_image_url,
            order.quality_grade,
            order.pickup_qr_hash,
            order.delivery_qr_hash,
            opt_ts(&order.logistics_search_started_at),
            opt_ts(&order.settled_at),
            ts(&order.created_at),
            opt_ts(&order.updated_at),
        ],
    )?;
    Ok(())
}

/// Write back every mutable order field. Callers load, mutate the struct,
/// then persist through here inside their transaction.
pub fn update_order(conn: &Connection, order: &Order) -> Result<(), MarketError> {
    let route_vector = order
        .route_vector
        .as_ref()
        .map(|points| serde_json::to_string(points))
        .transpose()
        .map_err(|e| MarketError::Db(conversion_err(e.to_string())))?;

    let changed = conn.execute(
        "UPDATE orders SET \
            buyer_id = ?2, available_volume_kg = ?3, accepted_price = ?4, status = ?5, \
            requires_cold_chain = ?6, harvest_date = ?7, route_vector = ?8, \
            crop_image_url = ?9, quality_grade = ?10, pickup_qr_hash = ?11, \
            delivery_qr_hash = ?12, logistics_search_started_at = ?13, settled_at = ?14, \
            updated_at = ?15 \
         WHERE id = ?1",
        params![
            order.id.to_string(),
            order.buyer_id.map(|id| id.to_string()),
            order.available_volume_kg,
            order.accepted_price,
            order.status.as_str(),
            order.requires_cold_chain,
            opt_ts(&order.harvest_date),
            route_vector,
            order.crop_image_url,
            order.quality_grade,
            order.pickup_qr_hash,
            order.delivery_qr_hash,
            opt_ts(&order.logistics_search_started_at),
            opt_ts(&order.settled_at),
            Some(ts(&Utc::now())),
        ],
    )?;
    if changed == 0 {
        return Err(MarketError::OrderNotFound(order.id));
    }
    Ok(())
}

pub fn get_order(conn: &Connection, id: Uuid) -> Result<Option<Order>, MarketError> {
    let mut stmt = conn.prepare_cached(&format!("SELECT {ORDER_COLS} FROM orders WHERE id = ?1"))?;
    let mut rows = stmt.query([id.to_string()])?;
    match rows.next()? {
        Some(row) => Ok(Some(row_to_order(row)?)),
        None => Ok(None),
    }
}

pub fn require_order(conn: &Connection, id: Uuid) -> Result<Order, MarketError> {
    get_order(conn, id)?.ok_or(MarketError::OrderNotFound(id))
}

pub struct OrderFilter<'a> {
    pub status: Option<OrderStatus>,
    pub crop_type: Option<&'a str>,
    pub farmer_id: Option<Uuid>,
    pub limit: i64,
    pub offset: i64,
}

pub fn list_orders(conn: &Connection, filter: &OrderFilter) -> Result<Vec<Order>, MarketError> {
    let sql = format!(
        "SELECT {ORDER_COLS} FROM orders \
         WHERE (?1 IS NULL OR status = ?1) \
           AND (?2 IS NULL OR crop_type LIKE '%' || ?2 || '%') \
           AND (?3 IS NULL OR farmer_id = ?3) \
         ORDER BY created_at DESC \
         LIMIT ?4 OFFSET ?5"
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let rows = stmt
        .query_map(
            params![
                filter.status.map(|s| s.as_str()),
                filter.crop_type,
                filter.farmer_id.map(|id| id.to_string()),
                filter.limit,
                filter.offset,
            ],
            row_to_order,
        )?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Remove a listing and the rows it owns. A LISTED order that was rolled
/// back may still carry a cancelled escrow and a rejected assignment.
pub fn delete_order(conn: &Connection, id: Uuid) -> Result<(), MarketError> {
    conn.execute("DELETE FROM audit_logs WHERE order_id = ?1", [id.to_string()])?;
    conn.execute("DELETE FROM bids WHERE order_id = ?1", [id.to_string()])?;
    conn.execute("DELETE FROM escrows WHERE order_id = ?1", [id.to_string()])?;
    conn.execute(
        "DELETE FROM logistics_assignments WHERE order_id = ?1",
        [id.to_string()],
    )?;
    conn.execute("DELETE FROM orders WHERE id = ?1", [id.to_string()])?;
    Ok(())
}

/// Orders stuck in LOGISTICS_SEARCH since before `cutoff`.
pub fn timed_out_order_ids(
    conn: &Connection,
    cutoff: DateTime<Utc>,
) -> Result<Vec<Uuid>, MarketError> {
    let mut stmt = conn.prepare_cached(
        "SELECT id FROM orders \
         WHERE status = 'LOGISTICS_SEARCH' \
           AND logistics_search_started_at IS NOT NULL \
           AND logistics_search_started_at <= ?1",
    )?;
    let ids = stmt
        .query_map([ts(&cutoff)], |row| {
            let raw: String = row.get(0)?;
            parse_uuid(0, &raw)
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(ids)
}

// ------------------------------------------------------------------------
// Bids
// ------------------------------------------------------------------------

pub fn insert_bid(conn: &Connection, bid: &Bid) -> Result<(), MarketError> {
    conn.execute(
        &format!("INSERT INTO bids ({BID_COLS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"),
        params![
            bid.id.to_string(),
            bid.order_id.to_string(),
            bid.buyer_id.to_string(),
            bid.offered_price_per_kg,
            bid.volume_kg,
            bid.status.as_str(),
            bid.message,
            opt_ts(&bid.expires_at),
            ts(&bid.created_at),
        ],
    )?;
    Ok(())
}

pub fn get_bid(conn: &Connection, id: Uuid) -> Result<Option<Bid>, MarketError> {
    let mut stmt = conn.prepare_cached(&format!("SELECT {BID_COLS} FROM bids WHERE id = ?1"))?;
    let mut rows = stmt.query([id.to_string()])?;
    match rows.next()? {
        Some(row) => Ok(Some(row_to_bid(row)?)),
        None => Ok(None),
    }
}

pub fn set_bid_status(conn: &Connection, id: Uuid, status: BidStatus) -> Result<(), MarketError> {
    let changed = conn.execute(
        "UPDATE bids SET status = ?1 WHERE id = ?2",
        params![status.as_str(), id.to_string()],
    )?;
    if changed == 0 {
        return Err(MarketError::BidNotFound(id));
    }
    Ok(())
}

pub fn list_bids_for_order(conn: &Connection, order_id: Uuid) -> Result<Vec<Bid>, MarketError> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {BID_COLS} FROM bids WHERE order_id = ?1 ORDER BY created_at"
    ))?;
    let rows = stmt
        .query_map([order_id.to_string()], row_to_bid)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

pub fn reject_other_pending_bids(
    conn: &Connection,
    order_id: Uuid,
    except: Uuid,
) -> Result<usize, MarketError> {
    let changed = conn.execute(
        "UPDATE bids SET status = 'REJECTED' \
         WHERE order_id = ?1 AND id != ?2 AND status = 'PENDING'",
        params![order_id.to_string(), except.to_string()],
    )?;
    Ok(changed)
}

pub fn accepted_bid_for_order(
    conn: &Connection,
    order_id: Uuid,
) -> Result<Option<Bid>, MarketError> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {BID_COLS} FROM bids WHERE order_id = ?1 AND status = 'ACCEPTED' LIMIT 1"
    ))?;
    let mut rows = stmt.query([order_id.to_string()])?;
    match rows.next()? {
        Some(row) => Ok(Some(row_to_bid(row)?)),
        None => Ok(None),
    }
}

// ------------------------------------------------------------------------
// Escrows
// ------------------------------------------------------------------------

pub fn insert_escrow(conn: &Connection, escrow: &Escrow) -> Result<(), MarketError> {
    conn.execute(
        &format!(
            "INSERT INTO escrows ({ESCROW_COLS}) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)"
        ),
        params![
            escrow.id.to_string(),
            escrow.order_id.to_string(),
            escrow.total_amount_cents,
            escrow.farmer_released_cents,
            escrow.middleman_released_cents,
            escrow.refunded_cents,
            escrow.status.as_str(),
            escrow.stripe_payment_intent_id,
            escrow.stripe_transfer_farmer_pickup_id,
            escrow.stripe_transfer_farmer_final_id,
            escrow.stripe_transfer_middleman_id,
            opt_ts(&escrow.funds_held_at),
            opt_ts(&escrow.picked_up_at),
            opt_ts(&escrow.delivered_at),
            opt_ts(&escrow.cancelled_at),
            ts(&escrow.created_at),
        ],
    )?;
    Ok(())
}

pub fn update_escrow(conn: &Connection, escrow: &Escrow) -> Result<(), MarketError> {
    let changed = conn.execute(
        "UPDATE escrows SET \
            farmer_released_cents = ?2, middleman_released_cents = ?3, refunded_cents = ?4, \
            status = ?5, stripe_payment_intent_id = ?6, stripe_transfer_farmer_pickup_id = ?7, \
            stripe_transfer_farmer_final_id = ?8, stripe_transfer_middleman_id = ?9, \
            funds_held_at = ?10, picked_up_at = ?11, delivered_at = ?12, cancelled_at = ?13 \
         WHERE id = ?1",
        params![
            escrow.id.to_string(),
            escrow.farmer_released_cents,
            escrow.middleman_released_cents,
            escrow.refunded_cents,
            escrow.status.as_str(),
            escrow.stripe_payment_intent_id,
            escrow.stripe_transfer_farmer_pickup_id,
            escrow.stripe_transfer_farmer_final_id,
            escrow.stripe_transfer_middleman_id,
            opt_ts(&escrow.funds_held_at),
            opt_ts(&escrow.picked_up_at),
            opt_ts(&escrow.delivered_at),
            opt_ts(&escrow.cancelled_at),
        ],
    )?;
    if changed == 0 {
        return Err(MarketError::EscrowMissing(escrow.order_id));
    }
    Ok(())
}

pub fn get_escrow_by_order(conn: &Connection, order_id: Uuid) -> Result<Option<Escrow>, MarketError> {
    let mut stmt =
        conn.prepare_cached(&format!("SELECT {ESCROW_COLS} FROM escrows WHERE order_id = ?1"))?;
    let mut rows = stmt.query([order_id.to_string()])?;
    match rows.next()? {
        Some(row) => Ok(Some(row_to_escrow(row)?)),
        None => Ok(None),
    }
}

pub fn require_escrow(conn: &Connection, order_id: Uuid) -> Result<Escrow, MarketError> {
    get_escrow_by_order(conn, order_id)?.ok_or(MarketError::EscrowMissing(order_id))
}

pub fn get_escrow_by_intent(
    conn: &Connection,
    payment_intent_id: &str,
) -> Result<Option<Escrow>, MarketError> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {ESCROW_COLS} FROM escrows WHERE stripe_payment_intent_id = ?1"
    ))?;
    let mut rows = stmt.query([payment_intent_id])?;
    match rows.next()? {
        Some(row) => Ok(Some(row_to_escrow(row)?)),
        None => Ok(None),
    }
}

// ------------------------------------------------------------------------
// Logistics assignments
// ------------------------------------------------------------------------

pub fn insert_assignment(
    conn: &Connection,
    assignment: &LogisticsAssignment,
) -> Result<(), MarketError> {
    conn.execute(
        &format!(
            "INSERT INTO logistics_assignments ({ASSIGNMENT_COLS}) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
        ),
        params![
            assignment.id.to_string(),
            assignment.order_id.to_string(),
            assignment.middleman_id.to_string(),
            assignment.status.as_str(),
            opt_ts(&assignment.last_gps_ping_at),
            assignment.gps_alert_sent,
            assignment.estimated_distance_km,
            assignment.agreed_fee_cents,
            ts(&assignment.offered_at),
            opt_ts(&assignment.accepted_at),
        ],
    )?;
    Ok(())
}

pub fn update_assignment(
    conn: &Connection,
    assignment: &LogisticsAssignment,
) -> Result<(), MarketError> {
    let changed = conn.execute(
        "UPDATE logistics_assignments SET \
            status = ?2, last_gps_ping_at = ?3, gps_alert_sent = ?4, \
            estimated_distance_km = ?5, agreed_fee_cents = ?6, accepted_at = ?7 \
         WHERE id = ?1",
        params![
            assignment.id.to_string(),
            assignment.status.as_str(),
            opt_ts(&assignment.last_gps_ping_at),
            assignment.gps_alert_sent,
            assignment.estimated_distance_km,
            assignment.agreed_fee_cents,
            opt_ts(&assignment.accepted_at),
        ],
    )?;
    if changed == 0 {
        return Err(MarketError::AssignmentNotFound(assignment.id));
    }
    Ok(())
}

pub fn get_assignment(
    conn: &Connection,
    id: Uuid,
) -> Result<Option<LogisticsAssignment>, MarketError> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {ASSIGNMENT_COLS} FROM logistics_assignments WHERE id = ?1"
    ))?;
    let mut rows = stmt.query([id.to_string()])?;
    match rows.next()? {
        Some(row) => Ok(Some(row_to_assignment(row)?)),
        None => Ok(None),
    }
}

pub fn get_assignment_by_order(
    conn: &Connection,
    order_id: Uuid,
) -> Result<Option<LogisticsAssignment>, MarketError> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {ASSIGNMENT_COLS} FROM logistics_assignments WHERE order_id = ?1"
    ))?;
    let mut rows = stmt.query([order_id.to_string()])?;
    match rows.next()? {
        Some(row) => Ok(Some(row_to_assignment(row)?)),
        None => Ok(None),
    }
}

/// Record a GPS frame against the middleman and the active assignment.
/// Clears the alert flag so the heartbeat monitor re-arms.
pub fn record_gps_ping(
    conn: &Connection,
    order_id: Uuid,
    middleman_id: Uuid,
    location: GeoPoint,
    at: DateTime<Utc>,
) -> Result<(), MarketError> {
    set_middleman_location(conn, middleman_id, location)?;
    conn.execute(
        "UPDATE logistics_assignments \
         SET last_gps_ping_at = ?1, gps_alert_sent = 0 \
         WHERE order_id = ?2 AND middleman_id = ?3",
        params![ts(&at), order_id.to_string(), middleman_id.to_string()],
    )?;
    Ok(())
}

/// Assignments on IN_TRANSIT orders whose heartbeat predates `cutoff` and
/// which have not yet been alerted.
pub fn stale_assignments(
    conn: &Connection,
    cutoff: DateTime<Utc>,
) -> Result<Vec<LogisticsAssignment>, MarketError> {
    let sql = format!(
        "SELECT {cols} FROM logistics_assignments a \
         JOIN orders o ON o.id = a.order_id \
         WHERE o.status = 'IN_TRANSIT' \
           AND a.last_gps_ping_at IS NOT NULL \
           AND a.last_gps_ping_at <= ?1 \
           AND a.gps_alert_sent = 0",
        cols = ASSIGNMENT_COLS
            .split(", ")
            .map(|c| format!("a.{}", c))
            .collect::<Vec<_>>()
            .join(", "),
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let rows = stmt
        .query_map([ts(&cutoff)], row_to_assignment)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

pub fn set_assignment_alert_sent(conn: &Connection, id: Uuid) -> Result<(), MarketError> {
    conn.execute(
        "UPDATE logistics_assignments SET gps_alert_sent = 1 WHERE id = ?1",
        [id.to_string()],
    )?;
    Ok(())
}

// ------------------------------------------------------------------------
// Audit log
// ------------------------------------------------------------------------

pub struct AuditEntry<'a> {
    pub order_id: Uuid,
    pub from_status: Option<&'a str>,
    pub to_status: &'a str,
    pub actor_type: &'a str,
    pub actor_id: Option<Uuid>,
    pub reason: Option<&'a str>,
    pub extra_data: Option<serde_json::Value>,
}

pub fn insert_audit(conn: &Connection, entry: &AuditEntry) -> Result<(), MarketError> {
    let extra_data = entry
        .extra_data
        .as_ref()
        .map(|v| serde_json::to_string(v))
        .transpose()
        .map_err(|e| MarketError::Db(conversion_err(e.to_string())))?;

    conn.execute(
        &format!(
            "INSERT INTO audit_logs ({AUDIT_COLS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
        ),
        params![
            Uuid::new_v4().to_string(),
            entry.order_id.to_string(),
            entry.from_status,
            entry.to_status,
            entry.actor_type,
            entry.actor_id.map(|id| id.to_string()),
            entry.reason,
            extra_data,
            ts(&Utc::now()),
        ],
    )?;
    Ok(())
}

pub fn audit_logs_for_order(
    conn: &Connection,
    order_id: Uuid,
) -> Result<Vec<AuditLog>, MarketError> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {AUDIT_COLS} FROM audit_logs WHERE order_id = ?1 ORDER BY created_at"
    ))?;
    let rows = stmt
        .query_map([order_id.to_string()], row_to_audit)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

// ------------------------------------------------------------------------
// Webhook idempotency
// ------------------------------------------------------------------------

/// Claim a webhook event id. Returns true if this delivery is the first to
/// claim it, false on a duplicate. Callers claim before doing any processor
/// work so concurrent duplicate deliveries cannot both proceed.
pub fn record_webhook_event(conn: &Connection, event_id: &str) -> Result<bool, MarketError> {
    let changed = conn.execute(
        "INSERT OR IGNORE INTO processed_webhook_events (event_id, received_at) VALUES (?1, ?2)",
        params![event_id, ts(&Utc::now())],
    )?;
    Ok(changed > 0)
}

/// Drop a claimed event id after processing failed, so the processor's
/// retry of the same event is not treated as a duplicate.
pub fn release_webhook_event(conn: &Connection, event_id: &str) -> Result<(), MarketError> {
    conn.execute(
        "DELETE FROM processed_webhook_events WHERE event_id = ?1",
        [event_id],
    )?;
    Ok(())
}

#[cfg(test)]
pub mod test_support {
    //! Shared fixtures for store-backed tests.

    use super::*;
    use crate::models::TruckType;

    pub fn temp_store() -> (MarketStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("market.db");
        let store = MarketStore::open(path.to_str().unwrap()).unwrap();
        (store, dir)
    }

    pub fn seed_farmer(store: &MarketStore) -> Farmer {
        let farmer = Farmer {
            id: Uuid::new_v4(),
            name: "Ravi".to_string(),
            phone: format!("+91-{}", Uuid::new_v4().simple()),
            email: format!("{}@farm.example", Uuid::new_v4().simple()),
            location: Some(GeoPoint::new(11.0168, 76.9558)),
            total_transactions: 0,
            stripe_account_id: None,
            created_at: Utc::now(),
        };
        store
            .with_tx(|conn| insert_farmer(conn, &farmer))
            .unwrap();
        farmer
    }

    pub fn seed_buyer(store: &MarketStore) -> Buyer {
        let buyer = Buyer {
            id: Uuid::new_v4(),
            name: "FreshMart".to_string(),
            phone: format!("+91-{}", Uuid::new_v4().simple()),
            email: format!("{}@mart.example", Uuid::new_v4().simple()),
            delivery_location: Some(GeoPoint::new(13.0827, 80.2707)),
            stripe_customer_id: None,
            created_at: Utc::now(),
        };
        store.with_tx(|conn| insert_buyer(conn, &buyer)).unwrap();
        buyer
    }

    pub fn seed_middleman(store: &MarketStore, truck_type: TruckType) -> Middleman {
        seed_middleman_at(store, truck_type, GeoPoint::new(12.0, 78.5))
    }

    pub fn seed_middleman_at(
        store: &MarketStore,
        truck_type: TruckType,
        location: GeoPoint,
    ) -> Middleman {
        let middleman = Middleman {
            id: Uuid::new_v4(),
            name: "Faiz Transport".to_string(),
            phone: format!("+91-{}", Uuid::new_v4().simple()),
            email: format!("{}@truck.example", Uuid::new_v4().simple()),
            current_location: Some(location),
            truck_capacity_kg: 5000.0,
            truck_plate: format!("TN-{}", &Uuid::new_v4().simple().to_string()[..8]),
            truck_type,
            route_radius_km: 150.0,
            on_time_rating: 4.5,
            total_deliveries: 12,
            is_available: true,
            stripe_account_id: None,
            created_at: Utc::now(),
        };
        store
            .with_tx(|conn| insert_middleman(conn, &middleman))
            .unwrap();
        middleman
    }

    pub fn seed_order(store: &MarketStore, farmer_id: Uuid, volume_kg: f64, price: f64) -> Order {
        let order = Order {
            id: Uuid::new_v4(),
            farmer_id,
            buyer_id: None,
            crop_type: "Tomato".to_string(),
            variety: Some("Roma".to_string()),
            total_volume_kg: volume_kg,
            available_volume_kg: volume_kg,
            unit_price_asking: price,
            accepted_price: None,
            status: OrderStatus::Listed,
            requires_cold_chain: false,
            harvest_date: None,
            route_vector: None,
            crop_image_url: None,
            quality_grade: None,
            pickup_qr_hash: None,
            delivery_qr_hash: None,
            logistics_search_started_at: None,
            settled_at: None,
            created_at: Utc::now(),
            updated_at: None,
        };
        store.with_tx(|conn| insert_order(conn, &order)).unwrap();
        order
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn test_order_round_trip() {
        let (store, _dir) = temp_store();
        let farmer = seed_farmer(&store);
        let order = seed_order(&store, farmer.id, 100.0, 0.8);

        let loaded = store
            .with_conn(|conn| require_order(conn, order.id))
            .unwrap();
        assert_eq!(loaded.status, OrderStatus::Listed);
        assert_eq!(loaded.available_volume_kg, 100.0);
        assert_eq!(loaded.crop_type, "Tomato");
        assert!(loaded.buyer_id.is_none());
    }

    #[test]
    fn test_update_order_persists_mutations() {
        let (store, _dir) = temp_store();
        let farmer = seed_farmer(&store);
        let mut order = seed_order(&store, farmer.id, 100.0, 0.8);

        order.status = OrderStatus::Negotiating;
        order.available_volume_kg = 60.0;
        store.with_tx(|conn| update_order(conn, &order)).unwrap();

        let loaded = store
            .with_conn(|conn| require_order(conn, order.id))
            .unwrap();
        assert_eq!(loaded.status, OrderStatus::Negotiating);
        assert_eq!(loaded.available_volume_kg, 60.0);
        assert!(loaded.updated_at.is_some());
    }

    #[test]
    fn test_volume_check_constraint() {
        let (store, _dir) = temp_store();
        let farmer = seed_farmer(&store);
        let mut order = seed_order(&store, farmer.id, 100.0, 0.8);

        // Exceeding total volume violates the schema-level invariant.
        order.available_volume_kg = 150.0;
        let result = store.with_tx(|conn| update_order(conn, &order));
        assert!(result.is_err());

        // The rollback left the row untouched.
        let loaded = store
            .with_conn(|conn| require_order(conn, order.id))
            .unwrap();
        assert_eq!(loaded.available_volume_kg, 100.0);
    }

    #[test]
    fn test_webhook_event_claim_and_release() {
        let (store, _dir) = temp_store();
        let first = store
            .with_tx(|conn| record_webhook_event(conn, "evt_123"))
            .unwrap();
        let second = store
            .with_tx(|conn| record_webhook_event(conn, "evt_123"))
            .unwrap();
        assert!(first);
        assert!(!second);

        // Releasing the claim makes the retry reprocessable.
        store
            .with_tx(|conn| release_webhook_event(conn, "evt_123"))
            .unwrap();
        let retried = store
            .with_tx(|conn| record_webhook_event(conn, "evt_123"))
            .unwrap();
        assert!(retried);
    }

    #[test]
    fn test_candidate_middlemen_reefer_filter() {
        let (store, _dir) = temp_store();
        seed_middleman(&store, TruckType::Reefer);
        seed_middleman(&store, TruckType::DryVan);

        let all = store
            .with_conn(|conn| candidate_middlemen(conn, false, 100))
            .unwrap();
        let reefer = store
            .with_conn(|conn| candidate_middlemen(conn, true, 100))
            .unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(reefer.len(), 1);
        assert_eq!(reefer[0].truck_type, TruckType::Reefer);
    }

    #[test]
    fn test_order_filter_by_status_and_crop() {
        let (store, _dir) = temp_store();
        let farmer = seed_farmer(&store);
        seed_order(&store, farmer.id, 100.0, 0.8);
        let mut other = seed_order(&store, farmer.id, 50.0, 1.2);
        other.status = OrderStatus::Negotiating;
        store.with_tx(|conn| update_order(conn, &other)).unwrap();

        let listed = store
            .with_conn(|conn| {
                list_orders(
                    conn,
                    &OrderFilter {
                        status: Some(OrderStatus::Listed),
                        crop_type: None,
                        farmer_id: Some(farmer.id),
                        limit: 20,
                        offset: 0,
                    },
                )
            })
            .unwrap();
        assert_eq!(listed.len(), 1);

        let tomato = store
            .with_conn(|conn| {
                list_orders(
                    conn,
                    &OrderFilter {
                        status: None,
                        crop_type: Some("tomat"),
                        farmer_id: None,
                        limit: 20,
                        offset: 0,
                    },
                )
            })
            .unwrap();
        // LIKE is case-insensitive for ASCII in SQLite.
        assert_eq!(tomato.len(), 2);
    }
}
