//! Domain entities for the trade-coordination core.
//!
//! Relations are expressed by foreign-key id only; related rows are loaded by
//! explicit fetch. The `Order` owns its `Escrow` and `LogisticsAssignment`;
//! participants are referenced by id, never embedded.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Order lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Listed,
    Negotiating,
    LogisticsSearch,
    InTransit,
    Settled,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Listed => "LISTED",
            OrderStatus::Negotiating => "NEGOTIATING",
            OrderStatus::LogisticsSearch => "LOGISTICS_SEARCH",
            OrderStatus::InTransit => "IN_TRANSIT",
            OrderStatus::Settled => "SETTLED",
            OrderStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "LISTED" => Some(OrderStatus::Listed),
            "NEGOTIATING" => Some(OrderStatus::Negotiating),
            "LOGISTICS_SEARCH" => Some(OrderStatus::LogisticsSearch),
            "IN_TRANSIT" => Some(OrderStatus::InTransit),
            "SETTLED" => Some(OrderStatus::Settled),
            "CANCELLED" => Some(OrderStatus::Cancelled),
            _ => None,
        }
    }
}

/// Bid lifecycle states. Acceptance and rejection are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BidStatus {
    Pending,
    Accepted,
    Rejected,
    Withdrawn,
}

impl BidStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BidStatus::Pending => "PENDING",
            BidStatus::Accepted => "ACCEPTED",
            BidStatus::Rejected => "REJECTED",
            BidStatus::Withdrawn => "WITHDRAWN",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(BidStatus::Pending),
            "ACCEPTED" => Some(BidStatus::Accepted),
            "REJECTED" => Some(BidStatus::Rejected),
            "WITHDRAWN" => Some(BidStatus::Withdrawn),
            _ => None,
        }
    }
}

/// Escrow states. CANCELLED is reachable from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EscrowStatus {
    WaitingFunds,
    FundsHeld,
    PickedUp,
    Delivered,
    Cancelled,
}

impl EscrowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EscrowStatus::WaitingFunds => "WAITING_FUNDS",
            EscrowStatus::FundsHeld => "FUNDS_HELD",
            EscrowStatus::PickedUp => "PICKED_UP",
            EscrowStatus::Delivered => "DELIVERED",
            EscrowStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "WAITING_FUNDS" => Some(EscrowStatus::WaitingFunds),
            "FUNDS_HELD" => Some(EscrowStatus::FundsHeld),
            "PICKED_UP" => Some(EscrowStatus::PickedUp),
            "DELIVERED" => Some(EscrowStatus::Delivered),
            "CANCELLED" => Some(EscrowStatus::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AssignmentStatus {
    Offered,
    Accepted,
    Rejected,
}

impl AssignmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssignmentStatus::Offered => "OFFERED",
            AssignmentStatus::Accepted => "ACCEPTED",
            AssignmentStatus::Rejected => "REJECTED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "OFFERED" => Some(AssignmentStatus::Offered),
            "ACCEPTED" => Some(AssignmentStatus::Accepted),
            "REJECTED" => Some(AssignmentStatus::Rejected),
            _ => None,
        }
    }
}

/// Truck classes. Only REEFER satisfies cold-chain transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TruckType {
    Reefer,
    Ventilated,
    Insulated,
    DryVan,
}

impl TruckType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TruckType::Reefer => "REEFER",
            TruckType::Ventilated => "VENTILATED",
            TruckType::Insulated => "INSULATED",
            TruckType::DryVan => "DRY_VAN",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "REEFER" => Some(TruckType::Reefer),
            "VENTILATED" => Some(TruckType::Ventilated),
            "INSULATED" => Some(TruckType::Insulated),
            "DRY_VAN" => Some(TruckType::DryVan),
            _ => None,
        }
    }
}

/// WGS-84 coordinate pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Farmer {
    pub id: Uuid,
    pub name: String,
    pub phone: String,
    pub email: String,
    pub location: Option<GeoPoint>,
    pub total_transactions: i64,
    #[serde(skip_serializing)]
    pub stripe_account_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Buyer {
    pub id: Uuid,
    pub name: String,
    pub phone: String,
    pub email: String,
    pub delivery_location: Option<GeoPoint>,
    #[serde(skip_serializing)]
    pub stripe_customer_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Middleman {
    pub id: Uuid,
    pub name: String,
    pub phone: String,
    pub email: String,
    pub current_location: Option<GeoPoint>,
    pub truck_capacity_kg: f64,
    pub truck_plate: String,
    pub truck_type: TruckType,
    pub route_radius_km: f64,
    pub on_time_rating: f64,
    pub total_deliveries: i64,
    pub is_available: bool,
    #[serde(skip_serializing)]
    pub stripe_account_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub farmer_id: Uuid,
    pub buyer_id: Option<Uuid>,
    pub crop_type: String,
    pub variety: Option<String>,
    pub total_volume_kg: f64,
    pub available_volume_kg: f64,
    pub unit_price_asking: f64,
    pub accepted_price: Option<f64>,
    pub status: OrderStatus,
    pub requires_cold_chain: bool,
    pub harvest_date: Option<DateTime<Utc>>,
    /// Farmer-to-buyer route as an ordered list of WGS-84 points.
    pub route_vector: Option<Vec<GeoPoint>>,
    pub crop_image_url: Option<String>,
    pub quality_grade: Option<String>,
    // SHA-256 digests of the one-time QR secrets. The raw tokens exist only
    // in memory on the acceptance response.
    #[serde(skip_serializing)]
    pub pickup_qr_hash: Option<String>,
    #[serde(skip_serializing)]
    pub delivery_qr_hash: Option<String>,
    pub logistics_search_started_at: Option<DateTime<Utc>>,
    pub settled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bid {
    pub id: Uuid,
    pub order_id: Uuid,
    pub buyer_id: Uuid,
    pub offered_price_per_kg: f64,
    pub volume_kg: f64,
    pub status: BidStatus,
    pub message: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Escrow {
    pub id: Uuid,
    pub order_id: Uuid,
    pub total_amount_cents: i64,
    pub farmer_released_cents: i64,
    pub middleman_released_cents: i64,
    pub refunded_cents: i64,
    pub status: EscrowStatus,
    #[serde(skip_serializing)]
    pub stripe_payment_intent_id: Option<String>,
    #[serde(skip_serializing)]
    pub stripe_transfer_farmer_pickup_id: Option<String>,
    #[serde(skip_serializing)]
    pub stripe_transfer_farmer_final_id: Option<String>,
    #[serde(skip_serializing)]
    pub stripe_transfer_middleman_id: Option<String>,
    pub funds_held_at: Option<DateTime<Utc>>,
    pub picked_up_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogisticsAssignment {
    pub id: Uuid,
    pub order_id: Uuid,
    pub middleman_id: Uuid,
    pub status: AssignmentStatus,
    pub last_gps_ping_at: Option<DateTime<Utc>>,
    pub gps_alert_sent: bool,
    pub estimated_distance_km: Option<f64>,
    pub agreed_fee_cents: Option<i64>,
    pub offered_at: DateTime<Utc>,
    pub accepted_at: Option<DateTime<Utc>>,
}

/// Append-only record of FSM edges and dispute proofs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLog {
    pub id: Uuid,
    pub order_id: Uuid,
    pub from_status: Option<String>,
    pub to_status: String,
    pub actor_type: String,
    pub actor_id: Option<Uuid>,
    pub reason: Option<String>,
    pub extra_data: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// Events fanned out over order rooms.
///
/// Serialized once per broadcast; the `type` tag matches what subscribed
/// clients switch on.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WsEvent {
    #[serde(rename = "CONNECTED")]
    Connected {
        order_id: Uuid,
        role: String,
        user_id: Uuid,
    },
    #[serde(rename = "STATE_SYNC")]
    StateSync {
        order_id: Uuid,
        order_status: OrderStatus,
        escrow_status: Option<EscrowStatus>,
        last_gps_ping_at: Option<DateTime<Utc>>,
    },
    #[serde(rename = "FSM_TRANSITION")]
    FsmTransition {
        order_id: Uuid,
        from: OrderStatus,
        to: OrderStatus,
        timestamp: DateTime<Utc>,
        #[serde(skip_serializing_if = "Option::is_none")]
        metadata: Option<serde_json::Value>,
    },
    #[serde(rename = "NEW_BID")]
    NewBid {
        order_id: Uuid,
        bid_id: Uuid,
        offered_price_per_kg: f64,
        volume_kg: f64,
    },
    #[serde(rename = "ESCROW_UPDATE")]
    EscrowUpdate {
        order_id: Uuid,
        status: EscrowStatus,
        farmer_released_cents: i64,
        middleman_released_cents: i64,
        refunded_cents: i64,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "GPS_HEARTBEAT_LOST")]
    GpsHeartbeatLost {
        order_id: Uuid,
        middleman_id: Uuid,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "LOCATION_UPDATE")]
    LocationUpdate {
        order_id: Uuid,
        middleman_id: Uuid,
        latitude: f64,
        longitude: f64,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "PONG")]
    Pong,
}

impl WsEvent {
    pub fn escrow_update(escrow: &Escrow) -> Self {
        WsEvent::EscrowUpdate {
            order_id: escrow.order_id,
            status: escrow.status,
            farmer_released_cents: escrow.farmer_released_cents,
            middleman_released_cents: escrow.middleman_released_cents,
            refunded_cents: escrow.refunded_cents,
            timestamp: Utc::now(),
        }
    }
}
