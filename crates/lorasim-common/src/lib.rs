//! # lorasim-common
//!
//! Common types and traits for the lorasim LoRaWAN simulation framework.
//!
//! This crate provides core simulation primitives including:
//! - Time representation ([`SimTime`])
//! - Cartesian positions ([`Position`])
//! - Entity identification ([`EntityId`], [`NodeRole`])
//! - Frames and on-air tags ([`LoraFrame`], [`PacketTag`])
//! - Event system ([`Event`], [`EventPayload`])
//! - Simulation context ([`SimContext`]) and scheduler ([`scheduler::Scheduler`])
//! - Entity traits ([`Entity`])
//! - Typed notifications ([`notification::Notification`])

pub mod notification;
pub mod scheduler;

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

pub use notification::{Notification, NotificationRecord, SendRefusal, UplinkFailure};
pub use scheduler::{run_until, Scheduler};

// ============================================================================
// Error Types
// ============================================================================

/// Simulation errors.
#[derive(Debug, Error)]
pub enum SimError {
    /// Entity not found.
    #[error("Entity not found: {0:?}")]
    EntityNotFound(EntityId),

    /// Invalid event target.
    #[error("Invalid event target: {0:?}")]
    InvalidTarget(EntityId),

    /// Simulation time overflow.
    #[error("Simulation time overflow")]
    TimeOverflow,

    /// Event handler error.
    #[error("Event handler error in entity {entity:?}: {message}")]
    HandlerError {
        /// Entity that had the error.
        entity: EntityId,
        /// Error message.
        message: String,
    },
}

// ============================================================================
// Time Types
// ============================================================================

/// Simulation time in nanoseconds since simulation start.
///
/// Also used for durations. Nanosecond resolution keeps symbol-level LoRa
/// timing (preambles, CAD windows) exact enough for overlap arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct SimTime(u64);

impl SimTime {
    /// Zero time.
    pub const ZERO: SimTime = SimTime(0);

    /// Largest representable time.
    pub const MAX: SimTime = SimTime(u64::MAX);

    /// Create from nanoseconds.
    pub const fn from_nanos(ns: u64) -> Self {
        SimTime(ns)
    }

    /// Create from microseconds.
    pub const fn from_micros(us: u64) -> Self {
        SimTime(us * 1_000)
    }

    /// Create from milliseconds.
    pub const fn from_millis(ms: u64) -> Self {
        SimTime(ms * 1_000_000)
    }

    /// Create from seconds (float), rounded to the nearest nanosecond.
    /// Negative values clamp to zero.
    pub fn from_secs(s: f64) -> Self {
        SimTime((s * 1_000_000_000.0).round() as u64)
    }

    /// Get as nanoseconds.
    pub fn as_nanos(&self) -> u64 {
        self.0
    }

    /// Get as microseconds.
    pub fn as_micros(&self) -> u64 {
        self.0 / 1_000
    }

    /// Get as milliseconds.
    pub fn as_millis(&self) -> u64 {
        self.0 / 1_000_000
    }

    /// Get as seconds (float).
    pub fn as_secs_f64(&self) -> f64 {
        self.0 as f64 / 1_000_000_000.0
    }

    /// Add a duration, returning `None` on overflow.
    pub fn checked_add(&self, duration: SimTime) -> Option<SimTime> {
        self.0.checked_add(duration.0).map(SimTime)
    }

    /// Subtract a duration, returning `None` on underflow.
    pub fn checked_sub(&self, duration: SimTime) -> Option<SimTime> {
        self.0.checked_sub(duration.0).map(SimTime)
    }
}

impl std::ops::Add for SimTime {
    type Output = SimTime;

    fn add(self, rhs: Self) -> Self::Output {
        SimTime(self.0.saturating_add(rhs.0))
    }
}

impl std::ops::Sub for SimTime {
    type Output = SimTime;

    fn sub(self, rhs: Self) -> Self::Output {
        SimTime(self.0.saturating_sub(rhs.0))
    }
}

impl std::fmt::Display for SimTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.6}s", self.as_secs_f64())
    }
}

// ============================================================================
// Spatial Types
// ============================================================================

/// Cartesian position in meters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// East coordinate in meters.
    pub x: f64,
    /// North coordinate in meters.
    pub y: f64,
    /// Height in meters.
    #[serde(default)]
    pub z: f64,
}

impl Position {
    /// Create a new position.
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Position { x, y, z }
    }

    /// Euclidean distance to another position in meters.
    pub fn distance_to(&self, other: &Position) -> f64 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2) + (self.z - other.z).powi(2)).sqrt()
    }
}

// ============================================================================
// Entity Types
// ============================================================================

/// Unique identifier for an entity in the simulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityId(pub u64);

impl EntityId {
    /// Create a new entity ID.
    pub fn new(id: u64) -> Self {
        EntityId(id)
    }
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Role of a radio node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    /// LoRaWAN class A end device.
    EndDevice,
    /// Multi-demodulator gateway.
    Gateway,
    /// Jamming attacker.
    Jammer,
}

impl NodeRole {
    /// Label used in metrics and traces.
    pub fn as_label(&self) -> &'static str {
        match self {
            NodeRole::EndDevice => "end_device",
            NodeRole::Gateway => "gateway",
            NodeRole::Jammer => "jammer",
        }
    }
}

/// Radio state of a single-antenna device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhyState {
    /// Radio off, minimal consumption.
    Sleep,
    /// Idle and listening for a preamble.
    Standby,
    /// Transmitting.
    Tx,
    /// Locked on an incoming packet.
    Rx,
    /// Battery exhausted. Absorbing.
    Dead,
}

impl PhyState {
    /// Label used in metrics and traces.
    pub fn as_label(&self) -> &'static str {
        match self {
            PhyState::Sleep => "sleep",
            PhyState::Standby => "standby",
            PhyState::Tx => "tx",
            PhyState::Rx => "rx",
            PhyState::Dead => "dead",
        }
    }
}

/// Cumulative energy consumption per radio state, in joules.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct EnergyConsumption {
    /// Energy spent transmitting.
    pub tx_j: f64,
    /// Energy spent receiving.
    pub rx_j: f64,
    /// Energy spent in standby.
    pub standby_j: f64,
    /// Energy spent sleeping.
    pub sleep_j: f64,
}

impl EnergyConsumption {
    /// Total consumption across all states.
    pub fn total(&self) -> f64 {
        self.tx_j + self.rx_j + self.standby_j + self.sleep_j
    }
}

/// Time interval during which two signals overlapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollisionWindow {
    /// Start of the overlap.
    pub start: SimTime,
    /// End of the overlap.
    pub end: SimTime,
}

// ============================================================================
// Frames
// ============================================================================

/// What a frame carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameKind {
    /// Application uplink from an end device.
    Uplink,
    /// Downlink acknowledgment from the network server.
    Ack,
    /// Jamming burst.
    Jamming,
}

/// MAC-level frame.
///
/// Frames are never mutated by the PHY layer; on-air metadata travels
/// alongside in a [`PacketTag`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoraFrame {
    /// Packet identifier, unique per source.
    pub packet_id: u64,
    /// Frame kind.
    pub kind: FrameKind,
    /// Entity that originated the frame (end device, network server or jammer).
    pub source: EntityId,
    /// Intended receiver, if any.
    pub destination: Option<EntityId>,
    /// PHY payload size in bytes (MAC header and MIC included).
    pub size_bytes: usize,
    /// Whether the sender expects an acknowledgment.
    pub needs_ack: bool,
    /// Transmission attempt, starting at 1.
    pub tx_attempt: u8,
    /// For ACKs: the acknowledged uplink packet id.
    pub ack_for: Option<u64>,
}

/// On-air tag attached by the transmitting PHY.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PacketTag {
    /// Spreading factor used on air.
    pub spreading_factor: u8,
    /// Carrier frequency in Hz.
    pub frequency_hz: u32,
    /// Preamble duration in seconds.
    pub preamble_s: f64,
    /// Transmitting radio.
    pub sender: EntityId,
    /// Role of the transmitting radio.
    pub sender_role: NodeRole,
    /// Transmit power in dBm.
    pub tx_power_dbm: f64,
    /// Packet identifier copied from the frame.
    pub packet_id: u64,
}

impl PacketTag {
    /// Whether the transmission originates from a jammer.
    pub fn is_jammer(&self) -> bool {
        self.sender_role == NodeRole::Jammer
    }
}

// ============================================================================
// Event Types
// ============================================================================

/// Unique identifier for an event. Also the cancellation handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId(pub u64);

/// A simulation event.
#[derive(Debug, Clone)]
pub struct Event {
    /// Unique event ID.
    pub id: EventId,
    /// Time when the event occurs.
    pub time: SimTime,
    /// Entity that created the event.
    pub source: EntityId,
    /// Target entities for the event.
    pub targets: Vec<EntityId>,
    /// Event payload.
    pub payload: EventPayload,
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Event {}

impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Event {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reverse ordering for min-heap (earliest time first, then FIFO by id)
        other.time.cmp(&self.time).then_with(|| other.id.0.cmp(&self.id.0))
    }
}

/// A radio started transmitting (directed to the channel entity).
#[derive(Debug, Clone)]
pub struct TransmitAirEvent {
    /// Radio that is transmitting.
    pub sender: EntityId,
    /// The frame being transmitted.
    pub frame: LoraFrame,
    /// On-air tag.
    pub tag: PacketTag,
    /// Time on air.
    pub duration: SimTime,
}

/// Energy from a transmission arrives at a receiver (from the channel entity).
#[derive(Debug, Clone)]
pub struct ReceiveAirEvent {
    /// The frame being received.
    pub frame: LoraFrame,
    /// On-air tag of the transmission.
    pub tag: PacketTag,
    /// Received power at this receiver in dBm.
    pub rx_power_dbm: f64,
    /// Time on air.
    pub duration: SimTime,
}

/// Gateway forwards a correctly received uplink to the network server.
#[derive(Debug, Clone)]
pub struct UplinkForwardedEvent {
    /// Gateway that received the uplink.
    pub gateway: EntityId,
    /// The received frame.
    pub frame: LoraFrame,
    /// On-air tag of the uplink.
    pub tag: PacketTag,
    /// Received power at the gateway.
    pub rx_power_dbm: f64,
    /// SINR diagnostic at the gateway.
    pub sinr_db: f64,
    /// When the uplink finished on air.
    pub end_time: SimTime,
}

/// Network server asks a gateway to transmit a downlink.
#[derive(Debug, Clone)]
pub struct DownlinkRequestEvent {
    /// Destination end device.
    pub device: EntityId,
    /// The downlink frame.
    pub frame: LoraFrame,
    /// Absolute transmission time.
    pub send_at: SimTime,
    /// Carrier frequency in Hz.
    pub frequency_hz: u32,
    /// Spreading factor.
    pub spreading_factor: u8,
    /// Transmit power in dBm.
    pub tx_power_dbm: f64,
    /// Receive window targeted (1 or 2).
    pub window: u8,
}

/// Event payload variants.
#[derive(Debug, Clone)]
pub enum EventPayload {
    // =========== Radio Layer Events ===========
    /// A radio started transmitting (directed to the channel entity).
    TransmitAir(TransmitAirEvent),
    /// A transmission reaches a receiver (from the channel entity).
    ReceiveAir(ReceiveAirEvent),

    // =========== Backhaul Events ===========
    /// Gateway → network server.
    UplinkForwarded(UplinkForwardedEvent),
    /// Network server → gateway.
    DownlinkRequest(DownlinkRequestEvent),

    // =========== Scheduling ===========
    /// A delayed callback.
    Timer {
        /// User-defined timer ID.
        timer_id: u64,
    },

    // =========== Simulation Control ===========
    /// End the simulation.
    SimulationEnd,
}

// ============================================================================
// Simulation Context
// ============================================================================

/// Context passed to entities during event handling.
///
/// This is the scheduler collaborator seen by entities: current time,
/// scheduling with a cancellation handle, cancellation, the seeded RNG and
/// the notification sink.
pub struct SimContext {
    time: SimTime,
    rng: ChaCha8Rng,
    pending_events: Vec<Event>,
    cancelled: Vec<EventId>,
    notifications: Vec<NotificationRecord>,
    next_event_id: u64,
    source_entity: EntityId,
}

impl SimContext {
    /// Create a new simulation context.
    pub fn new(seed: u64) -> Self {
        SimContext {
            time: SimTime::ZERO,
            rng: ChaCha8Rng::seed_from_u64(seed),
            pending_events: Vec::new(),
            cancelled: Vec::new(),
            notifications: Vec::new(),
            next_event_id: 0,
            source_entity: EntityId(0),
        }
    }

    /// Get the current simulation time.
    pub fn time(&self) -> SimTime {
        self.time
    }

    /// Get mutable access to the random number generator.
    pub fn rng(&mut self) -> &mut ChaCha8Rng {
        &mut self.rng
    }

    /// Set the current time (used by event loop).
    pub fn set_time(&mut self, time: SimTime) {
        self.time = time;
    }

    /// Set the source entity (used by event loop).
    pub fn set_source(&mut self, entity: EntityId) {
        self.source_entity = entity;
    }

    /// Entity currently handling an event.
    pub fn source(&self) -> EntityId {
        self.source_entity
    }

    /// Post an event to occur after a delay. Returns the cancellation handle.
    pub fn post_event(&mut self, delay: SimTime, targets: Vec<EntityId>, payload: EventPayload) -> EventId {
        let at = self.time + delay;
        self.post_at(at, targets, payload)
    }

    /// Post an event at an absolute time. Times in the past are clamped to now.
    pub fn post_at(&mut self, time: SimTime, targets: Vec<EntityId>, payload: EventPayload) -> EventId {
        let id = EventId(self.next_event_id);
        self.next_event_id += 1;
        self.pending_events.push(Event {
            id,
            time: time.max(self.time),
            source: self.source_entity,
            targets,
            payload,
        });
        id
    }

    /// Post an event to occur immediately (at current time).
    pub fn post_immediate(&mut self, targets: Vec<EntityId>, payload: EventPayload) -> EventId {
        self.post_event(SimTime::ZERO, targets, payload)
    }

    /// Cancel a previously posted event. Cancelling an event that already
    /// fired has no effect.
    pub fn cancel_event(&mut self, id: EventId) {
        if let Some(idx) = self.pending_events.iter().position(|e| e.id == id) {
            self.pending_events.remove(idx);
        } else {
            self.cancelled.push(id);
        }
    }

    /// Emit a notification stamped with the current time.
    pub fn notify(&mut self, notification: Notification) {
        self.notifications.push(NotificationRecord {
            time: self.time,
            notification,
        });
    }

    /// Take all pending events (used by event loop).
    pub fn take_pending_events(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.pending_events)
    }

    /// Take all cancellation requests (used by event loop).
    pub fn take_cancelled(&mut self) -> Vec<EventId> {
        std::mem::take(&mut self.cancelled)
    }

    /// Take all notifications emitted since the last call.
    pub fn take_notifications(&mut self) -> Vec<NotificationRecord> {
        std::mem::take(&mut self.notifications)
    }

    /// Events posted but not yet taken by the event loop.
    pub fn pending_events(&self) -> &[Event] {
        &self.pending_events
    }
}

// ============================================================================
// Entity Trait
// ============================================================================

/// Base trait for all simulation entities.
pub trait Entity: Send {
    /// Get the entity's unique ID.
    fn entity_id(&self) -> EntityId;

    /// Handle an event.
    fn handle_event(&mut self, event: &Event, ctx: &mut SimContext) -> Result<(), SimError>;

    /// Energy spent so far, for battery-powered entities.
    fn energy_consumption(&self) -> Option<EnergyConsumption> {
        None
    }
}

// ============================================================================
// Entity Registry
// ============================================================================

/// Registry for managing simulation entities.
///
/// Ordered by entity id so that iteration is deterministic.
pub struct EntityRegistry {
    entities: BTreeMap<EntityId, Box<dyn Entity>>,
}

impl EntityRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        EntityRegistry {
            entities: BTreeMap::new(),
        }
    }

    /// Register an entity.
    pub fn register(&mut self, entity: Box<dyn Entity>) {
        let id = entity.entity_id();
        self.entities.insert(id, entity);
    }

    /// Get an entity by ID.
    pub fn get(&self, id: EntityId) -> Option<&dyn Entity> {
        self.entities.get(&id).map(|e| e.as_ref())
    }

    /// Get a mutable reference to an entity by ID.
    pub fn get_mut(&mut self, id: EntityId) -> Option<&mut Box<dyn Entity>> {
        self.entities.get_mut(&id)
    }

    /// Dispatch an event to its target entities.
    pub fn dispatch_event(&mut self, event: &Event, ctx: &mut SimContext) -> Result<(), SimError> {
        for target in &event.targets {
            let entity = self
                .entities
                .get_mut(target)
                .ok_or(SimError::EntityNotFound(*target))?;
            ctx.set_source(*target);
            entity.handle_event(event, ctx)?;
        }
        Ok(())
    }

    /// Get all entity IDs.
    pub fn entity_ids(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.entities.keys().copied()
    }

    /// Get the number of registered entities.
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    /// Check if the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

impl Default for EntityRegistry {
    fn default() -> Self {
        Self::new()
    }
}
