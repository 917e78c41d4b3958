//! Propagation channel entity.
//!
//! Receives `TransmitAir` from radios and delivers `ReceiveAir` to every
//! other registered radio with its received power. Propagation delay is
//! not modelled.

use lorasim_common::{
    Entity, EntityId, Event, EventPayload, Position, ReceiveAirEvent, SimContext, SimError, TransmitAirEvent,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::trace;

/// Speed of light used by the free-space model, m/s.
const SPEED_OF_LIGHT: f64 = 299_792_458.0;

/// Path loss as a function of distance.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PathLossModel {
    /// `L = L0 + 10 n log10(d / d0)`.
    LogDistance {
        /// Path-loss exponent.
        exponent: f64,
        /// Loss at the reference distance, dB.
        reference_loss_db: f64,
        /// Reference distance, m.
        reference_distance_m: f64,
    },
    /// Friis free-space loss at the carrier frequency.
    FreeSpace,
    /// Same loss on every link.
    Fixed {
        /// Loss in dB.
        loss_db: f64,
    },
}

impl Default for PathLossModel {
    fn default() -> Self {
        PathLossModel::LogDistance {
            exponent: 3.76,
            reference_loss_db: 7.7,
            reference_distance_m: 1.0,
        }
    }
}

impl PathLossModel {
    /// Loss in dB over `distance_m` at `frequency_hz`.
    pub fn loss_db(&self, distance_m: f64, frequency_hz: u32) -> f64 {
        match *self {
            PathLossModel::LogDistance {
                exponent,
                reference_loss_db,
                reference_distance_m,
            } => {
                let d = distance_m.max(reference_distance_m);
                reference_loss_db + 10.0 * exponent * (d / reference_distance_m).log10()
            }
            PathLossModel::FreeSpace => {
                let d = distance_m.max(1.0);
                let wavelength = SPEED_OF_LIGHT / frequency_hz as f64;
                20.0 * (4.0 * std::f64::consts::PI * d / wavelength).log10()
            }
            PathLossModel::Fixed { loss_db } => loss_db,
        }
    }
}

/// Per directed link loss that replaces the path-loss model.
#[derive(Debug, Clone, Default)]
pub struct LinkOverrides {
    links: BTreeMap<(EntityId, EntityId), f64>,
}

impl LinkOverrides {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the loss from `from` to `to`.
    pub fn set(&mut self, from: EntityId, to: EntityId, loss_db: f64) {
        self.links.insert((from, to), loss_db);
    }

    /// Set the same loss in both directions.
    pub fn set_symmetric(&mut self, a: EntityId, b: EntityId, loss_db: f64) {
        self.set(a, b, loss_db);
        self.set(b, a, loss_db);
    }

    /// Loss from `from` to `to`, if overridden.
    pub fn get(&self, from: EntityId, to: EntityId) -> Option<f64> {
        self.links.get(&(from, to)).copied()
    }

    /// Number of overridden links.
    pub fn len(&self) -> usize {
        self.links.len()
    }

    /// Whether no link is overridden.
    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }
}

/// The channel entity.
pub struct LoraChannel {
    id: EntityId,
    model: PathLossModel,
    overrides: LinkOverrides,
    radios: BTreeMap<EntityId, Position>,
}

impl LoraChannel {
    /// Create a channel with no attached radios.
    pub fn new(id: EntityId, model: PathLossModel, overrides: LinkOverrides) -> Self {
        LoraChannel {
            id,
            model,
            overrides,
            radios: BTreeMap::new(),
        }
    }

    /// Attach a radio at `position`.
    pub fn attach(&mut self, radio: EntityId, position: Position) {
        self.radios.insert(radio, position);
    }

    /// Attached radios in delivery order.
    pub fn radios(&self) -> impl Iterator<Item = (EntityId, Position)> + '_ {
        self.radios.iter().map(|(&id, &p)| (id, p))
    }

    /// Loss from `from` to `to`, `None` if either radio is unknown.
    pub fn link_loss_db(&self, from: EntityId, to: EntityId, frequency_hz: u32) -> Option<f64> {
        if let Some(loss) = self.overrides.get(from, to) {
            return Some(loss);
        }
        let a = self.radios.get(&from)?;
        let b = self.radios.get(&to)?;
        Some(self.model.loss_db(a.distance_to(b), frequency_hz))
    }

    fn deliver(&self, tx: &TransmitAirEvent, ctx: &mut SimContext) -> Result<(), SimError> {
        if !self.radios.contains_key(&tx.sender) {
            return Err(SimError::EntityNotFound(tx.sender));
        }
        for &receiver in self.radios.keys() {
            if receiver == tx.sender {
                continue;
            }
            let Some(loss) = self.link_loss_db(tx.sender, receiver, tx.tag.frequency_hz) else {
                continue;
            };
            let rx_power_dbm = tx.tag.tx_power_dbm - loss;
            trace!(from = %tx.sender, to = %receiver, rx_power_dbm, "delivering signal");
            ctx.post_immediate(
                vec![receiver],
                EventPayload::ReceiveAir(ReceiveAirEvent {
                    frame: tx.frame.clone(),
                    tag: tx.tag,
                    rx_power_dbm,
                    duration: tx.duration,
                }),
            );
        }
        Ok(())
    }
}

impl Entity for LoraChannel {
    fn entity_id(&self) -> EntityId {
        self.id
    }

    fn handle_event(&mut self, event: &Event, ctx: &mut SimContext) -> Result<(), SimError> {
        match &event.payload {
            EventPayload::TransmitAir(tx) => self.deliver(tx, ctx),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lorasim_common::{EventId, FrameKind, LoraFrame, NodeRole, PacketTag, SimTime};

    fn transmit(sender: u64) -> Event {
        let frame = LoraFrame {
            packet_id: 11,
            kind: FrameKind::Uplink,
            source: EntityId(sender),
            destination: None,
            size_bytes: 20,
            needs_ack: false,
            tx_attempt: 1,
            ack_for: None,
        };
        let tag = PacketTag {
            spreading_factor: 7,
            frequency_hz: 868_100_000,
            preamble_s: 0.0125,
            sender: EntityId(sender),
            sender_role: NodeRole::EndDevice,
            tx_power_dbm: 14.0,
            packet_id: 11,
        };
        Event {
            id: EventId(0),
            time: SimTime::ZERO,
            source: EntityId(sender),
            targets: vec![EntityId(1)],
            payload: EventPayload::TransmitAir(TransmitAirEvent {
                sender: EntityId(sender),
                frame,
                tag,
                duration: SimTime::from_millis(50),
            }),
        }
    }

    #[test]
    fn test_log_distance_defaults() {
        let model = PathLossModel::default();
        assert!((model.loss_db(1.0, 868_100_000) - 7.7).abs() < 1e-12);
        assert!((model.loss_db(10.0, 868_100_000) - 45.3).abs() < 1e-9);
        // Closer than the reference distance is clamped.
        assert_eq!(model.loss_db(0.1, 868_100_000), model.loss_db(1.0, 868_100_000));
    }

    #[test]
    fn test_free_space_grows_6db_per_doubling() {
        let model = PathLossModel::FreeSpace;
        let near = model.loss_db(100.0, 868_000_000);
        let far = model.loss_db(200.0, 868_000_000);
        assert!((far - near - 20.0 * 2f64.log10()).abs() < 1e-9);
        assert!(near > 70.0 && near < 72.0);
    }

    #[test]
    fn test_delivers_to_every_other_radio_in_id_order() {
        let mut channel = LoraChannel::new(EntityId(1), PathLossModel::Fixed { loss_db: 100.0 }, LinkOverrides::new());
        channel.attach(EntityId(7), Position::new(0.0, 0.0, 0.0));
        channel.attach(EntityId(3), Position::new(10.0, 0.0, 0.0));
        channel.attach(EntityId(5), Position::new(20.0, 0.0, 0.0));
        let mut ctx = SimContext::new(1);
        channel.handle_event(&transmit(5), &mut ctx).unwrap();

        let events = ctx.take_pending_events();
        let targets: Vec<EntityId> = events.iter().map(|e| e.targets[0]).collect();
        assert_eq!(targets, vec![EntityId(3), EntityId(7)]);
        for event in &events {
            let EventPayload::ReceiveAir(rx) = &event.payload else {
                panic!("expected ReceiveAir");
            };
            assert_eq!(rx.rx_power_dbm, -86.0);
            assert_eq!(event.time, SimTime::ZERO);
        }
    }

    #[test]
    fn test_link_override_wins() {
        let mut overrides = LinkOverrides::new();
        overrides.set(EntityId(2), EntityId(3), 140.0);
        let mut channel = LoraChannel::new(EntityId(1), PathLossModel::default(), overrides);
        channel.attach(EntityId(2), Position::new(0.0, 0.0, 0.0));
        channel.attach(EntityId(3), Position::new(10.0, 0.0, 0.0));
        assert_eq!(channel.link_loss_db(EntityId(2), EntityId(3), 868_100_000), Some(140.0));
        let reverse = channel.link_loss_db(EntityId(3), EntityId(2), 868_100_000).unwrap();
        assert!((reverse - 45.3).abs() < 1e-9);
    }

    #[test]
    fn test_unknown_sender_is_an_error() {
        let mut channel = LoraChannel::new(EntityId(1), PathLossModel::default(), LinkOverrides::new());
        let mut ctx = SimContext::new(1);
        assert!(matches!(
            channel.handle_event(&transmit(4), &mut ctx),
            Err(SimError::EntityNotFound(EntityId(4)))
        ));
    }
}
