//! Jammer radio.
//!
//! A jammer can put several bursts on air at once (one per SF for the
//! `all_sf` profile). It does not demodulate anything; in reactive mode it
//! only senses the start of legitimate signals to decide when to fire.

use crate::airtime::{sf_index, LoraTxParams, END_DEVICE_SENSITIVITY_DBM};
use crate::PhyTimer;
use lorasim_common::{
    EntityId, EventPayload, LoraFrame, NodeRole, Notification, PacketTag, PhyState, ReceiveAirEvent, SimContext,
    SimTime, TransmitAirEvent,
};
use lorasim_metrics::{metric_defs, metrics, MetricLabels};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

/// What a reactive jammer listens for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReactiveWatch {
    /// Watched frequency.
    pub frequency_hz: u32,
    /// Watched SF, `None` to react to any SF.
    #[serde(default)]
    pub spreading_factor: Option<u8>,
}

/// A legitimate transmission the jammer decided to attack.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JamTrigger {
    /// Node whose transmission was sensed.
    pub target: EntityId,
    /// Its packet id.
    pub packet_id: u64,
    /// Its SF.
    pub spreading_factor: u8,
    /// Its frequency.
    pub frequency_hz: u32,
    /// When it was sensed.
    pub sensed_at: SimTime,
}

/// Jammer radio.
pub struct JammerPhy {
    id: EntityId,
    channel: EntityId,
    sensitivity_dbm: [f64; 6],
    watch: Option<ReactiveWatch>,
    active_bursts: usize,
    metric_labels: MetricLabels,
}

impl JammerPhy {
    /// Create a jammer radio. `watch` enables reactive sensing.
    pub fn new(id: EntityId, channel: EntityId, watch: Option<ReactiveWatch>, metric_labels: MetricLabels) -> Self {
        JammerPhy {
            id,
            channel,
            sensitivity_dbm: END_DEVICE_SENSITIVITY_DBM,
            watch,
            active_bursts: 0,
            metric_labels,
        }
    }

    /// Entity id of the owning node.
    pub fn id(&self) -> EntityId {
        self.id
    }

    /// `Tx` while any burst is on air, `Standby` otherwise.
    pub fn state(&self) -> PhyState {
        if self.active_bursts > 0 {
            PhyState::Tx
        } else {
            PhyState::Standby
        }
    }

    /// Whether a burst is on air.
    pub fn is_transmitting(&self) -> bool {
        self.active_bursts > 0
    }

    /// Put a jamming burst on air. Bursts may overlap.
    pub fn send(
        &mut self,
        frame: LoraFrame,
        params: &LoraTxParams,
        frequency_hz: u32,
        tx_power_dbm: f64,
        ctx: &mut SimContext,
    ) -> SimTime {
        let duration = params.on_air_time(frame.size_bytes);
        let tag = PacketTag {
            spreading_factor: params.spreading_factor,
            frequency_hz,
            preamble_s: params.preamble_duration_s(),
            sender: self.id,
            sender_role: NodeRole::Jammer,
            tx_power_dbm,
            packet_id: frame.packet_id,
        };
        self.active_bursts += 1;

        debug!(
            jammer = %self.id,
            packet_id = frame.packet_id,
            sf = params.spreading_factor,
            frequency_hz,
            duration = %duration,
            "jamming burst"
        );
        ctx.notify(Notification::StartSending {
            node: self.id,
            role: NodeRole::Jammer,
            packet_id: frame.packet_id,
            spreading_factor: params.spreading_factor,
            frequency_hz,
            tx_power_dbm,
            duration,
            tx_attempt: frame.tx_attempt,
        });
        let mut labels = self.metric_labels.to_labels();
        labels.push(("sf", params.spreading_factor.to_string()));
        metrics::counter!(metric_defs::PHY_TX_PACKETS.name, &labels).increment(1);
        metrics::counter!(metric_defs::PHY_TX_AIRTIME.name, &labels).increment(duration.as_micros());

        ctx.post_immediate(
            vec![self.channel],
            EventPayload::TransmitAir(TransmitAirEvent {
                sender: self.id,
                frame,
                tag,
                duration,
            }),
        );
        ctx.post_event(duration, vec![self.id], EventPayload::Timer { timer_id: PhyTimer::TxDone.id() });
        duration
    }

    /// One burst is over.
    pub fn tx_done(&mut self) {
        self.active_bursts = self.active_bursts.saturating_sub(1);
    }

    /// Sense the start of a transmission.
    ///
    /// Returns a trigger when reactive sensing is on, the jammer is not
    /// transmitting, and the signal is a legitimate one on the watched
    /// frequency (and SF, when set) above sensitivity.
    pub fn sense(&self, rx: &ReceiveAirEvent, ctx: &mut SimContext) -> Option<JamTrigger> {
        let watch = self.watch?;
        if rx.tag.is_jammer() || self.is_transmitting() {
            return None;
        }
        let sf = rx.tag.spreading_factor;
        if rx.rx_power_dbm < self.sensitivity_dbm[sf_index(sf)] {
            trace!(jammer = %self.id, packet_id = rx.frame.packet_id, "sensed signal too weak");
            return None;
        }
        if rx.tag.frequency_hz != watch.frequency_hz {
            return None;
        }
        if watch.spreading_factor.is_some_and(|watched| watched != sf) {
            return None;
        }

        ctx.notify(Notification::JammerTriggered {
            jammer: self.id,
            target: rx.tag.sender,
            packet_id: rx.frame.packet_id,
            spreading_factor: sf,
            frequency_hz: rx.tag.frequency_hz,
        });
        Some(JamTrigger {
            target: rx.tag.sender,
            packet_id: rx.frame.packet_id,
            spreading_factor: sf,
            frequency_hz: rx.tag.frequency_hz,
            sensed_at: ctx.time(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lorasim_common::FrameKind;

    const JAMMER: EntityId = EntityId(9);
    const F1: u32 = 868_100_000;

    fn jammer(watch: Option<ReactiveWatch>) -> JammerPhy {
        JammerPhy::new(JAMMER, EntityId(1), watch, MetricLabels::new("jammer-0", "jammer"))
    }

    fn frame(packet_id: u64, kind: FrameKind) -> LoraFrame {
        LoraFrame {
            packet_id,
            kind,
            source: EntityId(2),
            destination: None,
            size_bytes: 20,
            needs_ack: false,
            tx_attempt: 1,
            ack_for: None,
        }
    }

    fn sensed(sf: u8, frequency_hz: u32, power: f64, role: NodeRole) -> ReceiveAirEvent {
        ReceiveAirEvent {
            frame: frame(4, FrameKind::Uplink),
            tag: PacketTag {
                spreading_factor: sf,
                frequency_hz,
                preamble_s: 0.0125,
                sender: EntityId(2),
                sender_role: role,
                tx_power_dbm: 14.0,
                packet_id: 4,
            },
            rx_power_dbm: power,
            duration: SimTime::from_millis(100),
        }
    }

    #[test]
    fn test_reactive_trigger_conditions() {
        let watch = ReactiveWatch {
            frequency_hz: F1,
            spreading_factor: Some(9),
        };
        let j = jammer(Some(watch));
        let mut ctx = SimContext::new(1);

        let hit = j.sense(&sensed(9, F1, -100.0, NodeRole::EndDevice), &mut ctx).unwrap();
        assert_eq!(hit.target, EntityId(2));
        assert_eq!(hit.spreading_factor, 9);

        assert!(j.sense(&sensed(7, F1, -100.0, NodeRole::EndDevice), &mut ctx).is_none());
        assert!(j.sense(&sensed(9, 868_300_000, -100.0, NodeRole::EndDevice), &mut ctx).is_none());
        assert!(j.sense(&sensed(9, F1, -140.0, NodeRole::EndDevice), &mut ctx).is_none());
        assert!(j.sense(&sensed(9, F1, -100.0, NodeRole::Jammer), &mut ctx).is_none());

        let triggered = ctx
            .take_notifications()
            .iter()
            .filter(|r| r.notification.kind() == "jammer_triggered")
            .count();
        assert_eq!(triggered, 1);
    }

    #[test]
    fn test_no_trigger_without_watch_or_while_transmitting() {
        let mut ctx = SimContext::new(1);
        assert!(jammer(None)
            .sense(&sensed(7, F1, -90.0, NodeRole::EndDevice), &mut ctx)
            .is_none());

        let mut j = jammer(Some(ReactiveWatch {
            frequency_hz: F1,
            spreading_factor: None,
        }));
        j.send(frame(1, FrameKind::Jamming), &LoraTxParams::with_sf(7), F1, 14.0, &mut ctx);
        assert!(j.sense(&sensed(7, F1, -90.0, NodeRole::EndDevice), &mut ctx).is_none());
        j.tx_done();
        assert!(j.sense(&sensed(7, F1, -90.0, NodeRole::EndDevice), &mut ctx).is_some());
    }

    #[test]
    fn test_overlapping_bursts() {
        let mut j = jammer(None);
        let mut ctx = SimContext::new(1);
        for sf in 7..=12 {
            j.send(frame(sf as u64, FrameKind::Jamming), &LoraTxParams::with_sf(sf), F1, 14.0, &mut ctx);
        }
        assert_eq!(j.state(), PhyState::Tx);
        assert_eq!(ctx.take_pending_events().len(), 12);
        for _ in 0..5 {
            j.tx_done();
        }
        assert!(j.is_transmitting());
        j.tx_done();
        assert_eq!(j.state(), PhyState::Standby);
    }
}
