//! Multi-demodulator gateway radio.
//!
//! A gateway owns a fixed pool of reception paths, each pinned to one
//! frequency. A signal is demodulated only if a free path on its frequency
//! exists when it arrives. Transmitting never blocks on reception; the
//! gateway's own transmission is recorded in its ledger instead, where it
//! interferes with concurrent uplinks like any other signal.

use crate::airtime::{sf_index, LoraTxParams, GATEWAY_SENSITIVITY_DBM};
use crate::interference::{InterferenceLedger, SignalId};
use crate::resolver::InterferenceResolver;
use crate::{PhyTimer, ReceivedFrame};
use lorasim_common::{
    EntityId, EventPayload, LoraFrame, NodeRole, Notification, PacketTag, ReceiveAirEvent, SimContext, SimTime,
    TransmitAirEvent,
};
use lorasim_metrics::{metric_defs, metrics, MetricLabels};
use std::collections::BTreeMap;
use tracing::{debug, trace};

/// One demodulator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceptionPath {
    frequency_hz: u32,
    locked: Option<SignalId>,
}

impl ReceptionPath {
    /// Create a free path on `frequency_hz`.
    pub fn new(frequency_hz: u32) -> Self {
        ReceptionPath {
            frequency_hz,
            locked: None,
        }
    }

    /// Frequency the path is pinned to.
    pub fn frequency_hz(&self) -> u32 {
        self.frequency_hz
    }

    /// Signal the path is locked on.
    pub fn locked(&self) -> Option<SignalId> {
        self.locked
    }

    /// Whether the path can take a new signal.
    pub fn is_available(&self) -> bool {
        self.locked.is_none()
    }

    fn lock(&mut self, signal: SignalId) {
        assert!(self.locked.is_none(), "locking a busy reception path");
        self.locked = Some(signal);
    }

    fn free(&mut self) {
        assert!(self.locked.is_some(), "freeing a reception path that is not locked");
        self.locked = None;
    }
}

/// Gateway radio configuration.
#[derive(Debug, Clone)]
pub struct GatewayPhyConfig {
    /// Frequency of each reception path.
    pub reception_paths: Vec<u32>,
    /// Sensitivity per SF7..SF12 in dBm.
    pub sensitivity_dbm: [f64; 6],
    /// Collision policy.
    pub resolver: InterferenceResolver,
    /// Do not announce receptions of jammer-origin signals.
    pub authenticated_preamble: bool,
}

impl GatewayPhyConfig {
    /// `count` paths spread round-robin over `frequencies`.
    pub fn with_paths(count: usize, frequencies: &[u32]) -> Self {
        GatewayPhyConfig {
            reception_paths: frequencies.iter().copied().cycle().take(count).collect(),
            ..Default::default()
        }
    }
}

impl Default for GatewayPhyConfig {
    fn default() -> Self {
        GatewayPhyConfig {
            reception_paths: [868_100_000, 868_300_000, 868_500_000].iter().copied().cycle().take(8).collect(),
            sensitivity_dbm: GATEWAY_SENSITIVITY_DBM,
            resolver: InterferenceResolver::default(),
            authenticated_preamble: false,
        }
    }
}

/// Gateway radio.
pub struct GatewayPhy {
    id: EntityId,
    channel: EntityId,
    config: GatewayPhyConfig,
    paths: Vec<ReceptionPath>,
    ledger: InterferenceLedger,
    /// Frames being demodulated, by signal.
    receiving: BTreeMap<SignalId, LoraFrame>,
    transmitting_until: Option<SimTime>,
    metric_labels: MetricLabels,
}

impl GatewayPhy {
    /// Create a gateway radio.
    pub fn new(id: EntityId, channel: EntityId, config: GatewayPhyConfig, metric_labels: MetricLabels) -> Self {
        let paths = config.reception_paths.iter().map(|&f| ReceptionPath::new(f)).collect();
        GatewayPhy {
            id,
            channel,
            config,
            paths,
            ledger: InterferenceLedger::new(),
            receiving: BTreeMap::new(),
            transmitting_until: None,
            metric_labels,
        }
    }

    /// Entity id of the owning node.
    pub fn id(&self) -> EntityId {
        self.id
    }

    /// Reception paths.
    pub fn paths(&self) -> &[ReceptionPath] {
        &self.paths
    }

    /// Interference ledger.
    pub fn ledger(&self) -> &InterferenceLedger {
        &self.ledger
    }

    /// Whether a downlink is on air at `now`.
    pub fn is_transmitting(&self, now: SimTime) -> bool {
        self.transmitting_until.is_some_and(|end| now < end)
    }

    // ========================================================================
    // Receive
    // ========================================================================

    /// Energy from a transmission reaches the gateway antenna.
    pub fn start_receive(&mut self, rx: &ReceiveAirEvent, ctx: &mut SimContext) {
        let now = ctx.time();
        let sf = rx.tag.spreading_factor;
        let frequency_hz = rx.tag.frequency_hz;
        let signal = self.ledger.add(now, rx.duration, rx.rx_power_dbm, sf, rx.tag, frequency_hz);
        let sender = rx.tag.sender;
        let packet_id = rx.frame.packet_id;
        let labels = self.metric_labels.to_labels();

        if self.is_transmitting(now) {
            trace!(gateway = %self.id, packet_id, "transmitting, cannot receive");
            ctx.notify(Notification::LostBecauseTransmitting {
                gateway: self.id,
                sender,
                packet_id,
            });
            metrics::counter!(metric_defs::GATEWAY_LOST_TRANSMITTING.name, &labels).increment(1);
            return;
        }

        let sensitivity = self.config.sensitivity_dbm[sf_index(sf)];
        if rx.rx_power_dbm < sensitivity {
            ctx.notify(Notification::LostBecauseUnderSensitivity {
                receiver: self.id,
                role: NodeRole::Gateway,
                sender,
                packet_id,
                spreading_factor: sf,
                rx_power_dbm: rx.rx_power_dbm,
                sensitivity_dbm: sensitivity,
            });
            metrics::counter!(metric_defs::PHY_RX_UNDER_SENSITIVITY.name, &labels).increment(1);
            return;
        }

        let Some(path) = self
            .paths
            .iter_mut()
            .find(|p| p.is_available() && p.frequency_hz == frequency_hz)
        else {
            debug!(gateway = %self.id, packet_id, frequency_hz, "no free demodulator");
            ctx.notify(Notification::LostBecauseNoMoreReceivers {
                gateway: self.id,
                sender,
                packet_id,
                spreading_factor: sf,
                frequency_hz,
            });
            metrics::counter!(metric_defs::GATEWAY_NO_MORE_RECEIVERS.name, &labels).increment(1);
            return;
        };

        path.lock(signal.id);
        self.receiving.insert(signal.id, rx.frame.clone());
        metrics::gauge!(metric_defs::GATEWAY_ACTIVE_RECEPTIONS.name, &labels).increment(1.0);
        if !(self.config.authenticated_preamble && rx.tag.is_jammer()) {
            ctx.notify(Notification::ReceptionStarted {
                receiver: self.id,
                sender,
                packet_id,
                spreading_factor: sf,
                frequency_hz,
                duration: rx.duration,
            });
        }
        ctx.post_event(
            rx.duration,
            vec![self.id],
            EventPayload::Timer { timer_id: PhyTimer::RxEnd(signal.id).id() },
        );
    }

    /// Reception of `signal` is over. Frees its path and returns the frame
    /// if it survived.
    pub fn end_receive(&mut self, signal: SignalId, ctx: &mut SimContext) -> Option<ReceivedFrame> {
        let Some(path) = self.paths.iter_mut().find(|p| p.locked == Some(signal)) else {
            panic!("end of reception for {:?}, which holds no reception path", signal);
        };
        path.free();
        let labels = self.metric_labels.to_labels();
        metrics::gauge!(metric_defs::GATEWAY_ACTIVE_RECEPTIONS.name, &labels).decrement(1.0);

        let Some(frame) = self.receiving.remove(&signal) else {
            panic!("locked signal {:?} has no frame", signal);
        };
        let outcome = self.config.resolver.resolve(&self.ledger, signal);
        let Some(event) = self.ledger.get(signal).copied() else {
            panic!("locked signal {:?} evicted before its end", signal);
        };
        let mut sf_labels = labels.clone();
        sf_labels.push(("sf", event.spreading_factor.to_string()));

        if outcome.destroyed {
            debug!(
                gateway = %self.id,
                packet_id = frame.packet_id,
                sender = %event.tag.sender,
                colliding_sf = ?outcome.destroying_sf,
                "uplink lost to interference"
            );
            ctx.notify(Notification::LostBecauseInterference {
                receiver: self.id,
                role: NodeRole::Gateway,
                sender: event.tag.sender,
                packet_id: frame.packet_id,
                spreading_factor: event.spreading_factor,
                colliding_sf: outcome.destroying_sf,
                frequency_hz: event.frequency_hz,
                collision: outcome.collision,
                on_preamble: outcome.on_preamble,
            });
            metrics::counter!(metric_defs::PHY_RX_INTERFERED.name, &sf_labels).increment(1);
            return None;
        }

        if outcome.capture_effect {
            ctx.notify(Notification::CaptureEffect {
                receiver: self.id,
                sender: event.tag.sender,
                packet_id: frame.packet_id,
                spreading_factor: event.spreading_factor,
            });
            metrics::counter!(metric_defs::PHY_CAPTURE_EFFECT.name, &labels).increment(1);
        }
        let sinr_db = self.config.resolver.sinr_db(&self.ledger, signal);
        ctx.notify(Notification::ReceivedPacket {
            receiver: self.id,
            role: NodeRole::Gateway,
            sender: event.tag.sender,
            packet_id: frame.packet_id,
            spreading_factor: event.spreading_factor,
            frequency_hz: event.frequency_hz,
            rx_power_dbm: event.rx_power_dbm,
            sinr_db,
        });
        metrics::counter!(metric_defs::PHY_RX_PACKETS.name, &sf_labels).increment(1);
        metrics::histogram!(metric_defs::PHY_RX_SINR.name, &labels).record(sinr_db);
        metrics::histogram!(metric_defs::PHY_RX_RSSI.name, &labels).record(event.rx_power_dbm);

        Some(ReceivedFrame {
            frame,
            tag: event.tag,
            rx_power_dbm: event.rx_power_dbm,
            sinr_db,
            end: event.end,
        })
    }

    // ========================================================================
    // Transmit
    // ========================================================================

    /// Transmit a downlink now. Never refused.
    pub fn send(
        &mut self,
        frame: LoraFrame,
        params: &LoraTxParams,
        frequency_hz: u32,
        tx_power_dbm: f64,
        ctx: &mut SimContext,
    ) -> SimTime {
        let now = ctx.time();
        let duration = params.on_air_time(frame.size_bytes);
        let tag = PacketTag {
            spreading_factor: params.spreading_factor,
            frequency_hz,
            preamble_s: params.preamble_duration_s(),
            sender: self.id,
            sender_role: NodeRole::Gateway,
            tx_power_dbm,
            packet_id: frame.packet_id,
        };
        self.ledger.add(now, duration, tx_power_dbm, params.spreading_factor, tag, frequency_hz);
        self.transmitting_until = Some(self.transmitting_until.map_or(now + duration, |t| t.max(now + duration)));

        debug!(gateway = %self.id, packet_id = frame.packet_id, frequency_hz, "gateway transmitting");
        ctx.notify(Notification::StartSending {
            node: self.id,
            role: NodeRole::Gateway,
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

    /// Downlink over.
    pub fn tx_done(&mut self, ctx: &mut SimContext) {
        if self.transmitting_until.is_some_and(|end| ctx.time() >= end) {
            self.transmitting_until = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::InterferenceModel;
    use lorasim_common::FrameKind;

    const GW: EntityId = EntityId(5);
    const CHANNEL: EntityId = EntityId(1);
    const F1: u32 = 868_100_000;

    fn gateway(config: GatewayPhyConfig) -> GatewayPhy {
        GatewayPhy::new(GW, CHANNEL, config, MetricLabels::new("gw-0", "gateway"))
    }

    fn uplink(sender: u64, sf: u8, power: f64, ms: u64, role: NodeRole) -> ReceiveAirEvent {
        ReceiveAirEvent {
            frame: LoraFrame {
                packet_id: sender * 100,
                kind: FrameKind::Uplink,
                source: EntityId(sender),
                destination: None,
                size_bytes: 54,
                needs_ack: false,
                tx_attempt: 1,
                ack_for: None,
            },
            tag: PacketTag {
                spreading_factor: sf,
                frequency_hz: F1,
                preamble_s: LoraTxParams::with_sf(sf).preamble_duration_s(),
                sender: EntityId(sender),
                sender_role: role,
                tx_power_dbm: 14.0,
                packet_id: sender * 100,
            },
            rx_power_dbm: power,
            duration: SimTime::from_millis(ms),
        }
    }

    fn count(ctx: &mut SimContext, kind: &str) -> usize {
        ctx.take_notifications()
            .iter()
            .filter(|r| r.notification.kind() == kind)
            .count()
    }

    #[test]
    fn test_demodulator_exhaustion() {
        let k = 4;
        let mut gw = gateway(GatewayPhyConfig::with_paths(k, &[F1]));
        let mut ctx = SimContext::new(1);
        for sender in 0..=k as u64 {
            gw.start_receive(&uplink(sender + 1, 7, -90.0, 500, NodeRole::EndDevice), &mut ctx);
        }
        let records = ctx.take_notifications();
        let started = records.iter().filter(|r| r.notification.kind() == "reception_started").count();
        let exhausted: Vec<_> = records
            .iter()
            .filter(|r| r.notification.kind() == "lost_because_no_more_receivers")
            .collect();
        assert_eq!(started, k);
        assert_eq!(exhausted.len(), 1);
        assert!(matches!(
            exhausted[0].notification,
            Notification::LostBecauseNoMoreReceivers { sender: EntityId(5), .. }
        ));

        let locked: Vec<SignalId> = gw.paths().iter().filter_map(|p| p.locked()).collect();
        assert_eq!(locked, vec![SignalId(0), SignalId(1), SignalId(2), SignalId(3)]);
        // Every signal is in the ledger, locked or not.
        assert_eq!(gw.ledger().len(), k + 1);
    }

    #[test]
    fn test_paths_only_match_their_frequency() {
        let mut gw = gateway(GatewayPhyConfig::with_paths(2, &[868_300_000]));
        let mut ctx = SimContext::new(1);
        gw.start_receive(&uplink(1, 7, -90.0, 500, NodeRole::EndDevice), &mut ctx);
        assert_eq!(count(&mut ctx, "lost_because_no_more_receivers"), 1);
    }

    #[test]
    fn test_under_sensitivity_does_not_take_a_path() {
        let mut gw = gateway(GatewayPhyConfig::with_paths(1, &[F1]));
        let mut ctx = SimContext::new(1);
        gw.start_receive(&uplink(1, 12, -143.0, 500, NodeRole::EndDevice), &mut ctx);
        assert_eq!(count(&mut ctx, "lost_because_under_sensitivity"), 1);
        assert!(gw.paths()[0].is_available());

        // With all paths busy, an under-sensitivity signal is still reported as such.
        gw.start_receive(&uplink(2, 12, -100.0, 500, NodeRole::EndDevice), &mut ctx);
        gw.start_receive(&uplink(3, 12, -143.0, 500, NodeRole::EndDevice), &mut ctx);
        let records = ctx.take_notifications();
        assert_eq!(records.last().unwrap().notification.kind(), "lost_because_under_sensitivity");
    }

    #[test]
    fn test_end_receive_frees_path_and_forwards() {
        let mut gw = gateway(GatewayPhyConfig::with_paths(1, &[F1]));
        let mut ctx = SimContext::new(1);
        gw.start_receive(&uplink(1, 7, -90.0, 500, NodeRole::EndDevice), &mut ctx);
        ctx.set_time(SimTime::from_millis(500));
        let got = gw.end_receive(SignalId(0), &mut ctx).unwrap();
        assert_eq!(got.frame.packet_id, 100);
        assert_eq!(got.end, SimTime::from_millis(500));
        assert!(gw.paths()[0].is_available());
    }

    #[test]
    #[should_panic]
    fn test_freeing_an_unlocked_path_panics() {
        let mut gw = gateway(GatewayPhyConfig::with_paths(1, &[F1]));
        let mut ctx = SimContext::new(1);
        gw.end_receive(SignalId(0), &mut ctx);
    }

    #[test]
    fn test_authenticated_preamble_hides_jammer_reception() {
        let config = GatewayPhyConfig {
            authenticated_preamble: true,
            ..GatewayPhyConfig::with_paths(2, &[F1])
        };
        let mut gw = gateway(config);
        let mut ctx = SimContext::new(1);
        gw.start_receive(&uplink(1, 7, -90.0, 500, NodeRole::Jammer), &mut ctx);
        assert_eq!(count(&mut ctx, "reception_started"), 0);
        // The jammer still holds a demodulator.
        assert!(!gw.paths()[0].is_available());
        gw.start_receive(&uplink(2, 7, -90.0, 500, NodeRole::EndDevice), &mut ctx);
        assert_eq!(count(&mut ctx, "reception_started"), 1);
    }

    #[test]
    fn test_own_downlink_destroys_concurrent_uplink() {
        let mut gw = gateway(GatewayPhyConfig::with_paths(8, &[F1]));
        let mut ctx = SimContext::new(1);
        gw.start_receive(&uplink(1, 7, -100.0, 1000, NodeRole::EndDevice), &mut ctx);

        ctx.set_time(SimTime::from_millis(200));
        let ack = LoraFrame {
            packet_id: 7,
            kind: FrameKind::Ack,
            source: EntityId(99),
            destination: Some(EntityId(2)),
            size_bytes: 13,
            needs_ack: false,
            tx_attempt: 1,
            ack_for: Some(1),
        };
        let toa = gw.send(ack, &LoraTxParams::with_sf(7), F1, 14.0, &mut ctx);
        assert!(gw.is_transmitting(ctx.time()));

        // Uplinks arriving during the downlink are missed.
        gw.start_receive(&uplink(3, 9, -100.0, 300, NodeRole::EndDevice), &mut ctx);
        assert_eq!(count(&mut ctx, "lost_because_transmitting"), 1);

        ctx.set_time(SimTime::from_millis(200) + toa);
        gw.tx_done(&mut ctx);
        assert!(!gw.is_transmitting(ctx.time()));

        ctx.set_time(SimTime::from_millis(1000));
        assert!(gw.end_receive(SignalId(0), &mut ctx).is_none());
        assert_eq!(count(&mut ctx, "lost_because_interference"), 1);
    }

    #[test]
    fn test_capture_effect_notification() {
        let config = GatewayPhyConfig {
            resolver: InterferenceResolver::new(InterferenceModel::Cochannel, 0.0),
            ..GatewayPhyConfig::with_paths(8, &[F1])
        };
        let mut gw = gateway(config);
        let mut ctx = SimContext::new(1);
        gw.start_receive(&uplink(1, 7, -120.0, 1000, NodeRole::EndDevice), &mut ctx);
        ctx.set_time(SimTime::from_millis(100));
        gw.start_receive(&uplink(2, 8, -100.0, 2000, NodeRole::EndDevice), &mut ctx);
        ctx.take_notifications();

        ctx.set_time(SimTime::from_millis(1000));
        assert!(gw.end_receive(SignalId(0), &mut ctx).is_some());
        let kinds: Vec<_> = ctx.take_notifications().iter().map(|r| r.notification.kind()).collect();
        assert_eq!(kinds, vec!["capture_effect", "received_packet"]);
    }
}
