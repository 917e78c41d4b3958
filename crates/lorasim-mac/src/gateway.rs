//! Gateway node: radio plus packet forwarder.

use lorasim_common::{
    DownlinkRequestEvent, Entity, EntityId, Event, EventPayload, FrameKind, SimContext, SimError, SimTime,
    UplinkForwardedEvent,
};
use lorasim_metrics::{metric_defs, metrics, MetricLabels};
use lorasim_phy::{GatewayPhy, GatewayPhyConfig, LoraTxParams, PhyTimer, SignalId, TIMER_MAC_BASE};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};

const TIMER_DOWNLINK: u64 = TIMER_MAC_BASE;

/// Gateway MAC configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Highest downlink transmit power in dBm.
    pub max_tx_power_dbm: f64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfig { max_tx_power_dbm: 27.0 }
    }
}

/// Gateway entity.
pub struct Gateway {
    id: EntityId,
    phy: GatewayPhy,
    config: GatewayConfig,
    network_server: EntityId,
    /// Downlinks waiting for their transmit time, by `(send_at, seq)`.
    downlinks: BTreeMap<(SimTime, u64), DownlinkRequestEvent>,
    next_seq: u64,
    metric_labels: MetricLabels,
}

impl Gateway {
    /// Create a gateway forwarding to `network_server`.
    pub fn new(
        id: EntityId,
        channel: EntityId,
        network_server: EntityId,
        config: GatewayConfig,
        phy_config: GatewayPhyConfig,
        metric_labels: MetricLabels,
    ) -> Self {
        Gateway {
            id,
            phy: GatewayPhy::new(id, channel, phy_config, metric_labels.clone()),
            config,
            network_server,
            downlinks: BTreeMap::new(),
            next_seq: 0,
            metric_labels,
        }
    }

    /// Entity id.
    pub fn id(&self) -> EntityId {
        self.id
    }

    /// The radio.
    pub fn phy(&self) -> &GatewayPhy {
        &self.phy
    }

    /// Downlinks accepted but not yet on air.
    pub fn queued_downlinks(&self) -> usize {
        self.downlinks.len()
    }

    fn on_reception_end(&mut self, signal: SignalId, ctx: &mut SimContext) {
        let Some(received) = self.phy.end_receive(signal, ctx) else {
            return;
        };
        if received.frame.kind != FrameKind::Uplink {
            return;
        }
        debug!(
            gateway = %self.id,
            device = %received.frame.source,
            packet_id = received.frame.packet_id,
            "forwarding uplink"
        );
        metrics::counter!(metric_defs::GATEWAY_FORWARDED.name, &self.metric_labels.to_labels()).increment(1);
        ctx.post_immediate(
            vec![self.network_server],
            EventPayload::UplinkForwarded(UplinkForwardedEvent {
                gateway: self.id,
                frame: received.frame,
                tag: received.tag,
                rx_power_dbm: received.rx_power_dbm,
                sinr_db: received.sinr_db,
                end_time: received.end,
            }),
        );
    }

    fn queue_downlink(&mut self, request: &DownlinkRequestEvent, ctx: &mut SimContext) {
        if request.send_at < ctx.time() {
            warn!(gateway = %self.id, device = %request.device, "downlink requested in the past, dropped");
            return;
        }
        self.downlinks.insert((request.send_at, self.next_seq), request.clone());
        self.next_seq += 1;
        ctx.post_at(request.send_at, vec![self.id], EventPayload::Timer { timer_id: TIMER_DOWNLINK });
    }

    fn send_due_downlinks(&mut self, ctx: &mut SimContext) {
        let now = ctx.time();
        while let Some(entry) = self.downlinks.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let request = entry.remove();
            let params = LoraTxParams::with_sf(request.spreading_factor);
            let tx_power_dbm = request.tx_power_dbm.min(self.config.max_tx_power_dbm);
            self.phy.send(request.frame, &params, request.frequency_hz, tx_power_dbm, ctx);
        }
    }
}

impl Entity for Gateway {
    fn entity_id(&self) -> EntityId {
        self.id
    }

    fn handle_event(&mut self, event: &Event, ctx: &mut SimContext) -> Result<(), SimError> {
        match &event.payload {
            EventPayload::ReceiveAir(rx) => self.phy.start_receive(rx, ctx),
            EventPayload::DownlinkRequest(request) => self.queue_downlink(request, ctx),
            EventPayload::Timer { timer_id } => match PhyTimer::decode(*timer_id) {
                Some(PhyTimer::RxEnd(signal)) => self.on_reception_end(signal, ctx),
                Some(PhyTimer::TxDone) => self.phy.tx_done(ctx),
                None if *timer_id == TIMER_DOWNLINK => self.send_due_downlinks(ctx),
                None => {}
            },
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lorasim_common::{EventId, LoraFrame, NodeRole, PacketTag, ReceiveAirEvent};

    const GW: EntityId = EntityId(4);
    const SERVER: EntityId = EntityId(2);
    const F1: u32 = 868_100_000;

    fn gateway() -> Gateway {
        Gateway::new(
            GW,
            EntityId(1),
            SERVER,
            GatewayConfig::default(),
            GatewayPhyConfig::default(),
            MetricLabels::new("gw-0", "gateway"),
        )
    }

    fn event(payload: EventPayload) -> Event {
        Event {
            id: EventId(0),
            time: SimTime::ZERO,
            source: GW,
            targets: vec![GW],
            payload,
        }
    }

    fn frame(kind: FrameKind, packet_id: u64) -> LoraFrame {
        LoraFrame {
            packet_id,
            kind,
            source: EntityId(10),
            destination: None,
            size_bytes: 33,
            needs_ack: true,
            tx_attempt: 1,
            ack_for: None,
        }
    }

    fn uplink(kind: FrameKind) -> ReceiveAirEvent {
        ReceiveAirEvent {
            frame: frame(kind, 1),
            tag: PacketTag {
                spreading_factor: 7,
                frequency_hz: F1,
                preamble_s: 0.0125,
                sender: EntityId(10),
                sender_role: NodeRole::EndDevice,
                tx_power_dbm: 14.0,
                packet_id: 1,
            },
            rx_power_dbm: -100.0,
            duration: SimTime::from_millis(70),
        }
    }

    #[test]
    fn test_forwards_received_uplink_to_server() {
        let mut gw = gateway();
        let mut ctx = SimContext::new(1);
        gw.handle_event(&event(EventPayload::ReceiveAir(uplink(FrameKind::Uplink))), &mut ctx)
            .unwrap();
        let end = ctx.take_pending_events().remove(0);
        ctx.set_time(end.time);
        gw.handle_event(&end, &mut ctx).unwrap();

        let forwarded = ctx.take_pending_events();
        assert_eq!(forwarded.len(), 1);
        assert_eq!(forwarded[0].targets, vec![SERVER]);
        let EventPayload::UplinkForwarded(up) = &forwarded[0].payload else {
            panic!("expected UplinkForwarded");
        };
        assert_eq!(up.gateway, GW);
        assert_eq!(up.end_time, SimTime::from_millis(70));
    }

    #[test]
    fn test_jamming_frames_are_not_forwarded() {
        let mut gw = gateway();
        let mut ctx = SimContext::new(1);
        gw.handle_event(&event(EventPayload::ReceiveAir(uplink(FrameKind::Jamming))), &mut ctx)
            .unwrap();
        let end = ctx.take_pending_events().remove(0);
        ctx.set_time(end.time);
        gw.handle_event(&end, &mut ctx).unwrap();
        assert!(ctx.take_pending_events().is_empty());
    }

    #[test]
    fn test_downlink_sent_at_requested_time() {
        let mut gw = gateway();
        let mut ctx = SimContext::new(1);
        let send_at = SimTime::from_secs(1.5);
        let request = DownlinkRequestEvent {
            device: EntityId(10),
            frame: frame(FrameKind::Ack, 7),
            send_at,
            frequency_hz: F1,
            spreading_factor: 7,
            tx_power_dbm: 14.0,
            window: 1,
        };
        gw.handle_event(&event(EventPayload::DownlinkRequest(request)), &mut ctx)
            .unwrap();
        assert_eq!(gw.queued_downlinks(), 1);
        let timer = ctx.take_pending_events().remove(0);
        assert_eq!(timer.time, send_at);

        ctx.set_time(send_at);
        gw.handle_event(&timer, &mut ctx).unwrap();
        assert_eq!(gw.queued_downlinks(), 0);
        assert!(gw.phy().is_transmitting(send_at));
        let sent = ctx.take_notifications();
        assert_eq!(sent[0].notification.kind(), "start_sending");
    }
}
