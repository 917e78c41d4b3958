//! Class A end device.
//!
//! Each application packet is sent on a randomly chosen enabled channel
//! that the duty cycle allows, followed by two receive windows. Confirmed
//! uplinks are retransmitted after a random ACK timeout until acknowledged
//! or out of transmissions.

use crate::duty_cycle::DutyCycleTracker;
use crate::{
    max_app_payload, EU868_DEFAULT_CHANNELS, MAC_OVERHEAD_BYTES, RECEIVE_DELAY_1, RECEIVE_DELAY_2, RX2_FREQUENCY_HZ,
    RX2_SPREADING_FACTOR,
};
use lorasim_common::{
    Entity, EntityId, Event, EventId, EventPayload, FrameKind, LoraFrame, Notification, PhyState, SendRefusal,
    SimContext, SimError, SimTime, UplinkFailure,
};
use lorasim_metrics::{metric_defs, metrics, MetricLabels};
use lorasim_phy::{
    receive_window_duration, EndDevicePhy, EndDevicePhyConfig, LoraTxParams, PhyTimer, ReceivedFrame,
    TIMER_MAC_BASE, TIMER_TX_FINISHED,
};
use rand::seq::SliceRandom;
use rand::Rng;
use rand_distr::{Distribution, Exp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, trace, warn};

// ============================================================================
// Configuration
// ============================================================================

/// When application packets are generated.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TrafficModel {
    /// One packet every `period_s`, first one at a random offset.
    Periodic {
        /// Period in seconds.
        period_s: f64,
    },
    /// Exponentially distributed inter-arrival times.
    Poisson {
        /// Mean inter-arrival time in seconds.
        mean_interval_s: f64,
    },
}

impl Default for TrafficModel {
    fn default() -> Self {
        TrafficModel::Periodic { period_s: 600.0 }
    }
}

impl TrafficModel {
    /// Delay before the first packet.
    pub fn first_delay(&self, rng: &mut impl Rng) -> SimTime {
        match *self {
            TrafficModel::Periodic { period_s } => SimTime::from_secs(rng.gen_range(0.0..period_s)),
            TrafficModel::Poisson { .. } => self.next_delay(rng),
        }
    }

    /// Delay between two packets.
    pub fn next_delay(&self, rng: &mut impl Rng) -> SimTime {
        match *self {
            TrafficModel::Periodic { period_s } => SimTime::from_secs(period_s),
            TrafficModel::Poisson { mean_interval_s } => match Exp::new(1.0 / mean_interval_s) {
                Ok(exp) => SimTime::from_secs(exp.sample(rng)),
                Err(_) => SimTime::from_secs(mean_interval_s),
            },
        }
    }
}

/// End-device MAC configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndDeviceConfig {
    /// Uplink spreading factor.
    pub spreading_factor: u8,
    /// Transmit power in dBm.
    pub tx_power_dbm: f64,
    /// Application payload in bytes.
    pub payload_bytes: usize,
    /// Packet generation.
    pub traffic: TrafficModel,
    /// Request an acknowledgment for every uplink.
    pub confirmed: bool,
    /// Transmissions per confirmed uplink, first one included.
    pub max_transmissions: u8,
    /// Enabled uplink channels.
    pub channels: Vec<u32>,
    /// Enforce the EU868 duty cycle.
    pub duty_cycle: bool,
}

impl Default for EndDeviceConfig {
    fn default() -> Self {
        EndDeviceConfig {
            spreading_factor: 7,
            tx_power_dbm: 14.0,
            payload_bytes: 20,
            traffic: TrafficModel::default(),
            confirmed: false,
            max_transmissions: 8,
            channels: EU868_DEFAULT_CHANNELS.to_vec(),
            duty_cycle: true,
        }
    }
}

/// Bookkeeping for one application packet.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UplinkRecord {
    /// When the application produced it.
    pub generated_at: SimTime,
    /// Whether an ACK was requested.
    pub needs_ack: bool,
    /// Transmissions so far.
    pub attempts: u8,
    /// ACK received.
    pub acked: bool,
    /// Why it was abandoned, if it was.
    pub failed: Option<UplinkFailure>,
}

// ============================================================================
// Timer IDs
// ============================================================================

const TIMER_APP: u64 = TIMER_MAC_BASE;
const TIMER_SEND: u64 = TIMER_MAC_BASE + 1;
const TIMER_RX1_OPEN: u64 = TIMER_MAC_BASE + 2;
const TIMER_RX1_CLOSE: u64 = TIMER_MAC_BASE + 3;
const TIMER_RX2_OPEN: u64 = TIMER_MAC_BASE + 4;
const TIMER_RX2_CLOSE: u64 = TIMER_MAC_BASE + 5;
const TIMER_RETRANSMIT: u64 = TIMER_MAC_BASE + 6;

/// Handles of the timers that may need cancelling.
#[derive(Debug, Default)]
struct PendingTimers {
    send: Option<EventId>,
    rx1_close: Option<EventId>,
    rx2_open: Option<EventId>,
    rx2_close: Option<EventId>,
    retransmit: Option<EventId>,
}

impl PendingTimers {
    fn cancel_windows(&mut self, ctx: &mut SimContext) {
        for id in [self.rx1_close.take(), self.rx2_open.take(), self.rx2_close.take()].into_iter().flatten() {
            ctx.cancel_event(id);
        }
    }

    fn cancel_sending(&mut self, ctx: &mut SimContext) {
        for id in [self.send.take(), self.retransmit.take()].into_iter().flatten() {
            ctx.cancel_event(id);
        }
    }
}

/// The uplink currently owned by the MAC.
#[derive(Debug, Clone, Copy)]
struct PendingUplink {
    packet_id: u64,
    needs_ack: bool,
    attempts: u8,
}

#[derive(Debug, Clone, Copy)]
struct LastUplink {
    frequency_hz: u32,
    tx_end: SimTime,
}

// ============================================================================
// End Device Entity
// ============================================================================

/// Class A end device: radio plus MAC.
pub struct EndDevice {
    id: EntityId,
    phy: EndDevicePhy,
    config: EndDeviceConfig,
    params: LoraTxParams,
    duty_cycle: DutyCycleTracker,
    next_packet_id: u64,
    current: Option<PendingUplink>,
    last_uplink: Option<LastUplink>,
    records: BTreeMap<u64, UplinkRecord>,
    /// From a transmission until RX2 closes (or an ACK arrives).
    windows_pending: bool,
    open_window: Option<u8>,
    /// Window whose close timer fired during a reception.
    close_after_rx: Option<u8>,
    timers: PendingTimers,
    metric_labels: MetricLabels,
}

impl EndDevice {
    /// Create an end device.
    pub fn new(
        id: EntityId,
        channel: EntityId,
        config: EndDeviceConfig,
        phy_config: EndDevicePhyConfig,
        metric_labels: MetricLabels,
    ) -> Self {
        let phy = EndDevicePhy::new(id, channel, phy_config, metric_labels.clone());
        EndDevice {
            id,
            phy,
            params: LoraTxParams::with_sf(config.spreading_factor),
            duty_cycle: DutyCycleTracker::eu868(config.duty_cycle),
            config,
            next_packet_id: 1,
            current: None,
            last_uplink: None,
            records: BTreeMap::new(),
            windows_pending: false,
            open_window: None,
            close_after_rx: None,
            timers: PendingTimers::default(),
            metric_labels,
        }
    }

    /// Schedule the first application packet.
    pub fn start(&self, ctx: &mut SimContext) {
        let delay = self.config.traffic.first_delay(ctx.rng());
        ctx.post_event(delay, vec![self.id], EventPayload::Timer { timer_id: TIMER_APP });
    }

    /// Entity id.
    pub fn id(&self) -> EntityId {
        self.id
    }

    /// The radio.
    pub fn phy(&self) -> &EndDevicePhy {
        &self.phy
    }

    /// MAC configuration.
    pub fn config(&self) -> &EndDeviceConfig {
        &self.config
    }

    /// Per packet-id records of every generated packet.
    pub fn records(&self) -> &BTreeMap<u64, UplinkRecord> {
        &self.records
    }

    // ========================================================================
    // Application packets
    // ========================================================================

    fn on_new_packet(&mut self, ctx: &mut SimContext) {
        let delay = self.config.traffic.next_delay(ctx.rng());
        ctx.post_event(delay, vec![self.id], EventPayload::Timer { timer_id: TIMER_APP });

        let packet_id = self.next_packet_id;
        self.next_packet_id += 1;
        self.records.insert(
            packet_id,
            UplinkRecord {
                generated_at: ctx.time(),
                needs_ack: self.config.confirmed,
                attempts: 0,
                acked: false,
                failed: None,
            },
        );
        metrics::counter!(metric_defs::MAC_UPLINKS_GENERATED.name, &self.metric_labels.to_labels()).increment(1);

        let max = max_app_payload(self.config.spreading_factor);
        if self.config.payload_bytes > max {
            self.refuse(
                packet_id,
                SendRefusal::PayloadTooLarge {
                    size: self.config.payload_bytes,
                    max,
                },
                ctx,
            );
            return;
        }
        if self.windows_pending {
            self.refuse(packet_id, SendRefusal::ReceiveWindowPending, ctx);
            return;
        }

        if let Some(previous) = self.current.take() {
            self.timers.cancel_sending(ctx);
            if previous.needs_ack {
                self.fail(previous, UplinkFailure::Superseded, ctx);
            }
        }
        trace!(node = %self.id, packet_id, "new application packet");
        self.current = Some(PendingUplink {
            packet_id,
            needs_ack: self.config.confirmed,
            attempts: 0,
        });
        self.transmit(ctx);
    }

    fn refuse(&self, packet_id: u64, reason: SendRefusal, ctx: &mut SimContext) {
        debug!(node = %self.id, packet_id, ?reason, "uplink refused by MAC");
        ctx.notify(Notification::CannotSend {
            node: self.id,
            packet_id,
            reason,
        });
        let mut labels = self.metric_labels.to_labels();
        labels.push(("reason", reason.as_label().to_string()));
        metrics::counter!(metric_defs::PHY_CANNOT_SEND.name, &labels).increment(1);
    }

    fn fail(&mut self, uplink: PendingUplink, reason: UplinkFailure, ctx: &mut SimContext) {
        debug!(node = %self.id, packet_id = uplink.packet_id, ?reason, "confirmed uplink abandoned");
        if let Some(record) = self.records.get_mut(&uplink.packet_id) {
            record.failed = Some(reason);
        }
        ctx.notify(Notification::UplinkFailed {
            node: self.id,
            packet_id: uplink.packet_id,
            attempts: uplink.attempts,
            reason,
        });
        let mut labels = self.metric_labels.to_labels();
        labels.push(("reason", reason.as_label().to_string()));
        metrics::counter!(metric_defs::MAC_UPLINKS_FAILED.name, &labels).increment(1);
    }

    // ========================================================================
    // Transmission
    // ========================================================================

    /// Send the current uplink now, or postpone it until the duty cycle
    /// frees a channel.
    fn transmit(&mut self, ctx: &mut SimContext) {
        let Some(mut uplink) = self.current else {
            return;
        };
        let now = ctx.time();
        let mut channels = self.config.channels.clone();
        channels.shuffle(ctx.rng());

        let Some(frequency_hz) = channels.iter().copied().find(|&f| self.duty_cycle.available_at(f) <= now) else {
            let Some((_, at)) = self.duty_cycle.earliest(&channels) else {
                warn!(node = %self.id, "no uplink channel enabled");
                return;
            };
            trace!(node = %self.id, packet_id = uplink.packet_id, until = %at, "postponed by duty cycle");
            metrics::histogram!(metric_defs::MAC_DUTY_CYCLE_DELAY.name, &self.metric_labels.to_labels())
                .record((at - now).as_secs_f64());
            self.timers.send = Some(ctx.post_at(at, vec![self.id], EventPayload::Timer { timer_id: TIMER_SEND }));
            return;
        };

        let attempt = uplink.attempts + 1;
        let frame = LoraFrame {
            packet_id: uplink.packet_id,
            kind: FrameKind::Uplink,
            source: self.id,
            destination: None,
            size_bytes: self.config.payload_bytes + MAC_OVERHEAD_BYTES,
            needs_ack: uplink.needs_ack,
            tx_attempt: attempt,
            ack_for: None,
        };
        match self.phy.send(frame, &self.params, frequency_hz, self.config.tx_power_dbm, ctx) {
            Ok(airtime) => {
                self.duty_cycle.record(frequency_hz, now, airtime);
                uplink.attempts = attempt;
                self.current = Some(uplink);
                if let Some(record) = self.records.get_mut(&uplink.packet_id) {
                    record.attempts = attempt;
                }
                self.last_uplink = Some(LastUplink {
                    frequency_hz,
                    tx_end: now + airtime,
                });
                self.windows_pending = true;
            }
            Err(SendRefusal::Dead) => {
                self.current = None;
            }
            Err(reason) => {
                // The radio frees up on its own; try again after a backoff.
                let backoff = SimTime::from_secs(ctx.rng().gen_range(1.0..3.0));
                debug!(node = %self.id, packet_id = uplink.packet_id, ?reason, retry_in = %backoff, "radio refused uplink");
                self.timers.send =
                    Some(ctx.post_event(backoff, vec![self.id], EventPayload::Timer { timer_id: TIMER_SEND }));
            }
        }
    }

    // ========================================================================
    // Receive windows
    // ========================================================================

    fn on_tx_finished(&mut self, ctx: &mut SimContext) {
        let Some(last) = self.last_uplink else {
            return;
        };
        self.phy.switch_to_sleep(ctx);
        ctx.post_at(
            last.tx_end + RECEIVE_DELAY_1,
            vec![self.id],
            EventPayload::Timer { timer_id: TIMER_RX1_OPEN },
        );
        self.timers.rx2_open = Some(ctx.post_at(
            last.tx_end + RECEIVE_DELAY_2,
            vec![self.id],
            EventPayload::Timer { timer_id: TIMER_RX2_OPEN },
        ));
    }

    fn open_window(&mut self, window: u8, ctx: &mut SimContext) {
        let Some(last) = self.last_uplink else {
            return;
        };
        if !self.windows_pending {
            return;
        }
        let (frequency_hz, sf) = match window {
            1 => (last.frequency_hz, self.config.spreading_factor),
            _ => (RX2_FREQUENCY_HZ, RX2_SPREADING_FACTOR),
        };
        self.phy.set_rx_frequency(frequency_hz);
        self.phy.set_rx_spreading_factor(sf);
        if !self.phy.switch_to_standby(ctx) {
            trace!(node = %self.id, window, state = ?self.phy.state(), "cannot open receive window");
        }
        self.open_window = Some(window);
        let length = receive_window_duration(sf, self.params.bandwidth_hz, 1);
        let (timer_id, handle) = match window {
            1 => (TIMER_RX1_CLOSE, &mut self.timers.rx1_close),
            _ => (TIMER_RX2_CLOSE, &mut self.timers.rx2_close),
        };
        *handle = Some(ctx.post_event(length, vec![self.id], EventPayload::Timer { timer_id }));
    }

    fn close_window(&mut self, window: u8, ctx: &mut SimContext) {
        if !self.windows_pending {
            return;
        }
        if self.phy.state() == PhyState::Rx {
            // Let the reception in progress finish first. A reception that
            // outlives both windows closes RX2.
            self.close_after_rx = Some(self.close_after_rx.map_or(window, |w| w.max(window)));
            return;
        }
        self.finish_window(window, ctx);
    }

    fn finish_window(&mut self, window: u8, ctx: &mut SimContext) {
        if window == 2 {
            self.open_window = None;
            self.phy.switch_to_sleep(ctx);
            self.end_exchange(ctx);
            return;
        }
        if self.open_window == Some(2) {
            // RX2 opened while the RX1 reception was still running.
            self.phy.switch_to_standby(ctx);
            return;
        }
        self.open_window = None;
        self.phy.switch_to_sleep(ctx);
    }

    /// Both windows closed without an ACK.
    fn end_exchange(&mut self, ctx: &mut SimContext) {
        self.windows_pending = false;
        let Some(uplink) = self.current else {
            return;
        };
        if !uplink.needs_ack {
            self.current = None;
            return;
        }
        if uplink.attempts >= self.config.max_transmissions {
            self.current = None;
            self.fail(uplink, UplinkFailure::Exhausted, ctx);
            return;
        }
        let timeout = SimTime::from_secs(ctx.rng().gen_range(1.0..3.0));
        self.timers.retransmit =
            Some(ctx.post_event(timeout, vec![self.id], EventPayload::Timer { timer_id: TIMER_RETRANSMIT }));
    }

    fn on_retransmit(&mut self, ctx: &mut SimContext) {
        let Some(uplink) = self.current else {
            return;
        };
        debug!(node = %self.id, packet_id = uplink.packet_id, attempt = uplink.attempts + 1, "retransmitting");
        ctx.notify(Notification::Retransmission {
            node: self.id,
            packet_id: uplink.packet_id,
            attempt: uplink.attempts + 1,
        });
        metrics::counter!(metric_defs::MAC_RETRANSMISSIONS.name, &self.metric_labels.to_labels()).increment(1);
        self.transmit(ctx);
    }

    fn after_reception(&mut self, received: Option<ReceivedFrame>, ctx: &mut SimContext) {
        let ack = received
            .filter(|r| r.frame.kind == FrameKind::Ack && r.frame.destination == Some(self.id))
            .and_then(|r| r.frame.ack_for);
        if let Some(packet_id) = ack {
            if self.on_ack(packet_id, ctx) {
                return;
            }
        }
        if let Some(window) = self.close_after_rx.take() {
            self.finish_window(window, ctx);
        } else if self.open_window.is_none() {
            self.phy.switch_to_sleep(ctx);
        }
    }

    /// Returns `true` if the ACK matched the pending uplink.
    fn on_ack(&mut self, packet_id: u64, ctx: &mut SimContext) -> bool {
        let Some(uplink) = self.current.filter(|u| u.packet_id == packet_id && u.needs_ack) else {
            trace!(node = %self.id, packet_id, "stale ACK");
            return false;
        };
        self.current = None;
        self.timers.cancel_windows(ctx);
        self.windows_pending = false;
        self.open_window = None;
        self.close_after_rx = None;
        self.phy.switch_to_sleep(ctx);

        if let Some(record) = self.records.get_mut(&packet_id) {
            record.acked = true;
        }
        debug!(node = %self.id, packet_id, attempts = uplink.attempts, "uplink acknowledged");
        ctx.notify(Notification::UplinkAcked {
            node: self.id,
            packet_id,
            attempts: uplink.attempts,
        });
        let labels = self.metric_labels.to_labels();
        metrics::counter!(metric_defs::MAC_UPLINKS_ACKED.name, &labels).increment(1);
        metrics::histogram!(metric_defs::MAC_ACK_ATTEMPTS.name, &labels).record(uplink.attempts as f64);
        true
    }

    fn on_timer(&mut self, timer_id: u64, ctx: &mut SimContext) {
        if let Some(timer) = PhyTimer::decode(timer_id) {
            match timer {
                PhyTimer::TxDone => self.phy.tx_done(ctx),
                PhyTimer::RxEnd(signal) => {
                    let received = self.phy.end_receive(signal, ctx);
                    self.after_reception(received, ctx);
                }
            }
            return;
        }
        if self.phy.state() == PhyState::Dead {
            return;
        }
        match timer_id {
            TIMER_TX_FINISHED => self.on_tx_finished(ctx),
            TIMER_APP => self.on_new_packet(ctx),
            TIMER_SEND => {
                self.timers.send = None;
                self.transmit(ctx);
            }
            TIMER_RX1_OPEN => self.open_window(1, ctx),
            TIMER_RX1_CLOSE => {
                self.timers.rx1_close = None;
                self.close_window(1, ctx);
            }
            TIMER_RX2_OPEN => {
                self.timers.rx2_open = None;
                self.open_window(2, ctx);
            }
            TIMER_RX2_CLOSE => {
                self.timers.rx2_close = None;
                self.close_window(2, ctx);
            }
            TIMER_RETRANSMIT => {
                self.timers.retransmit = None;
                self.on_retransmit(ctx);
            }
            _ => {}
        }
    }
}

impl Entity for EndDevice {
    fn entity_id(&self) -> EntityId {
        self.id
    }

    fn handle_event(&mut self, event: &Event, ctx: &mut SimContext) -> Result<(), SimError> {
        match &event.payload {
            EventPayload::ReceiveAir(rx) => self.phy.start_receive(rx, ctx),
            EventPayload::Timer { timer_id } => self.on_timer(*timer_id, ctx),
            EventPayload::SimulationEnd => self.phy.settle(ctx),
            _ => {}
        }
        Ok(())
    }
}
