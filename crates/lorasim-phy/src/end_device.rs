//! Single-antenna end-device radio.
//!
//! States are `Sleep`, `Standby`, `Tx`, `Rx` and the absorbing `Dead`.
//! Every state change charges the time spent in the previous state to the
//! battery; running out forces `Dead`.

use crate::airtime::{sf_index, LoraTxParams, END_DEVICE_SENSITIVITY_DBM};
use crate::energy::{EnergyAccount, EnergyRates};
use crate::interference::{InterferenceLedger, SignalId};
use crate::resolver::InterferenceResolver;
use crate::{PhyTimer, ReceivedFrame, TIMER_TX_FINISHED, TX_FINISHED_DELAY};
use lorasim_common::{
    EntityId, EventPayload, LoraFrame, NodeRole, Notification, PacketTag, PhyState, ReceiveAirEvent, SendRefusal,
    SimContext, SimTime, TransmitAirEvent,
};
use lorasim_metrics::{metric_defs, metrics, MetricLabels};
use tracing::{debug, trace};

/// End-device radio configuration.
#[derive(Debug, Clone)]
pub struct EndDevicePhyConfig {
    /// Sensitivity per SF7..SF12 in dBm.
    pub sensitivity_dbm: [f64; 6],
    /// Collision policy.
    pub resolver: InterferenceResolver,
    /// Current draw per state.
    pub energy: EnergyRates,
    /// Battery capacity in joules, `None` for unlimited.
    pub battery_j: Option<f64>,
}

impl Default for EndDevicePhyConfig {
    fn default() -> Self {
        EndDevicePhyConfig {
            sensitivity_dbm: END_DEVICE_SENSITIVITY_DBM,
            resolver: InterferenceResolver::default(),
            energy: EnergyRates::default(),
            battery_j: None,
        }
    }
}

/// End-device radio state machine.
pub struct EndDevicePhy {
    id: EntityId,
    channel: EntityId,
    config: EndDevicePhyConfig,
    state: PhyState,
    state_since: SimTime,
    rx_frequency_hz: u32,
    rx_spreading_factor: u8,
    ledger: InterferenceLedger,
    energy: EnergyAccount,
    /// Signal currently being demodulated.
    current_rx: Option<(SignalId, LoraFrame)>,
    metric_labels: MetricLabels,
}

impl EndDevicePhy {
    /// Create a radio in `Sleep`, tuned to 868.1 MHz SF7.
    pub fn new(id: EntityId, channel: EntityId, config: EndDevicePhyConfig, metric_labels: MetricLabels) -> Self {
        let energy = EnergyAccount::new(config.energy, config.battery_j);
        EndDevicePhy {
            id,
            channel,
            config,
            state: PhyState::Sleep,
            state_since: SimTime::ZERO,
            rx_frequency_hz: 868_100_000,
            rx_spreading_factor: 7,
            ledger: InterferenceLedger::new(),
            energy,
            current_rx: None,
            metric_labels,
        }
    }

    /// Entity id of the owning node.
    pub fn id(&self) -> EntityId {
        self.id
    }

    /// Current state.
    pub fn state(&self) -> PhyState {
        self.state
    }

    /// Interference ledger.
    pub fn ledger(&self) -> &InterferenceLedger {
        &self.ledger
    }

    /// Battery account.
    pub fn energy(&self) -> &EnergyAccount {
        &self.energy
    }

    /// Frequency the receiver listens on.
    pub fn rx_frequency_hz(&self) -> u32 {
        self.rx_frequency_hz
    }

    /// Spreading factor the receiver listens for.
    pub fn rx_spreading_factor(&self) -> u8 {
        self.rx_spreading_factor
    }

    /// Tune the receiver.
    pub fn set_rx_frequency(&mut self, frequency_hz: u32) {
        self.rx_frequency_hz = frequency_hz;
    }

    /// Select the receive spreading factor.
    pub fn set_rx_spreading_factor(&mut self, spreading_factor: u8) {
        self.rx_spreading_factor = spreading_factor;
    }

    // ========================================================================
    // Transmit
    // ========================================================================

    /// Start transmitting `frame`.
    ///
    /// Only allowed from `Standby` or `Sleep`. Returns the time on air.
    pub fn send(
        &mut self,
        frame: LoraFrame,
        params: &LoraTxParams,
        frequency_hz: u32,
        tx_power_dbm: f64,
        ctx: &mut SimContext,
    ) -> Result<SimTime, SendRefusal> {
        match self.state {
            PhyState::Standby | PhyState::Sleep => {}
            PhyState::Dead => return Err(self.refuse(frame.packet_id, SendRefusal::Dead, ctx)),
            busy => return Err(self.refuse(frame.packet_id, SendRefusal::Busy { state: busy }, ctx)),
        }
        if !self.transition(PhyState::Tx, ctx) {
            return Err(self.refuse(frame.packet_id, SendRefusal::Dead, ctx));
        }

        let duration = params.on_air_time(frame.size_bytes);
        let tag = PacketTag {
            spreading_factor: params.spreading_factor,
            frequency_hz,
            preamble_s: params.preamble_duration_s(),
            sender: self.id,
            sender_role: NodeRole::EndDevice,
            tx_power_dbm,
            packet_id: frame.packet_id,
        };

        debug!(
            node = %self.id,
            packet_id = frame.packet_id,
            sf = params.spreading_factor,
            frequency_hz,
            duration = %duration,
            "end device transmitting"
        );
        ctx.notify(Notification::StartSending {
            node: self.id,
            role: NodeRole::EndDevice,
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
        metrics::histogram!(metric_defs::PHY_TX_PACKET_SIZE.name, &self.metric_labels.to_labels())
            .record(frame.size_bytes as f64);

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
        ctx.post_event(
            duration + TX_FINISHED_DELAY,
            vec![self.id],
            EventPayload::Timer { timer_id: TIMER_TX_FINISHED },
        );
        Ok(duration)
    }

    /// Transmission over: back to standby.
    pub fn tx_done(&mut self, ctx: &mut SimContext) {
        if self.state == PhyState::Tx {
            self.transition(PhyState::Standby, ctx);
        }
    }

    fn refuse(&self, packet_id: u64, reason: SendRefusal, ctx: &mut SimContext) -> SendRefusal {
        trace!(node = %self.id, packet_id, ?reason, "send refused");
        ctx.notify(Notification::CannotSend {
            node: self.id,
            packet_id,
            reason,
        });
        let mut labels = self.metric_labels.to_labels();
        labels.push(("reason", reason.as_label().to_string()));
        metrics::counter!(metric_defs::PHY_CANNOT_SEND.name, &labels).increment(1);
        reason
    }

    // ========================================================================
    // Receive
    // ========================================================================

    /// Energy from a transmission reaches the antenna.
    ///
    /// The signal always enters the ledger. It is demodulated only in
    /// `Standby` with matching frequency, SF and enough power.
    pub fn start_receive(&mut self, rx: &ReceiveAirEvent, ctx: &mut SimContext) {
        let now = ctx.time();
        let sf = rx.tag.spreading_factor;
        let signal = self.ledger.add(now, rx.duration, rx.rx_power_dbm, sf, rx.tag, rx.tag.frequency_hz);
        let sender = rx.tag.sender;
        let packet_id = rx.frame.packet_id;
        let labels = self.metric_labels.to_labels();

        if self.state != PhyState::Standby {
            trace!(node = %self.id, state = ?self.state, packet_id, "not listening");
            ctx.notify(Notification::LostBecauseState {
                receiver: self.id,
                sender,
                packet_id,
                state: self.state,
            });
            let mut labels = labels;
            labels.push(("state", self.state.as_label().to_string()));
            metrics::counter!(metric_defs::PHY_RX_WRONG_STATE.name, &labels).increment(1);
            return;
        }

        let mut listenable = true;
        if rx.tag.frequency_hz != self.rx_frequency_hz {
            listenable = false;
            ctx.notify(Notification::LostBecauseWrongFrequency {
                receiver: self.id,
                sender,
                packet_id,
                expected_hz: self.rx_frequency_hz,
                actual_hz: rx.tag.frequency_hz,
            });
            metrics::counter!(metric_defs::PHY_RX_WRONG_FREQUENCY.name, &labels).increment(1);
        }
        if sf != self.rx_spreading_factor {
            listenable = false;
            ctx.notify(Notification::LostBecauseWrongSpreadingFactor {
                receiver: self.id,
                sender,
                packet_id,
                expected_sf: self.rx_spreading_factor,
                actual_sf: sf,
            });
            metrics::counter!(metric_defs::PHY_RX_WRONG_SF.name, &labels).increment(1);
        }
        let sensitivity = self.config.sensitivity_dbm[sf_index(sf)];
        if rx.rx_power_dbm < sensitivity {
            listenable = false;
            ctx.notify(Notification::LostBecauseUnderSensitivity {
                receiver: self.id,
                role: NodeRole::EndDevice,
                sender,
                packet_id,
                spreading_factor: sf,
                rx_power_dbm: rx.rx_power_dbm,
                sensitivity_dbm: sensitivity,
            });
            metrics::counter!(metric_defs::PHY_RX_UNDER_SENSITIVITY.name, &labels).increment(1);
        }
        if !listenable {
            return;
        }

        if !self.transition(PhyState::Rx, ctx) {
            return;
        }
        trace!(node = %self.id, packet_id, "locked on signal");
        self.current_rx = Some((signal.id, rx.frame.clone()));
        ctx.post_event(
            rx.duration,
            vec![self.id],
            EventPayload::Timer { timer_id: PhyTimer::RxEnd(signal.id).id() },
        );
    }

    /// Reception of `signal` is over; decide whether it survived.
    pub fn end_receive(&mut self, signal: SignalId, ctx: &mut SimContext) -> Option<ReceivedFrame> {
        let frame = match self.current_rx.take() {
            Some((locked, frame)) if locked == signal => frame,
            other => {
                // Lost lock (device died mid-reception).
                self.current_rx = other;
                return None;
            }
        };

        let outcome = self.config.resolver.resolve(&self.ledger, signal);
        let Some(event) = self.ledger.get(signal).copied() else {
            panic!("locked signal {:?} evicted before its end", signal);
        };
        let mut labels = self.metric_labels.to_labels();
        labels.push(("sf", event.spreading_factor.to_string()));

        let received = if outcome.destroyed {
            debug!(node = %self.id, packet_id = frame.packet_id, sf = ?outcome.destroying_sf, "lost to interference");
            ctx.notify(Notification::LostBecauseInterference {
                receiver: self.id,
                role: NodeRole::EndDevice,
                sender: event.tag.sender,
                packet_id: frame.packet_id,
                spreading_factor: event.spreading_factor,
                colliding_sf: outcome.destroying_sf,
                frequency_hz: event.frequency_hz,
                collision: outcome.collision,
                on_preamble: outcome.on_preamble,
            });
            metrics::counter!(metric_defs::PHY_RX_INTERFERED.name, &labels).increment(1);
            None
        } else {
            let sinr_db = self.config.resolver.sinr_db(&self.ledger, signal);
            ctx.notify(Notification::ReceivedPacket {
                receiver: self.id,
                role: NodeRole::EndDevice,
                sender: event.tag.sender,
                packet_id: frame.packet_id,
                spreading_factor: event.spreading_factor,
                frequency_hz: event.frequency_hz,
                rx_power_dbm: event.rx_power_dbm,
                sinr_db,
            });
            metrics::counter!(metric_defs::PHY_RX_PACKETS.name, &labels).increment(1);
            metrics::histogram!(metric_defs::PHY_RX_SINR.name, &self.metric_labels.to_labels()).record(sinr_db);
            metrics::histogram!(metric_defs::PHY_RX_RSSI.name, &self.metric_labels.to_labels())
                .record(event.rx_power_dbm);
            Some(ReceivedFrame {
                frame,
                tag: event.tag,
                rx_power_dbm: event.rx_power_dbm,
                sinr_db,
                end: event.end,
            })
        };

        if self.state == PhyState::Rx {
            self.transition(PhyState::Standby, ctx);
        }
        received
    }

    // ========================================================================
    // Receive-window controls
    // ========================================================================

    /// Wake up to listen. Ignored while busy or dead.
    pub fn switch_to_standby(&mut self, ctx: &mut SimContext) -> bool {
        match self.state {
            PhyState::Standby => true,
            PhyState::Sleep => self.transition(PhyState::Standby, ctx),
            _ => false,
        }
    }

    /// Go to sleep. Ignored while busy or dead.
    pub fn switch_to_sleep(&mut self, ctx: &mut SimContext) -> bool {
        match self.state {
            PhyState::Sleep => true,
            PhyState::Standby => self.transition(PhyState::Sleep, ctx),
            _ => false,
        }
    }

    /// Charge the time spent in the current state up to now and publish
    /// the energy gauges.
    pub fn settle(&mut self, ctx: &mut SimContext) {
        let state = self.state;
        if state != PhyState::Dead {
            self.transition(state, ctx);
        }
        let consumption = self.energy.consumption();
        let labels = self.metric_labels.to_labels();
        for (state, joules) in [
            ("tx", consumption.tx_j),
            ("rx", consumption.rx_j),
            ("standby", consumption.standby_j),
            ("sleep", consumption.sleep_j),
        ] {
            let mut l = labels.clone();
            l.push(("state", state.to_string()));
            metrics::gauge!(metric_defs::ENERGY_CONSUMED.name, &l).set(joules);
        }
        if self.energy.remaining_j().is_finite() {
            metrics::gauge!(metric_defs::ENERGY_REMAINING.name, &labels).set(self.energy.remaining_j());
        }
    }

    /// Charge the previous state and move to `next`. Returns `false` if the
    /// battery ran out (the radio is then `Dead`) or was already dead.
    fn transition(&mut self, next: PhyState, ctx: &mut SimContext) -> bool {
        if self.state == PhyState::Dead {
            return false;
        }
        let now = ctx.time();
        let exhausted = self.energy.charge(self.state, now - self.state_since);
        self.state_since = now;
        if exhausted {
            self.die(ctx);
            return false;
        }
        self.state = next;
        true
    }

    fn die(&mut self, ctx: &mut SimContext) {
        self.state = PhyState::Dead;
        self.current_rx = None;
        let consumption = self.energy.consumption();
        debug!(node = %self.id, total_j = consumption.total(), "battery exhausted");
        ctx.notify(Notification::DeadDevice {
            node: self.id,
            consumption,
        });
        metrics::counter!(metric_defs::ENERGY_DEAD_DEVICES.name, &self.metric_labels.to_labels()).increment(1);
    }
}
