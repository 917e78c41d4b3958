//! Jamming attacker.

use lorasim_common::{Entity, EntityId, Event, EventPayload, FrameKind, LoraFrame, SimContext, SimError, SimTime};
use lorasim_metrics::{metric_defs, metrics, MetricLabels};
use lorasim_phy::airtime::{MAX_SF, MIN_SF};
use lorasim_phy::{receive_window_duration, JamTrigger, JammerPhy, LoraTxParams, PhyTimer, ReactiveWatch, TIMER_MAC_BASE};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

const TIMER_BURST: u64 = TIMER_MAC_BASE;
const TIMER_REACTIVE: u64 = TIMER_MAC_BASE + 1;

/// How a jammer decides when and how to transmit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "profile", rename_all = "snake_case")]
pub enum JammerProfile {
    /// One burst every `period_s` at a fixed SF.
    FixedSchedule {
        /// Burst SF.
        spreading_factor: u8,
        /// Period in seconds.
        period_s: f64,
    },
    /// One burst every `period_s` at a uniformly random SF.
    RandomSf {
        /// Period in seconds.
        period_s: f64,
    },
    /// Six simultaneous bursts, one per SF, every `period_s`.
    AllSf {
        /// Period in seconds.
        period_s: f64,
    },
    /// Burst on the SF of a sensed legitimate transmission, after a CAD.
    Reactive {
        /// What to listen for.
        watch: ReactiveWatch,
    },
}

impl JammerProfile {
    /// Metric label.
    pub fn as_label(&self) -> &'static str {
        match self {
            JammerProfile::FixedSchedule { .. } => "fixed_schedule",
            JammerProfile::RandomSf { .. } => "random_sf",
            JammerProfile::AllSf { .. } => "all_sf",
            JammerProfile::Reactive { .. } => "reactive",
        }
    }

    fn period(&self) -> Option<SimTime> {
        match *self {
            JammerProfile::FixedSchedule { period_s, .. }
            | JammerProfile::RandomSf { period_s }
            | JammerProfile::AllSf { period_s } => Some(SimTime::from_secs(period_s)),
            JammerProfile::Reactive { .. } => None,
        }
    }
}

/// Jammer configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JammerConfig {
    /// Behaviour.
    #[serde(flatten)]
    pub profile: JammerProfile,
    /// Burst frequency for scheduled profiles.
    #[serde(default = "default_frequency")]
    pub frequency_hz: u32,
    /// Transmit power in dBm.
    #[serde(default = "default_tx_power")]
    pub tx_power_dbm: f64,
    /// Burst payload in bytes.
    #[serde(default = "default_payload")]
    pub payload_bytes: usize,
    /// First burst of scheduled profiles, in seconds.
    #[serde(default)]
    pub start_s: f64,
}

fn default_frequency() -> u32 {
    868_100_000
}

fn default_tx_power() -> f64 {
    14.0
}

fn default_payload() -> usize {
    20
}

/// Jammer entity.
pub struct Jammer {
    id: EntityId,
    phy: JammerPhy,
    config: JammerConfig,
    next_packet_id: u64,
    /// Triggers waiting for their CAD delay, oldest first.
    triggers: Vec<JamTrigger>,
    metric_labels: MetricLabels,
}

impl Jammer {
    /// Create a jammer.
    pub fn new(id: EntityId, channel: EntityId, config: JammerConfig, metric_labels: MetricLabels) -> Self {
        let watch = match config.profile {
            JammerProfile::Reactive { watch } => Some(watch),
            _ => None,
        };
        Jammer {
            id,
            phy: JammerPhy::new(id, channel, watch, metric_labels.clone()),
            config,
            next_packet_id: 1,
            triggers: Vec::new(),
            metric_labels,
        }
    }

    /// Schedule the first burst of a scheduled profile.
    pub fn start(&self, ctx: &mut SimContext) {
        if self.config.profile.period().is_some() {
            ctx.post_event(
                SimTime::from_secs(self.config.start_s),
                vec![self.id],
                EventPayload::Timer { timer_id: TIMER_BURST },
            );
        }
    }

    /// Entity id.
    pub fn id(&self) -> EntityId {
        self.id
    }

    /// The radio.
    pub fn phy(&self) -> &JammerPhy {
        &self.phy
    }

    fn burst(&mut self, sf: u8, frequency_hz: u32, ctx: &mut SimContext) {
        let frame = LoraFrame {
            packet_id: self.next_packet_id,
            kind: FrameKind::Jamming,
            source: self.id,
            destination: None,
            size_bytes: self.config.payload_bytes,
            needs_ack: false,
            tx_attempt: 1,
            ack_for: None,
        };
        self.next_packet_id += 1;
        self.phy
            .send(frame, &LoraTxParams::with_sf(sf), frequency_hz, self.config.tx_power_dbm, ctx);
        let mut labels = self.metric_labels.to_labels();
        labels.push(("profile", self.config.profile.as_label().to_string()));
        metrics::counter!(metric_defs::JAMMER_BURSTS.name, &labels).increment(1);
    }

    fn on_scheduled_burst(&mut self, ctx: &mut SimContext) {
        let frequency_hz = self.config.frequency_hz;
        match self.config.profile {
            JammerProfile::FixedSchedule { spreading_factor, .. } => self.burst(spreading_factor, frequency_hz, ctx),
            JammerProfile::RandomSf { .. } => {
                let sf = ctx.rng().gen_range(MIN_SF..=MAX_SF);
                self.burst(sf, frequency_hz, ctx);
            }
            JammerProfile::AllSf { .. } => {
                for sf in MIN_SF..=MAX_SF {
                    self.burst(sf, frequency_hz, ctx);
                }
            }
            JammerProfile::Reactive { .. } => return,
        }
        if let Some(period) = self.config.profile.period() {
            ctx.post_event(period, vec![self.id], EventPayload::Timer { timer_id: TIMER_BURST });
        }
    }

    fn on_sensed(&mut self, trigger: JamTrigger, ctx: &mut SimContext) {
        let cad = receive_window_duration(trigger.spreading_factor, LoraTxParams::default().bandwidth_hz, 2);
        debug!(
            jammer = %self.id,
            target = %trigger.target,
            packet_id = trigger.packet_id,
            cad = %cad,
            "reactive jamming triggered"
        );
        self.triggers.push(trigger);
        ctx.post_event(cad, vec![self.id], EventPayload::Timer { timer_id: TIMER_REACTIVE });
    }

    fn on_reactive_burst(&mut self, ctx: &mut SimContext) {
        if self.triggers.is_empty() {
            return;
        }
        let trigger = self.triggers.remove(0);
        self.burst(trigger.spreading_factor, trigger.frequency_hz, ctx);
    }
}

impl Entity for Jammer {
    fn entity_id(&self) -> EntityId {
        self.id
    }

    fn handle_event(&mut self, event: &Event, ctx: &mut SimContext) -> Result<(), SimError> {
        match &event.payload {
            EventPayload::ReceiveAir(rx) => {
                if let Some(trigger) = self.phy.sense(rx, ctx) {
                    self.on_sensed(trigger, ctx);
                }
            }
            EventPayload::Timer { timer_id } => match PhyTimer::decode(*timer_id) {
                Some(PhyTimer::TxDone) => self.phy.tx_done(),
                Some(PhyTimer::RxEnd(_)) => {}
                None => match *timer_id {
                    TIMER_BURST => self.on_scheduled_burst(ctx),
                    TIMER_REACTIVE => self.on_reactive_burst(ctx),
                    _ => {}
                },
            },
            _ => {}
        }
        Ok(())
    }
}
