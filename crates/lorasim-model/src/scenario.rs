//! YAML scenario schema.
//!
//! ```yaml
//! simulation:
//!   duration_s: 3600
//!   seed: 7
//! resolver:
//!   model: cochannel
//! channel:
//!   path_loss: { type: log_distance, exponent: 3.76, reference_loss_db: 7.7, reference_distance_m: 1.0 }
//!   links:
//!     - { from: sensor-0, to: gw, loss_db: 120, symmetric: true }
//! gateways:
//!   - name: gw
//!     placement: { type: point, x: 0, y: 0 }
//! end_devices:
//!   - name: sensor
//!     count: 20
//!     placement: { type: disc, radius_m: 2000 }
//!     mac: { spreading_factor: 9, confirmed: true }
//! jammers:
//!   - name: jam
//!     placement: { type: point, x: 300, y: 0 }
//!     profile: all_sf
//!     period_s: 30
//! ```

use lorasim_common::Position;
use lorasim_mac::{EndDeviceConfig, GatewayConfig, JammerConfig, EU868_DEFAULT_CHANNELS};
use lorasim_phy::{EnergyRates, InterferenceResolver, PathLossModel};
use lorasim_server::NetworkServerConfig;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Root of a scenario file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Scenario {
    /// Run parameters.
    pub simulation: SimulationSection,
    /// Collision policy of every radio that does not set its own.
    pub resolver: InterferenceResolver,
    /// Propagation.
    pub channel: ChannelSection,
    /// End-device groups.
    pub end_devices: Vec<EndDeviceEntry>,
    /// Gateways.
    pub gateways: Vec<GatewayEntry>,
    /// Jammers.
    pub jammers: Vec<JammerEntry>,
    /// Network server.
    pub network_server: NetworkServerConfig,
}

/// Run parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationSection {
    /// Simulated time in seconds.
    pub duration_s: f64,
    /// Seed of every random draw.
    pub seed: u64,
}

impl Default for SimulationSection {
    fn default() -> Self {
        SimulationSection {
            duration_s: 3600.0,
            seed: 0,
        }
    }
}

/// Propagation section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelSection {
    /// Distance-based loss.
    pub path_loss: PathLossModel,
    /// Per-link overrides, by node name.
    pub links: Vec<LinkEntry>,
}

/// Fixed loss between two named nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkEntry {
    /// Transmitting node.
    pub from: String,
    /// Receiving node.
    pub to: String,
    /// Loss in dB.
    pub loss_db: f64,
    /// Apply in both directions.
    #[serde(default)]
    pub symmetric: bool,
}

/// Where the nodes of an entry are put.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Placement {
    /// Every node at one point.
    Point {
        /// East, m.
        x: f64,
        /// North, m.
        y: f64,
        /// Height, m.
        #[serde(default)]
        z: f64,
    },
    /// Uniformly over a disc.
    Disc {
        /// Radius, m.
        radius_m: f64,
        /// Center of the disc.
        #[serde(default)]
        center: Position,
    },
}

impl Default for Placement {
    fn default() -> Self {
        Placement::Point { x: 0.0, y: 0.0, z: 0.0 }
    }
}

impl Placement {
    /// Draw one position.
    pub fn sample(&self, rng: &mut impl Rng) -> Position {
        match *self {
            Placement::Point { x, y, z } => Position::new(x, y, z),
            Placement::Disc { radius_m, center } => {
                let r = radius_m * rng.gen::<f64>().sqrt();
                let theta = 2.0 * PI * rng.gen::<f64>();
                Position::new(center.x + r * theta.cos(), center.y + r * theta.sin(), center.z)
            }
        }
    }
}

/// Radio options of an end device.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndDeviceRadio {
    /// Collision policy, scenario-wide one if unset.
    pub resolver: Option<InterferenceResolver>,
    /// Battery capacity in joules, unlimited if unset.
    pub battery_j: Option<f64>,
    /// Current draw.
    pub energy: EnergyRates,
}

/// A group of identical end devices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndDeviceEntry {
    /// Node name, suffixed with `-<index>` when `count > 1`.
    pub name: String,
    /// Number of devices.
    #[serde(default = "default_count")]
    pub count: usize,
    /// Placement of each device.
    #[serde(default)]
    pub placement: Placement,
    /// MAC behaviour.
    #[serde(default)]
    pub mac: EndDeviceConfig,
    /// Radio options.
    #[serde(default)]
    pub radio: EndDeviceRadio,
}

/// A gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayEntry {
    /// Node name, suffixed with `-<index>` when `count > 1`.
    pub name: String,
    /// Number of gateways.
    #[serde(default = "default_count")]
    pub count: usize,
    /// Placement of each gateway.
    #[serde(default)]
    pub placement: Placement,
    /// Number of demodulators.
    #[serde(default = "default_reception_paths")]
    pub reception_paths: usize,
    /// Frequencies the demodulators are spread over.
    #[serde(default = "default_frequencies")]
    pub frequencies: Vec<u32>,
    /// Collision policy, scenario-wide one if unset.
    #[serde(default)]
    pub resolver: Option<InterferenceResolver>,
    /// Do not announce receptions of jammer-origin signals.
    #[serde(default)]
    pub authenticated_preamble: bool,
    /// MAC options.
    #[serde(flatten)]
    pub mac: GatewayConfig,
}

/// A jammer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JammerEntry {
    /// Node name, suffixed with `-<index>` when `count > 1`.
    pub name: String,
    /// Number of jammers.
    #[serde(default = "default_count")]
    pub count: usize,
    /// Placement of each jammer.
    #[serde(default)]
    pub placement: Placement,
    /// Profile and burst parameters.
    #[serde(flatten)]
    pub config: JammerConfig,
}

fn default_count() -> usize {
    1
}

fn default_reception_paths() -> usize {
    8
}

fn default_frequencies() -> Vec<u32> {
    EU868_DEFAULT_CHANNELS.to_vec()
}

/// Names of the nodes an entry expands to.
pub(crate) fn expand_names(name: &str, count: usize) -> Vec<String> {
    if count == 1 {
        vec![name.to_string()]
    } else {
        (0..count).map(|i| format!("{name}-{i}")).collect()
    }
}
