//! # lorasim-model
//!
//! YAML scenario loading and simulation building for lorasim.
//!
//! This crate provides:
//! - the scenario schema ([`Scenario`])
//! - loading and validation from files and strings
//! - [`build_simulation`], which turns a scenario into registered entities
//!   and a seeded context holding their first events
//!
//! Entity ids are allocated in a fixed order: the channel, the network
//! server, then gateways, end devices and jammers in file order.

pub mod scenario;

pub use scenario::{
    ChannelSection, EndDeviceEntry, EndDeviceRadio, GatewayEntry, JammerEntry, LinkEntry, Placement, Scenario,
    SimulationSection,
};

use lorasim_common::{Entity, EntityId, EntityRegistry, NodeRole, Position, SimContext, SimTime};
use lorasim_mac::{EndDevice, Gateway, Jammer, JammerProfile, LoraNode};
use lorasim_metrics::MetricLabels;
use lorasim_phy::airtime::{MAX_SF, MIN_SF};
use lorasim_phy::{EndDevicePhyConfig, GatewayPhyConfig, LinkOverrides, LoraChannel};
use lorasim_server::NetworkServer;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use scenario::expand_names;
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;
use tracing::debug;

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur while loading or building a scenario.
#[derive(Debug, Error)]
pub enum ModelError {
    /// YAML parsing error.
    #[error("YAML parse error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// IO error.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Two nodes share a name.
    #[error("Duplicate node name: {0}")]
    DuplicateNode(String),

    /// A link names a node that does not exist.
    #[error("Invalid link: {from} -> {to}")]
    InvalidLink {
        /// Transmitting node.
        from: String,
        /// Receiving node.
        to: String,
    },

    /// Spreading factor outside 7..=12.
    #[error("Node '{node}': spreading factor {spreading_factor} is outside 7..=12")]
    InvalidSpreadingFactor {
        /// Node name.
        node: String,
        /// Offending value.
        spreading_factor: u8,
    },
}

// ============================================================================
// Loading
// ============================================================================

/// Load and validate a scenario file.
pub fn load_scenario(path: &Path) -> Result<Scenario, ModelError> {
    let yaml = std::fs::read_to_string(path)?;
    load_scenario_from_str(&yaml)
}

/// Parse and validate a scenario from a YAML string.
pub fn load_scenario_from_str(yaml: &str) -> Result<Scenario, ModelError> {
    let scenario: Scenario = serde_yaml::from_str(yaml)?;
    scenario.validate()?;
    Ok(scenario)
}

fn check_sf(node: &str, spreading_factor: u8) -> Result<(), ModelError> {
    if (MIN_SF..=MAX_SF).contains(&spreading_factor) {
        Ok(())
    } else {
        Err(ModelError::InvalidSpreadingFactor {
            node: node.to_string(),
            spreading_factor,
        })
    }
}

impl Scenario {
    /// Every node name, in entity-id order.
    pub fn node_names(&self) -> Vec<String> {
        let gateways = self.gateways.iter().flat_map(|g| expand_names(&g.name, g.count));
        let devices = self.end_devices.iter().flat_map(|d| expand_names(&d.name, d.count));
        let jammers = self.jammers.iter().flat_map(|j| expand_names(&j.name, j.count));
        gateways.chain(devices).chain(jammers).collect()
    }

    /// Simulated duration.
    pub fn duration(&self) -> SimTime {
        SimTime::from_secs(self.simulation.duration_s)
    }

    /// Check the scenario for values the simulation cannot run with.
    pub fn validate(&self) -> Result<(), ModelError> {
        if self.simulation.duration_s.is_nan() || self.simulation.duration_s <= 0.0 {
            return Err(ModelError::InvalidConfig(format!(
                "simulation.duration_s must be positive, got {}",
                self.simulation.duration_s
            )));
        }

        for entry in &self.end_devices {
            if entry.count == 0 {
                return Err(ModelError::InvalidConfig(format!("end device '{}' has count 0", entry.name)));
            }
            check_sf(&entry.name, entry.mac.spreading_factor)?;
            if entry.mac.channels.is_empty() {
                return Err(ModelError::InvalidConfig(format!("end device '{}' has no channels", entry.name)));
            }
            if entry.mac.max_transmissions == 0 {
                return Err(ModelError::InvalidConfig(format!(
                    "end device '{}' has max_transmissions 0",
                    entry.name
                )));
            }
        }
        for entry in &self.gateways {
            if entry.count == 0 {
                return Err(ModelError::InvalidConfig(format!("gateway '{}' has count 0", entry.name)));
            }
            if entry.reception_paths == 0 || entry.frequencies.is_empty() {
                return Err(ModelError::InvalidConfig(format!(
                    "gateway '{}' needs at least one reception path and one frequency",
                    entry.name
                )));
            }
        }
        for entry in &self.jammers {
            if entry.count == 0 {
                return Err(ModelError::InvalidConfig(format!("jammer '{}' has count 0", entry.name)));
            }
            match entry.config.profile {
                JammerProfile::FixedSchedule { spreading_factor, period_s } => {
                    check_sf(&entry.name, spreading_factor)?;
                    check_period(&entry.name, period_s)?;
                }
                JammerProfile::RandomSf { period_s } | JammerProfile::AllSf { period_s } => {
                    check_period(&entry.name, period_s)?;
                }
                JammerProfile::Reactive { watch } => {
                    if let Some(sf) = watch.spreading_factor {
                        check_sf(&entry.name, sf)?;
                    }
                }
            }
        }

        let mut names = std::collections::BTreeSet::new();
        for name in self.node_names() {
            if !names.insert(name.clone()) {
                return Err(ModelError::DuplicateNode(name));
            }
        }
        for link in &self.channel.links {
            if !names.contains(&link.from) || !names.contains(&link.to) {
                return Err(ModelError::InvalidLink {
                    from: link.from.clone(),
                    to: link.to.clone(),
                });
            }
        }
        Ok(())
    }
}

fn check_period(node: &str, period_s: f64) -> Result<(), ModelError> {
    if period_s > 0.0 {
        Ok(())
    } else {
        Err(ModelError::InvalidConfig(format!("jammer '{node}' needs a positive period_s")))
    }
}

// ============================================================================
// Building
// ============================================================================

/// Information about a node for display and statistics.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    /// Node name from the scenario.
    pub name: String,
    /// Node role.
    pub role: NodeRole,
    /// Entity id.
    pub entity_id: EntityId,
    /// Where the node was placed.
    pub position: Position,
}

/// Result of building a simulation from a scenario.
pub struct BuiltSimulation {
    /// Entity registry with all entities.
    pub entities: EntityRegistry,
    /// Context seeded from the scenario, holding the nodes' first events.
    pub context: SimContext,
    /// The channel entity.
    pub channel: EntityId,
    /// The network server entity.
    pub network_server: EntityId,
    /// Every radio node, in entity-id order.
    pub node_infos: Vec<NodeInfo>,
}

/// Build a simulation from a scenario.
pub fn build_simulation(scenario: &Scenario, seed: u64) -> Result<BuiltSimulation, ModelError> {
    scenario.validate()?;

    let mut entities = EntityRegistry::new();
    let mut context = SimContext::new(seed);
    // Positions have their own stream so that adding a node does not
    // change the traffic of the others.
    let mut placement_rng = ChaCha8Rng::seed_from_u64(seed);

    let channel_id = EntityId::new(0);
    let server_id = EntityId::new(1);
    let mut next_entity_id: u64 = 2;
    let mut allocate = || {
        let id = EntityId::new(next_entity_id);
        next_entity_id += 1;
        id
    };

    let mut nodes: Vec<LoraNode> = Vec::new();
    let mut node_infos: Vec<NodeInfo> = Vec::new();

    for entry in &scenario.gateways {
        let resolver = entry.resolver.unwrap_or(scenario.resolver);
        for name in expand_names(&entry.name, entry.count) {
            let id = allocate();
            let phy_config = GatewayPhyConfig {
                resolver,
                authenticated_preamble: entry.authenticated_preamble,
                ..GatewayPhyConfig::with_paths(entry.reception_paths, &entry.frequencies)
            };
            let gateway = Gateway::new(
                id,
                channel_id,
                server_id,
                entry.mac.clone(),
                phy_config,
                MetricLabels::new(name.as_str(), NodeRole::Gateway.as_label()),
            );
            node_infos.push(NodeInfo {
                name,
                role: NodeRole::Gateway,
                entity_id: id,
                position: entry.placement.sample(&mut placement_rng),
            });
            nodes.push(gateway.into());
        }
    }

    for entry in &scenario.end_devices {
        let phy_config = EndDevicePhyConfig {
            resolver: entry.radio.resolver.unwrap_or(scenario.resolver),
            energy: entry.radio.energy,
            battery_j: entry.radio.battery_j,
            ..EndDevicePhyConfig::default()
        };
        for name in expand_names(&entry.name, entry.count) {
            let id = allocate();
            let device = EndDevice::new(
                id,
                channel_id,
                entry.mac.clone(),
                phy_config.clone(),
                MetricLabels::new(name.as_str(), NodeRole::EndDevice.as_label()),
            );
            node_infos.push(NodeInfo {
                name,
                role: NodeRole::EndDevice,
                entity_id: id,
                position: entry.placement.sample(&mut placement_rng),
            });
            nodes.push(device.into());
        }
    }

    for entry in &scenario.jammers {
        for name in expand_names(&entry.name, entry.count) {
            let id = allocate();
            let jammer = Jammer::new(
                id,
                channel_id,
                entry.config.clone(),
                MetricLabels::new(name.as_str(), NodeRole::Jammer.as_label()),
            );
            node_infos.push(NodeInfo {
                name,
                role: NodeRole::Jammer,
                entity_id: id,
                position: entry.placement.sample(&mut placement_rng),
            });
            nodes.push(jammer.into());
        }
    }

    // Links were checked by validate(), every name resolves.
    let ids: BTreeMap<&str, EntityId> = node_infos.iter().map(|n| (n.name.as_str(), n.entity_id)).collect();
    let mut overrides = LinkOverrides::new();
    for link in &scenario.channel.links {
        let (Some(&from), Some(&to)) = (ids.get(link.from.as_str()), ids.get(link.to.as_str())) else {
            return Err(ModelError::InvalidLink {
                from: link.from.clone(),
                to: link.to.clone(),
            });
        };
        if link.symmetric {
            overrides.set_symmetric(from, to, link.loss_db);
        } else {
            overrides.set(from, to, link.loss_db);
        }
    }

    let mut channel = LoraChannel::new(channel_id, scenario.channel.path_loss, overrides);
    for info in &node_infos {
        debug!(
            node = %info.name,
            id = %info.entity_id,
            role = info.role.as_label(),
            x = info.position.x,
            y = info.position.y,
            "placed node"
        );
        channel.attach(info.entity_id, info.position);
    }
    entities.register(Box::new(channel));
    entities.register(Box::new(NetworkServer::new(server_id, scenario.network_server.clone())));

    for node in nodes {
        context.set_source(node.entity_id());
        node.start(&mut context);
        entities.register(Box::new(node));
    }

    Ok(BuiltSimulation {
        entities,
        context,
        channel: channel_id,
        network_server: server_id,
        node_infos,
    })
}
