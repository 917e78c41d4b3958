//! The closed set of radio nodes.

use crate::{EndDevice, Gateway, Jammer};
use lorasim_common::{EnergyConsumption, Entity, EntityId, Event, NodeRole, SimContext, SimError};

/// A radio node of any role.
pub enum LoraNode {
    /// Class A end device.
    EndDevice(EndDevice),
    /// Gateway.
    Gateway(Gateway),
    /// Jammer.
    Jammer(Jammer),
}

impl LoraNode {
    /// Role of the node.
    pub fn role(&self) -> NodeRole {
        match self {
            LoraNode::EndDevice(_) => NodeRole::EndDevice,
            LoraNode::Gateway(_) => NodeRole::Gateway,
            LoraNode::Jammer(_) => NodeRole::Jammer,
        }
    }

    /// Schedule the node's own first events.
    pub fn start(&self, ctx: &mut SimContext) {
        match self {
            LoraNode::EndDevice(d) => d.start(ctx),
            LoraNode::Gateway(_) => {}
            LoraNode::Jammer(j) => j.start(ctx),
        }
    }

    /// The end device, if this is one.
    pub fn as_end_device(&self) -> Option<&EndDevice> {
        match self {
            LoraNode::EndDevice(d) => Some(d),
            _ => None,
        }
    }
}

impl From<EndDevice> for LoraNode {
    fn from(device: EndDevice) -> Self {
        LoraNode::EndDevice(device)
    }
}

impl From<Gateway> for LoraNode {
    fn from(gateway: Gateway) -> Self {
        LoraNode::Gateway(gateway)
    }
}

impl From<Jammer> for LoraNode {
    fn from(jammer: Jammer) -> Self {
        LoraNode::Jammer(jammer)
    }
}

impl Entity for LoraNode {
    fn entity_id(&self) -> EntityId {
        match self {
            LoraNode::EndDevice(d) => d.id(),
            LoraNode::Gateway(g) => g.id(),
            LoraNode::Jammer(j) => j.id(),
        }
    }

    fn handle_event(&mut self, event: &Event, ctx: &mut SimContext) -> Result<(), SimError> {
        match self {
            LoraNode::EndDevice(d) => d.handle_event(event, ctx),
            LoraNode::Gateway(g) => g.handle_event(event, ctx),
            LoraNode::Jammer(j) => j.handle_event(event, ctx),
        }
    }

    fn energy_consumption(&self) -> Option<EnergyConsumption> {
        self.as_end_device().map(|d| d.phy().energy().consumption())
    }
}
