//! Heartbeat table
//!
//! Each client periodically replaces its resource snapshot. Resources are
//! held as a name -> (available, total) map; on the wire they keep the
//! parallel label/capacity sequences other components read.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{Table, TableEntry, TableKind};
use crate::error::{GcsError, Result};
use crate::id::ClientId;

/// Capacity of one resource on one client
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceCapacity {
    pub available: f64,
    pub total: f64,
}

/// Resource snapshot published by one client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "HeartbeatWire", try_from = "HeartbeatWire")]
pub struct HeartbeatTableData {
    pub client_id: ClientId,
    pub resources: BTreeMap<String, ResourceCapacity>,
}

impl HeartbeatTableData {
    pub fn new(client_id: ClientId) -> Self {
        Self {
            client_id,
            resources: BTreeMap::new(),
        }
    }

    /// Builder-style insert of one resource
    pub fn with_resource(mut self, label: impl Into<String>, available: f64, total: f64) -> Self {
        self.set_resource(label, available, total);
        self
    }

    pub fn set_resource(&mut self, label: impl Into<String>, available: f64, total: f64) {
        self.resources
            .insert(label.into(), ResourceCapacity { available, total });
    }

    pub fn resource(&self, label: &str) -> Option<ResourceCapacity> {
        self.resources.get(label).copied()
    }

    /// Wire form with positionally aligned label/capacity sequences
    pub fn to_wire(&self) -> HeartbeatWire {
        HeartbeatWire::from(self.clone())
    }

    /// Rebuild from the wire form, rejecting misaligned sequences
    pub fn from_wire(wire: HeartbeatWire) -> Result<Self> {
        Self::try_from(wire)
    }
}

impl TableEntry for HeartbeatTableData {
    type Id = ClientId;
    const KIND: TableKind = TableKind::Heartbeat;

    /// A heartbeat is keyed by the client it describes
    fn validate_for(&self, id: &ClientId) -> Result<()> {
        self.validate()?;
        if self.client_id != *id {
            return Err(GcsError::InvalidArgument {
                reason: format!("heartbeat for {} cannot be stored under {}", self.client_id, id),
            });
        }
        Ok(())
    }
}

/// Serialized heartbeat: `label[i]` describes `capacity[i]`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatWire {
    pub client_id: ClientId,
    pub resources_available_label: Vec<String>,
    pub resources_available_capacity: Vec<f64>,
    pub resources_total_label: Vec<String>,
    pub resources_total_capacity: Vec<f64>,
}

impl From<HeartbeatTableData> for HeartbeatWire {
    fn from(data: HeartbeatTableData) -> Self {
        let mut wire = HeartbeatWire {
            client_id: data.client_id,
            ..Default::default()
        };
        // BTreeMap iteration keeps both sequences in the same label order
        for (label, capacity) in data.resources {
            wire.resources_available_label.push(label.clone());
            wire.resources_available_capacity.push(capacity.available);
            wire.resources_total_label.push(label);
            wire.resources_total_capacity.push(capacity.total);
        }
        wire
    }
}

impl TryFrom<HeartbeatWire> for HeartbeatTableData {
    type Error = GcsError;

    fn try_from(wire: HeartbeatWire) -> Result<Self> {
        check_aligned(&wire.resources_available_label, &wire.resources_available_capacity)?;
        check_aligned(&wire.resources_total_label, &wire.resources_total_capacity)?;

        // A resource listed on only one side reads as zero on the other
        let mut data = HeartbeatTableData::new(wire.client_id);
        for (label, total) in wire
            .resources_total_label
            .into_iter()
            .zip(wire.resources_total_capacity)
        {
            data.resources.entry(label).or_default().total = total;
        }
        for (label, available) in wire
            .resources_available_label
            .into_iter()
            .zip(wire.resources_available_capacity)
        {
            data.resources.entry(label).or_default().available = available;
        }
        Ok(data)
    }
}

fn check_aligned(labels: &[String], capacities: &[f64]) -> Result<()> {
    if labels.len() != capacities.len() {
        return Err(GcsError::MisalignedResources {
            labels: labels.len(),
            capacities: capacities.len(),
        });
    }
    Ok(())
}

pub type HeartbeatTable = Table<HeartbeatTableData>;

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> HeartbeatTableData {
        HeartbeatTableData::new(ClientId::from_random())
            .with_resource("GPU", 0.0, 2.0)
            .with_resource("CPU", 1.0, 2.0)
    }

    #[test]
    fn test_keyed_by_own_client() {
        let data = sample();
        assert!(data.validate_for(&data.client_id).is_ok());
        let err = data.validate_for(&ClientId::from_random()).unwrap_err();
        assert!(matches!(err, GcsError::InvalidArgument { .. }));
    }

    #[test]
    fn test_wire_alignment() {
        let wire = sample().to_wire();
        assert_eq!(wire.resources_available_label, vec!["CPU", "GPU"]);
        assert_eq!(wire.resources_total_label, vec!["CPU", "GPU"]);
        assert_eq!(wire.resources_available_capacity, vec![1.0, 0.0]);
        assert_eq!(wire.resources_total_capacity, vec![2.0, 2.0]);
    }

    #[test]
    fn test_misaligned_wire_rejected() {
        let mut wire = sample().to_wire();
        wire.resources_available_capacity.pop();
        let err = HeartbeatTableData::from_wire(wire).unwrap_err();
        assert!(matches!(err, GcsError::MisalignedResources { labels: 2, capacities: 1 }));
        assert!(err.is_invariant_violation());
    }

    #[test]
    fn test_json_uses_wire_shape() {
        let data = sample();
        let json = serde_json::to_value(&data).unwrap();
        assert_eq!(json["resources_total_label"], serde_json::json!(["CPU", "GPU"]));

        let back: HeartbeatTableData = serde_json::from_value(json).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn test_one_sided_resource() {
        let wire = HeartbeatWire {
            client_id: ClientId::nil(),
            resources_available_label: vec![],
            resources_available_capacity: vec![],
            resources_total_label: vec!["CPU".into()],
            resources_total_capacity: vec![4.0],
        };
        let data = HeartbeatTableData::from_wire(wire).unwrap();
        assert_eq!(
            data.resource("CPU"),
            Some(ResourceCapacity { available: 0.0, total: 4.0 })
        );
    }
}
