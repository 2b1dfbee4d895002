//! Static catalog of workcell devices.
//!
//! The registry is built once from configuration and never changes at runtime.
//! It answers two questions: does a device exist, and what is its idle state.

use crate::config::DeviceDefinition;
use crate::error::{HubResult, WorkcellError};
use crate::status::DeviceState;
use std::collections::HashMap;

/// Read-only lookup of device identities, in display order.
#[derive(Debug, Clone)]
pub struct DeviceRegistry {
    devices: Vec<DeviceDefinition>,
    index: HashMap<String, usize>,
}

impl DeviceRegistry {
    /// Build a registry from device definitions.
    ///
    /// Later duplicates are ignored; configuration validation rejects them
    /// before this point.
    pub fn new(definitions: &[DeviceDefinition]) -> Self {
        let mut devices = Vec::with_capacity(definitions.len());
        let mut index = HashMap::with_capacity(definitions.len());
        for definition in definitions {
            if index.contains_key(&definition.name) {
                continue;
            }
            index.insert(definition.name.clone(), devices.len());
            devices.push(definition.clone());
        }
        Self { devices, index }
    }

    /// Look up a device, failing with `UnknownDevice` when absent.
    pub fn get(&self, name: &str) -> HubResult<&DeviceDefinition> {
        self.index
            .get(name)
            .map(|&i| &self.devices[i])
            .ok_or_else(|| WorkcellError::UnknownDevice(name.to_string()))
    }

    /// Whether the device exists.
    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Default state a device starts in.
    pub fn initial_state(&self, name: &str) -> HubResult<DeviceState> {
        let definition = self.get(name)?;
        Ok(DeviceState::new(definition.initial_status.clone(), 0))
    }

    /// Device names in display order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.devices.iter().map(|d| d.name.as_str())
    }

    /// All definitions in display order.
    pub fn iter(&self) -> impl Iterator<Item = &DeviceDefinition> {
        self.devices.iter()
    }

    /// Number of registered devices.
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}
