//! Per-connection store of every known property, keyed by device and vector name.
use std::collections::BTreeMap;

use crate::{
    error::LookupError,
    property::{Member, Property, PropertyKind, Rule, SwitchVector, Vector},
    protocol::Message,
};

/// Standard property and member used to report whether a device is connected.
pub const CONNECTION_PROPERTY: &str = "CONNECTION";
pub const CONNECT_MEMBER: &str = "CONNECT";

/// Result of storing a vector in the registry.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Merged {
    /// The device had no properties before.
    pub device_added: bool,
    /// The vector was not known before.
    pub created: bool,
}

/// All properties known to one connection.
///
/// Storing a vector for an existing key updates the stored vector in place instead of
/// replacing it, so the same entry keeps being the one `find` returns.
#[derive(Clone, Debug, Default)]
pub struct Registry {
    devices: BTreeMap<String, BTreeMap<String, Property>>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry::default()
    }

    /// Stores a definition. An existing vector of the same kind takes over the new header
    /// and member list; switch vectors then get their rule re-established.
    pub fn define_or_merge(&mut self, property: Property) -> Merged {
        self.store(property, |existing, incoming| match (existing, incoming) {
            (Property::Switch(old), Property::Switch(new)) => {
                let previous = old.selected_index();
                define_into(old, new);
                old.enforce_rule(previous);
            }
            (Property::Number(old), Property::Number(new)) => define_into(old, new),
            (Property::Text(old), Property::Text(new)) => define_into(old, new),
            (Property::Blob(old), Property::Blob(new)) => define_into(old, new),
            (old, new) => replace(old, new),
        })
    }

    /// Stores a value update (`set*Vector` or `new*Vector`). Only the state and the values of
    /// the named members change; labels, limits and formats from the definition are kept.
    /// Unknown vectors are created from the update.
    pub fn update(&mut self, property: Property) -> Merged {
        self.store(property, |existing, incoming| match (existing, incoming) {
            (Property::Switch(old), Property::Switch(new)) => {
                let previous = old.selected_index();
                old.state = new.state;
                // A member switched on by the update replaces the current selection.
                let switched_on = new
                    .members
                    .iter()
                    .any(|s| s.value && old.member(&s.name).is_some());
                if switched_on && old.rule != Rule::AnyOfMany {
                    for member in &mut old.members {
                        member.value = false;
                    }
                }
                for switch in new.members {
                    if let Some(member) = old.member_mut(&switch.name) {
                        member.value = switch.value;
                    }
                }
                old.enforce_rule(previous);
            }
            (Property::Number(old), Property::Number(new)) => {
                old.state = new.state;
                for number in new.members {
                    if let Some(member) = old.member_mut(&number.name) {
                        member.value = number.value;
                    }
                }
            }
            (Property::Text(old), Property::Text(new)) => {
                old.state = new.state;
                for text in new.members {
                    if let Some(member) = old.member_mut(&text.name) {
                        member.value = text.value;
                    }
                }
            }
            (Property::Blob(old), Property::Blob(new)) => {
                old.state = new.state;
                for blob in new.members {
                    if let Some(member) = old.member_mut(&blob.name) {
                        member.format = blob.format;
                        member.size = blob.size;
                        member.value = blob.value;
                    }
                }
            }
            (old, new) => replace(old, new),
        })
    }

    fn store(
        &mut self,
        mut property: Property,
        merge: impl FnOnce(&mut Property, Property),
    ) -> Merged {
        let device_added = !self.devices.contains_key(property.device());
        let vectors = self
            .devices
            .entry(property.device().to_string())
            .or_default();
        match vectors.get_mut(property.name()) {
            Some(existing) => {
                merge(existing, property);
                Merged {
                    device_added,
                    created: false,
                }
            }
            None => {
                if let Property::Switch(switch) = &mut property {
                    switch.enforce_rule(None);
                }
                vectors.insert(property.name().to_string(), property);
                Merged {
                    device_added,
                    created: true,
                }
            }
        }
    }

    /// Looks a vector up. A miss is a normal outcome: properties arrive asynchronously.
    pub fn find(&self, device: &str, name: &str) -> Option<&Property> {
        self.devices.get(device)?.get(name)
    }

    pub fn find_mut(&mut self, device: &str, name: &str) -> Option<&mut Property> {
        self.devices.get_mut(device)?.get_mut(name)
    }

    /// Like [`Registry::find`] but reports a miss or a vector of another kind as an error.
    pub fn expect(
        &self,
        device: &str,
        name: &str,
        kind: PropertyKind,
    ) -> Result<&Property, LookupError> {
        let property = self.find(device, name).ok_or_else(|| LookupError::UnknownVector {
            device: device.to_string(),
            name: name.to_string(),
        })?;
        if property.kind() != kind {
            return Err(LookupError::WrongKind {
                name: name.to_string(),
                expected: kind,
                found: property.kind(),
            });
        }
        Ok(property)
    }

    /// Removes one vector, or every vector of `device` when `name` is `None`.
    /// Returns the removed vectors.
    pub fn remove(&mut self, device: &str, name: Option<&str>) -> Vec<Property> {
        match name {
            Some(name) => {
                let Some(vectors) = self.devices.get_mut(device) else {
                    return Vec::new();
                };
                let removed = vectors.remove(name).into_iter().collect();
                if vectors.is_empty() {
                    self.devices.remove(device);
                }
                removed
            }
            None => self
                .devices
                .remove(device)
                .map(|vectors| vectors.into_values().collect())
                .unwrap_or_default(),
        }
    }

    pub fn contains_device(&self, device: &str) -> bool {
        self.devices.contains_key(device)
    }

    pub fn devices(&self) -> impl Iterator<Item = &str> {
        self.devices.keys().map(String::as_str)
    }

    pub fn properties<'a>(&'a self, device: &str) -> impl Iterator<Item = &'a Property> + use<'a> {
        self.devices
            .get(device)
            .into_iter()
            .flat_map(|vectors| vectors.values())
    }

    pub fn len(&self) -> usize {
        self.devices.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn clear(&mut self) {
        self.devices.clear();
    }

    /// Distinct groups of a device in order of first appearance.
    pub fn groups(&self, device: &str) -> Vec<String> {
        let mut groups: Vec<String> = Vec::new();
        for property in self.properties(device) {
            if !groups.iter().any(|g| g == property.group()) {
                groups.push(property.group().to_string());
            }
        }
        groups
    }

    /// Whether the `CONNECT` switch of the device's `CONNECTION` vector is `On`.
    pub fn is_connected(&self, device: &str) -> bool {
        self.find(device, CONNECTION_PROPERTY)
            .and_then(Property::as_switch)
            .and_then(|v| v.member(CONNECT_MEMBER))
            .is_some_and(|s| s.value)
    }

    /// `def*Vector` messages for the stored vectors, optionally restricted to one device
    /// and one vector name.
    pub fn definitions(&self, device: Option<&str>, name: Option<&str>) -> Vec<Message> {
        self.devices
            .iter()
            .filter(|(d, _)| device.is_none_or(|wanted| wanted == d.as_str()))
            .flat_map(|(_, vectors)| vectors.values())
            .filter(|p| name.is_none_or(|wanted| wanted == p.name()))
            .cloned()
            .map(Message::Define)
            .collect()
    }
}

fn replace(existing: &mut Property, mut incoming: Property) {
    if let Property::Switch(switch) = &mut incoming {
        switch.enforce_rule(None);
    }
    *existing = incoming;
}

fn define_into<M: Member>(existing: &mut Vector<M>, incoming: Vector<M>) {
    existing.label = incoming.label;
    existing.group = incoming.group;
    existing.permission = incoming.permission;
    existing.rule = incoming.rule;
    existing.state = incoming.state;
    existing.members = incoming.members;
}

impl SwitchVector {
    /// Values a command would send when `member` is set to `value`: siblings of a
    /// `OneOfMany` member take the complement, other siblings keep their value.
    pub fn values_with(&self, member: &str, value: bool) -> Result<Vec<bool>, LookupError> {
        if self.member(member).is_none() {
            return Err(LookupError::UnknownMember {
                vector: self.name.clone(),
                member: member.to_string(),
            });
        }
        Ok(self
            .members
            .iter()
            .map(|s| {
                if s.name == member {
                    value
                } else if self.rule == Rule::OneOfMany {
                    !value
                } else {
                    s.value
                }
            })
            .collect())
    }
}
