//! ---
//! ems_section: "02-tag-layer"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Static mapping from logical tag names to controller addresses."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::HashMap;

use indexmap::IndexMap;
use plclink_common::{StringLayout, TagConfig, TagKind};
use serde::Serialize;

use crate::error::{LinkError, Result};
use crate::value::WireType;

/// Immutable description of one logical tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TagDescriptor {
    pub name: String,
    pub address: String,
    pub kind: TagKind,
    /// Character elements backing a string tag; 1 for scalars.
    pub elements: usize,
    pub layout: StringLayout,
}

impl TagDescriptor {
    pub fn scalar(name: impl Into<String>, address: impl Into<String>, kind: TagKind) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            kind,
            elements: 1,
            layout: StringLayout::default(),
        }
    }

    pub fn string(
        name: impl Into<String>,
        address: impl Into<String>,
        elements: usize,
        layout: StringLayout,
    ) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            kind: TagKind::String,
            elements,
            layout,
        }
    }

    pub fn from_config(name: &str, config: &TagConfig) -> Self {
        match config.kind {
            TagKind::String => Self::string(
                name,
                config.address.clone(),
                config.element_count(),
                config.layout,
            ),
            kind => Self::scalar(name, config.address.clone(), kind),
        }
    }

    /// Wire type of each element operation for this tag.
    pub fn wire_type(&self) -> WireType {
        match self.kind {
            TagKind::Bool => WireType::Bool,
            TagKind::Integer => WireType::Dint,
            TagKind::Real => WireType::Real,
            TagKind::String => WireType::Sint,
        }
    }

    /// Address of character element `index` of a string tag.
    pub fn element_address(&self, index: usize) -> String {
        format!("{}[{}]", self.address, index)
    }
}

/// Name-indexed tag table. Built once and shared read-only afterwards.
#[derive(Debug, Clone, Default)]
pub struct TagRegistry {
    tags: IndexMap<String, TagDescriptor>,
}

impl TagRegistry {
    /// Build a registry, refusing duplicate names and addresses shared by
    /// tags of different kinds.
    pub fn new(descriptors: impl IntoIterator<Item = TagDescriptor>) -> Result<Self> {
        let mut tags: IndexMap<String, TagDescriptor> = IndexMap::new();
        let mut owners: HashMap<String, (String, TagKind)> = HashMap::new();
        for descriptor in descriptors {
            if tags.contains_key(&descriptor.name) {
                return Err(LinkError::DuplicateTag(descriptor.name));
            }
            if let Some((first, kind)) = owners.get(&descriptor.address) {
                if *kind != descriptor.kind {
                    return Err(LinkError::ConflictingAddress {
                        address: descriptor.address.clone(),
                        first: first.clone(),
                        second: descriptor.name.clone(),
                    });
                }
            } else {
                owners.insert(
                    descriptor.address.clone(),
                    (descriptor.name.clone(), descriptor.kind),
                );
            }
            tags.insert(descriptor.name.clone(), descriptor);
        }
        Ok(Self { tags })
    }

    pub fn from_config(table: &IndexMap<String, TagConfig>) -> Result<Self> {
        Self::new(
            table
                .iter()
                .map(|(name, config)| TagDescriptor::from_config(name, config)),
        )
    }

    pub fn resolve(&self, name: &str) -> Result<&TagDescriptor> {
        self.tags
            .get(name)
            .ok_or_else(|| LinkError::UnknownTag(name.to_owned()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tags.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TagDescriptor> {
        self.tags.values()
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }
}
