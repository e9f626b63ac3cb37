//! Custom resource types in scope for a pipeline

use super::hash::{Source, Version};
use serde::{Deserialize, Serialize};

/// A resource type defined by a pipeline rather than provided by a worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceType {
    /// Name other resources refer to
    pub name: String,

    /// Underlying type this one is fetched with
    #[serde(rename = "type")]
    pub type_: String,

    /// Source for fetching the type's image
    #[serde(default)]
    pub source: Source,

    /// Version of the image, once it has been checked
    #[serde(default)]
    pub version: Option<Version>,
}

/// The set of custom types visible to a resource
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceTypes(Vec<ResourceType>);

impl ResourceTypes {
    pub fn new(types: Vec<ResourceType>) -> Self {
        Self(types)
    }

    /// Find a custom type by name
    pub fn lookup(&self, name: &str) -> Option<&ResourceType> {
        self.0.iter().find(|t| t.name == name)
    }

    /// The same scope with `name` removed
    ///
    /// A type is always resolved against a scope without itself, so a custom
    /// type named like a base type refers to that base type.
    pub fn without(&self, name: &str) -> Self {
        Self(self.0.iter().filter(|t| t.name != name).cloned().collect())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<ResourceType>> for ResourceTypes {
    fn from(types: Vec<ResourceType>) -> Self {
        Self(types)
    }
}
