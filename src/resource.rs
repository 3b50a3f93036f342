use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{EngineError, Result};

pub const RESOURCE_FILE_SUFFIX: &str = ".tf.json";
pub const INSTANCE_PREFIX: &str = "instance-";
pub const DEDICATED_SUFFIX: &str = "-dedicated";
pub const SHARED_SCOPE_PREFIX: &str = "scope-";

pub const PROP_SCOPE: &str = "@scope";
pub const PROP_HOSTNAME_PREFIX: &str = "@hostname_prefix";

pub const TAG_ATTACH: &str = "infrakit.attach";
pub const TAG_LOGICAL_ID: &str = "LogicalID";
pub const TAG_NAME: &str = "Name";

pub type ResourceType = String;
pub type ResourceName = String;
pub type ResourceProperties = Map<String, Value>;

/// One `*.tf.json` file: `{"resource": {type: {name: properties}}}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceDocument {
    #[serde(default)]
    pub resource: BTreeMap<ResourceType, BTreeMap<ResourceName, ResourceProperties>>,
}

impl ResourceDocument {
    pub fn from_value(value: Value) -> Result<Self> {
        serde_json::from_value(value).map_err(|e| EngineError::InvalidSpec(e.to_string()))
    }

    pub fn insert(
        &mut self,
        resource_type: impl Into<ResourceType>,
        name: impl Into<ResourceName>,
        properties: ResourceProperties,
    ) {
        self.resource
            .entry(resource_type.into())
            .or_default()
            .insert(name.into(), properties);
    }

    pub fn get(&self, resource_type: &str, name: &str) -> Option<&ResourceProperties> {
        self.resource.get(resource_type)?.get(name)
    }

    pub fn get_mut(&mut self, resource_type: &str, name: &str) -> Option<&mut ResourceProperties> {
        self.resource.get_mut(resource_type)?.get_mut(name)
    }

    pub fn is_empty(&self) -> bool {
        self.resource.values().all(BTreeMap::is_empty)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Attachment {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(default, rename = "Type")]
    pub attachment_type: String,
}

/// Caller-supplied description of an instance to provision.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct InstanceSpec {
    #[serde(default)]
    pub properties: Value,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub init: String,
    #[serde(default, rename = "LogicalID", skip_serializing_if = "Option::is_none")]
    pub logical_id: Option<String>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

/// Terraform resource name of the VM and base name of its file.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(String);

impl InstanceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn from_timestamp(unix_secs: u64) -> Self {
        Self(format!("{INSTANCE_PREFIX}{unix_secs}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn file_name(&self) -> String {
        resource_file_name(&self.0)
    }

    pub fn dedicated_stem(&self) -> String {
        format!("{}{DEDICATED_SUFFIX}", self.0)
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for InstanceId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

pub fn resource_file_name(stem: &str) -> String {
    format!("{stem}{RESOURCE_FILE_SUFFIX}")
}

/// Which file a resource is persisted into.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ScopeValue {
    Default,
    Dedicated,
    Shared(String),
}

impl ScopeValue {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "" | "@default" => ScopeValue::Default,
            "@dedicated" => ScopeValue::Dedicated,
            label => ScopeValue::Shared(label.to_string()),
        }
    }

    /// Destination file stem (without `.tf.json`).
    pub fn file_stem(&self, id: &InstanceId) -> String {
        match self {
            ScopeValue::Default => id.to_string(),
            ScopeValue::Dedicated => id.dedicated_stem(),
            ScopeValue::Shared(label) => format!("{SHARED_SCOPE_PREFIX}{label}"),
        }
    }

    /// Terraform name of a non-VM resource routed by this scope.
    pub fn resource_name(&self, id: &InstanceId, name: &str) -> String {
        match self {
            ScopeValue::Default | ScopeValue::Dedicated => format!("{id}-{name}"),
            ScopeValue::Shared(label) => format!("{label}-{name}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct InstanceDescription {
    #[serde(rename = "ID")]
    pub id: InstanceId,
    pub tags: BTreeMap<String, String>,
    #[serde(rename = "LogicalID", skip_serializing_if = "Option::is_none")]
    pub logical_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub properties: Option<Value>,
}
