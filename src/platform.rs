use serde_json::Value;

use crate::resource::{INSTANCE_PREFIX, PROP_HOSTNAME_PREFIX, ResourceProperties};

/// Sentinel accepted in `aws_instance.private_ip` to request the logical ID.
pub const LOGICAL_ID_SENTINEL: &str = "INFRAKIT_LOGICAL_ID";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagStyle {
    /// Tags are a JSON object.
    Map,
    /// Tags are a list of `key:value` strings.
    List { lowercase_keys: bool },
}

/// VM-class resource types the engine knows how to manage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VmType {
    Aws,
    Azure,
    Google,
    DigitalOcean,
    SoftLayer,
    IbmCloud,
}

impl VmType {
    pub const ALL: [VmType; 6] = [
        VmType::Aws,
        VmType::Azure,
        VmType::Google,
        VmType::DigitalOcean,
        VmType::SoftLayer,
        VmType::IbmCloud,
    ];

    pub fn parse(resource_type: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|vm| vm.as_str() == resource_type)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            VmType::Aws => "aws_instance",
            VmType::Azure => "azurerm_virtual_machine",
            VmType::Google => "google_compute_instance",
            VmType::DigitalOcean => "digitalocean_droplet",
            VmType::SoftLayer => "softlayer_virtual_guest",
            VmType::IbmCloud => "ibm_compute_vm_instance",
        }
    }

    pub fn tag_property(&self) -> &'static str {
        match self {
            VmType::Google => "metadata",
            _ => "tags",
        }
    }

    pub fn tag_style(&self) -> TagStyle {
        match self {
            VmType::Aws | VmType::Azure | VmType::Google => TagStyle::Map,
            VmType::DigitalOcean => TagStyle::List {
                lowercase_keys: false,
            },
            VmType::SoftLayer | VmType::IbmCloud => TagStyle::List {
                lowercase_keys: true,
            },
        }
    }

    /// Dotted path of the property that carries the boot script.
    pub fn user_data_property(&self) -> &'static str {
        match self {
            VmType::Aws | VmType::DigitalOcean => "user_data",
            VmType::Azure => "os_profile.custom_data",
            VmType::Google => "metadata_startup_script",
            VmType::SoftLayer | VmType::IbmCloud => "user_metadata",
        }
    }

    pub fn encodes_user_data(&self) -> bool {
        matches!(self, VmType::Aws | VmType::Azure)
    }

    /// Hostname and private IP adjustments applied just before the VM is written.
    pub fn apply_fixups(
        &self,
        id: &str,
        logical_id: Option<&str>,
        hostname_prefix: Option<&str>,
        properties: &mut ResourceProperties,
    ) {
        if let Some(prefix) = hostname_prefix {
            let suffix = match logical_id {
                Some(logical) => logical.to_string(),
                None => id.trim_start_matches(INSTANCE_PREFIX).to_string(),
            };
            let prefix = prefix.trim();
            let hostname = if prefix.is_empty() {
                suffix
            } else {
                format!("{prefix}-{suffix}")
            };
            properties.insert("hostname".to_string(), Value::String(hostname));
        }
        properties.remove(PROP_HOSTNAME_PREFIX);

        if *self == VmType::Aws
            && properties.get("private_ip").and_then(Value::as_str) == Some(LOGICAL_ID_SENTINEL)
        {
            match logical_id {
                Some(logical) => {
                    properties.insert(
                        "private_ip".to_string(),
                        Value::String(logical.to_string()),
                    );
                }
                None => {
                    properties.remove("private_ip");
                }
            }
        }
    }
}
