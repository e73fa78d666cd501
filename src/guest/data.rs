// Guest data records and their persisted form

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::output::errors::TestbedError;

/// Key holding the class tag in a persisted guest record
pub const CLASS_KEY: &str = "__class__";

fn default_user() -> String {
    "root".to_string()
}

/// Data of a local guest
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuestData {
    pub role: Option<String>,
    pub guest: Option<String>,
}

/// Data of a guest reachable over SSH
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct GuestSshData {
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub guest: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default = "default_user")]
    pub user: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub key: Vec<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ssh_option: Vec<String>,
}

impl Default for GuestSshData {
    fn default() -> Self {
        GuestSshData {
            role: None,
            guest: None,
            port: None,
            user: default_user(),
            key: Vec::new(),
            password: None,
            ssh_option: Vec::new(),
        }
    }
}

/// Tag naming the guest implementation a record belongs to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestClass {
    pub module: String,
    pub name: String,
}

const LOCAL_CLASS: (&str, &str) = ("testbed.guest.local", "GuestLocal");
const SSH_CLASS: (&str, &str) = ("testbed.guest.ssh", "GuestSsh");

/// Saved state of a guest, one variant per guest implementation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuestRecord {
    Local(GuestData),
    Ssh(GuestSshData),
}

impl GuestRecord {
    pub fn class(&self) -> GuestClass {
        let (module, name) = match self {
            GuestRecord::Local(_) => LOCAL_CLASS,
            GuestRecord::Ssh(_) => SSH_CLASS,
        };
        GuestClass {
            module: module.to_string(),
            name: name.to_string(),
        }
    }

    pub fn role(&self) -> Option<&str> {
        match self {
            GuestRecord::Local(data) => data.role.as_deref(),
            GuestRecord::Ssh(data) => data.role.as_deref(),
        }
    }

    pub fn address(&self) -> Option<&str> {
        match self {
            GuestRecord::Local(data) => data.guest.as_deref(),
            GuestRecord::Ssh(data) => data.guest.as_deref(),
        }
    }

    /// Serialize into a mapping tagged with the guest class
    pub fn to_value(&self) -> Result<serde_yaml::Value, TestbedError> {
        let data = match self {
            GuestRecord::Local(data) => serde_yaml::to_value(data),
            GuestRecord::Ssh(data) => serde_yaml::to_value(data),
        }
        .map_err(|e| TestbedError::general(format!("Failed to serialize guest data: {}", e)))?;

        let mut mapping = match data {
            serde_yaml::Value::Mapping(mapping) => mapping,
            _ => serde_yaml::Mapping::new(),
        };
        let class = serde_yaml::to_value(self.class())
            .map_err(|e| TestbedError::general(format!("Failed to serialize guest data: {}", e)))?;
        mapping.insert(serde_yaml::Value::String(CLASS_KEY.to_string()), class);

        Ok(serde_yaml::Value::Mapping(mapping))
    }

    /// Decode a tagged mapping, rejecting unknown classes
    pub fn from_value(value: serde_yaml::Value) -> Result<GuestRecord, TestbedError> {
        let failed = |reason: String| {
            TestbedError::general(format!("Failed to load saved state of guest: {}", reason))
        };

        let mut mapping = match value {
            serde_yaml::Value::Mapping(mapping) => mapping,
            other => return Err(failed(format!("expected a mapping, got {:?}", other))),
        };

        let class = mapping
            .remove(CLASS_KEY)
            .ok_or_else(|| failed(format!("missing '{}' key", CLASS_KEY)))?;
        let class: GuestClass = serde_yaml::from_value(class)
            .map_err(|e| failed(format!("invalid class tag: {}", e)))?;

        let data = serde_yaml::Value::Mapping(mapping);
        match (class.module.as_str(), class.name.as_str()) {
            LOCAL_CLASS => serde_yaml::from_value(data)
                .map(GuestRecord::Local)
                .map_err(|e| failed(e.to_string())),
            SSH_CLASS => serde_yaml::from_value(data)
                .map(GuestRecord::Ssh)
                .map_err(|e| failed(e.to_string())),
            _ => Err(failed(format!(
                "unknown guest class '{}.{}'",
                class.module, class.name
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_ssh_record_round_trip() {
        let record = GuestRecord::Ssh(GuestSshData {
            role: Some("server".into()),
            guest: Some("10.0.0.5".into()),
            port: Some(2222),
            user: "fedora".into(),
            key: vec![PathBuf::from("/home/me/.ssh/id_ed25519")],
            password: None,
            ssh_option: vec!["ConnectTimeout=10".into()],
        });

        let value = record.to_value().unwrap();
        let yaml = serde_yaml::to_string(&value).unwrap();
        assert!(yaml.contains("module: testbed.guest.ssh"));
        assert!(yaml.contains("ssh-option"));

        let loaded = GuestRecord::from_value(serde_yaml::from_str(&yaml).unwrap()).unwrap();
        assert_eq!(loaded, record);
        assert_eq!(loaded.role(), Some("server"));
        assert_eq!(loaded.address(), Some("10.0.0.5"));
    }

    #[test]
    fn test_local_record_round_trip() {
        let record = GuestRecord::Local(GuestData {
            role: None,
            guest: Some("localhost".into()),
        });

        let loaded = GuestRecord::from_value(record.to_value().unwrap()).unwrap();
        assert_eq!(loaded, record);
    }

    #[test]
    fn test_unknown_class_rejected() {
        let value: serde_yaml::Value = serde_yaml::from_str(
            "guest: box\n__class__:\n  module: testbed.guest.virtual\n  name: GuestVirtual\n",
        )
        .unwrap();

        let err = GuestRecord::from_value(value).unwrap_err();
        assert!(err.message().contains("unknown guest class 'testbed.guest.virtual.GuestVirtual'"));

        let untagged: serde_yaml::Value = serde_yaml::from_str("guest: box\n").unwrap();
        assert!(GuestRecord::from_value(untagged).is_err());
    }
}
