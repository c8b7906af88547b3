//! Unit definitions.
//!
//! A [`UnitDefinition`] is the immutable template an instance is created
//! from. It is deserialized from the desired-state record with serde; only
//! the fields the native plugin acts on are modelled, unknown fields are
//! ignored.
//!
//! Two record shapes are accepted. The flat one carries `intf_type` on the
//! interface and `image` as a string. Controller records nest the type as
//! `virtual_interface.intf_type` and give `image` as an object with a `uri`.
//! Serialization always writes the flat shape.

use serde::{Deserialize, Deserializer, Serialize};

use crate::constants::MAX_IFNAME_LEN;
use crate::error::{Error, Result};

/// Immutable template of a deployable native unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitDefinition {
    /// Definition identifier shared by every instance of this unit.
    #[serde(alias = "fdu_uuid")]
    pub fdu_id: String,
    /// Human-readable name; also the instance directory name.
    pub name: String,
    /// Program to execute.
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Location of a packaged artifact (http(s), `file://` or absolute path).
    #[serde(default, deserialize_with = "image_uri")]
    pub image: Option<String>,
    #[serde(default)]
    pub interfaces: Vec<InterfaceSpec>,
    #[serde(default)]
    pub connection_points: Vec<ConnectionPointSpec>,
}

/// Declared interface attachment kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InterfaceKind {
    #[serde(alias = "physical")]
    Physical,
    #[serde(alias = "bridged")]
    Bridged,
    #[serde(alias = "virtual")]
    Virtual,
}

/// A network interface declared by a unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "InterfaceRecord")]
pub struct InterfaceSpec {
    /// Name of the interface inside the namespace.
    pub vintf_name: String,
    #[serde(rename = "intf_type")]
    pub kind: InterfaceKind,
    /// Node face to ride on (physical/bridged only).
    #[serde(default)]
    pub phy_face: Option<String>,
    /// Fixed MAC; generated when absent.
    #[serde(default)]
    pub mac_address: Option<String>,
    /// Connection point to attach to (virtual only).
    #[serde(default)]
    pub cp_id: Option<String>,
    /// Static CIDR address; DHCP when absent.
    #[serde(default)]
    pub address: Option<String>,
}

/// `image` as a bare reference or as `{"uri": ...}`.
fn image_uri<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Option<String>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Image {
        Uri(String),
        Object { uri: String },
    }

    Ok(Option::<Image>::deserialize(deserializer)?.map(|image| match image {
        Image::Uri(uri) | Image::Object { uri } => uri,
    }))
}

/// Interface as found in either record shape.
#[derive(Deserialize)]
struct InterfaceRecord {
    vintf_name: String,
    #[serde(default)]
    intf_type: Option<InterfaceKind>,
    #[serde(default)]
    virtual_interface: Option<VirtualInterface>,
    #[serde(default)]
    phy_face: Option<String>,
    #[serde(default)]
    mac_address: Option<String>,
    #[serde(default)]
    cp_id: Option<String>,
    #[serde(default)]
    address: Option<String>,
}

#[derive(Deserialize)]
struct VirtualInterface {
    intf_type: InterfaceKind,
}

impl TryFrom<InterfaceRecord> for InterfaceSpec {
    type Error = String;

    fn try_from(r: InterfaceRecord) -> std::result::Result<Self, Self::Error> {
        let kind = r
            .intf_type
            .or(r.virtual_interface.map(|v| v.intf_type))
            .ok_or_else(|| format!("interface '{}' has no intf_type", r.vintf_name))?;
        Ok(Self {
            vintf_name: r.vintf_name,
            kind,
            phy_face: r.phy_face,
            mac_address: r.mac_address,
            cp_id: r.cp_id,
            address: r.address,
        })
    }
}

/// A logical endpoint declared by a unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionPointSpec {
    pub cp_id: String,
    /// Virtual network to connect the endpoint to.
    #[serde(default)]
    pub vld_ref: Option<String>,
}

impl UnitDefinition {
    /// Checks the fields the orchestrator turns into paths and commands.
    pub fn validate(&self) -> Result<()> {
        if self.fdu_id.is_empty() || !is_path_component(&self.fdu_id) {
            return Err(Error::InvalidInput(format!(
                "invalid definition id '{}'",
                self.fdu_id
            )));
        }
        if self.name.is_empty() || !is_path_component(&self.name) {
            return Err(Error::InvalidInput(format!("invalid unit name '{}'", self.name)));
        }
        if self.command.trim().is_empty() {
            return Err(Error::InvalidInput("command must not be empty".to_string()));
        }
        for intf in &self.interfaces {
            if intf.vintf_name.is_empty() || intf.vintf_name.len() > MAX_IFNAME_LEN {
                return Err(Error::InvalidInput(format!(
                    "interface name '{}' must be 1..={} bytes",
                    intf.vintf_name, MAX_IFNAME_LEN
                )));
            }
        }
        Ok(())
    }

    /// File name of the packaged artifact (last segment of the reference).
    pub fn artifact_name(&self) -> Option<&str> {
        self.image
            .as_deref()
            .and_then(|uri| uri.rsplit('/').next())
            .filter(|name| !name.is_empty())
    }
}

fn is_path_component(s: &str) -> bool {
    s != "." && s != ".." && !s.contains('/') && !s.contains('\\') && !s.contains('\0')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> UnitDefinition {
        UnitDefinition {
            fdu_id: "def-1".to_string(),
            name: "web".to_string(),
            command: "sleep".to_string(),
            args: vec!["100".to_string()],
            image: Some("http://repo/pkg/web.tar.gz".to_string()),
            interfaces: vec![],
            connection_points: vec![],
        }
    }

    #[test]
    fn test_artifact_name() {
        assert_eq!(sample().artifact_name(), Some("web.tar.gz"));

        let mut unit = sample();
        unit.image = None;
        assert_eq!(unit.artifact_name(), None);
    }

    #[test]
    fn test_validate_rejects_path_like_names() {
        let mut unit = sample();
        unit.name = "../escape".to_string();
        assert!(unit.validate().is_err());

        let mut unit = sample();
        unit.fdu_id = "..".to_string();
        assert!(unit.validate().is_err());
    }

    #[test]
    fn test_validate_interface_name_length() {
        let mut unit = sample();
        unit.interfaces.push(InterfaceSpec {
            vintf_name: "a-very-long-interface".to_string(),
            kind: InterfaceKind::Virtual,
            phy_face: None,
            mac_address: None,
            cp_id: None,
            address: None,
        });
        assert!(unit.validate().is_err());
    }

    #[test]
    fn test_deserialize_descriptor() {
        let json = r#"{
            "fdu_uuid": "d1",
            "name": "pinger",
            "command": "ping",
            "args": ["-c", "1"],
            "interfaces": [
                {"vintf_name": "eth0", "intf_type": "BRIDGED", "phy_face": "br0"}
            ],
            "connection_points": [{"cp_id": "cp0", "vld_ref": "net0"}]
        }"#;
        let unit: UnitDefinition = serde_json::from_str(json).unwrap();
        assert_eq!(unit.fdu_id, "d1");
        assert_eq!(unit.interfaces[0].kind, InterfaceKind::Bridged);
        assert_eq!(unit.connection_points[0].vld_ref.as_deref(), Some("net0"));
        assert!(unit.image.is_none());
    }

    #[test]
    fn test_deserialize_controller_record() {
        let json = r#"{
            "fdu_id": "d1",
            "name": "web",
            "command": "./server",
            "image": {"uri": "http://repo/pkg/web.tar.gz", "checksum": "abc"},
            "interfaces": [
                {"vintf_name": "eth0", "virtual_interface": {"intf_type": "physical"}, "phy_face": "eno1"},
                {"vintf_name": "net1", "virtual_interface": {"intf_type": "VIRTUAL"}, "cp_id": "cp0"}
            ]
        }"#;
        let unit: UnitDefinition = serde_json::from_str(json).unwrap();
        assert_eq!(unit.image.as_deref(), Some("http://repo/pkg/web.tar.gz"));
        assert_eq!(unit.artifact_name(), Some("web.tar.gz"));
        assert_eq!(unit.interfaces[0].kind, InterfaceKind::Physical);
        assert_eq!(unit.interfaces[1].kind, InterfaceKind::Virtual);
        assert_eq!(unit.interfaces[1].cp_id.as_deref(), Some("cp0"));

        // Written back in the flat shape, which reads again unchanged.
        let flat = serde_json::to_value(&unit).unwrap();
        assert_eq!(flat["interfaces"][0]["intf_type"], "PHYSICAL");
        assert_eq!(flat["image"], "http://repo/pkg/web.tar.gz");
        let again: UnitDefinition = serde_json::from_value(flat).unwrap();
        assert_eq!(again, unit);
    }

    #[test]
    fn test_interface_without_type_rejected() {
        let json = r#"{"fdu_id": "d1", "name": "web", "command": "true",
                       "interfaces": [{"vintf_name": "eth0"}]}"#;
        let err = serde_json::from_str::<UnitDefinition>(json).unwrap_err();
        assert!(err.to_string().contains("intf_type"), "{err}");
    }
}
