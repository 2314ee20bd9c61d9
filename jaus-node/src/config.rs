//! Node settings: the flat option set a node manager starts from, loaded
//! from a JSON file next to the daemon or built in code.

use crate::error::NodeError;
use crate::CONFLICT_WINDOW_MS;
use jaus_transport::serial::SerialSettings;
use jaus_transport::shm::NODE_INBOX_SIZE;
use jaus_transport::udp::{validate_multicast_group, DEFAULT_MULTICAST_TTL};
use jaus_wire::messages::Identification;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::net::Ipv4Addr;
use std::path::Path;
use std::{fs, io};

/// Inter-node link flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportFlavor {
    #[default]
    Udp,
    Tcp,
}

/// Serial line parameters for a static peer, mirroring
/// [`SerialSettings`] in serializable form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialParams {
    pub port: String,
    #[serde(default = "default_baud")]
    pub baud: u32,
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    #[serde(default)]
    pub parity: u8,
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
}

fn default_baud() -> u32 {
    9600
}
fn default_data_bits() -> u8 {
    8
}
fn default_stop_bits() -> u8 {
    1
}

impl From<&SerialParams> for SerialSettings {
    fn from(params: &SerialParams) -> Self {
        SerialSettings {
            port: params.port.clone(),
            baud: params.baud,
            data_bits: params.data_bits,
            parity: params.parity,
            stop_bits: params.stop_bits,
        }
    }
}

/// A static, non-evictable peer connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StaticNodeConnection {
    pub subsystem: u8,
    pub node: u8,
    /// `host[:port]` for UDP/TCP peers.
    #[serde(default)]
    pub host: Option<String>,
    /// Serial line for fixed-wire peers; wins over `host` when both are
    /// set.
    #[serde(default)]
    pub serial: Option<SerialParams>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentificationSettings {
    #[serde(default)]
    pub authority: u8,
    #[serde(default)]
    pub type_code: u16,
    pub name: String,
}

impl From<&IdentificationSettings> for Identification {
    fn from(settings: &IdentificationSettings) -> Self {
        Identification {
            authority: settings.authority,
            type_code: settings.type_code,
            name: settings.name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSettings {
    pub subsystem_id: u8,
    pub node_id: u8,
    #[serde(default)]
    pub transport: TransportFlavor,
    /// Node inbox size in bytes.
    #[serde(default = "default_mbsize")]
    pub mbsize: usize,
    #[serde(default = "default_multicast")]
    pub multicast: String,
    #[serde(default = "default_ttl")]
    pub ttl: u32,
    /// NIC address to bind, when the host has several.
    #[serde(default)]
    pub net_interface: Option<String>,
    /// Emit 255.255.1.1 heartbeats and track the subsystem list.
    #[serde(default)]
    pub subsystem_discovery: bool,
    #[serde(default)]
    pub node_connections: Vec<StaticNodeConnection>,
    #[serde(default)]
    pub subsystem_identification: Option<IdentificationSettings>,
    /// Open a traffic log at startup.
    #[serde(default)]
    pub logdata: bool,
    /// How long initialization listens for an address conflict.
    #[serde(default = "default_conflict_window")]
    pub conflict_window_ms: u64,
}

fn default_mbsize() -> usize {
    NODE_INBOX_SIZE
}
fn default_multicast() -> String {
    "224.1.0.1".to_string()
}
fn default_ttl() -> u32 {
    DEFAULT_MULTICAST_TTL
}
fn default_conflict_window() -> u64 {
    CONFLICT_WINDOW_MS
}

impl NodeSettings {
    pub fn new(subsystem_id: u8, node_id: u8) -> Self {
        Self {
            subsystem_id,
            node_id,
            transport: TransportFlavor::default(),
            mbsize: default_mbsize(),
            multicast: default_multicast(),
            ttl: default_ttl(),
            net_interface: None,
            subsystem_discovery: false,
            node_connections: Vec::new(),
            subsystem_identification: None,
            logdata: false,
            conflict_window_ms: default_conflict_window(),
        }
    }

    pub fn validate(&self) -> Result<(), NodeError> {
        if self.subsystem_id == 0 || self.subsystem_id == 255 {
            return Err(NodeError::InvalidValue("subsystem_id must be 1..=254"));
        }
        if self.node_id == 0 || self.node_id == 255 {
            return Err(NodeError::InvalidValue("node_id must be 1..=254"));
        }
        if self.mbsize < 2 * jaus_wire::MAX_PACKET_SIZE {
            return Err(NodeError::InvalidValue("mbsize smaller than two packets"));
        }
        validate_multicast_group(self.multicast_group()?)?;
        Ok(())
    }

    pub fn multicast_group(&self) -> Result<Ipv4Addr, NodeError> {
        self.multicast
            .parse()
            .map_err(|_| NodeError::InvalidValue("unparseable multicast group"))
    }

    pub fn load(path: &Path) -> Result<Self, NodeError> {
        let data = fs::read_to_string(path)?;
        let settings: NodeSettings = serde_json::from_str(&data)
            .map_err(|_| NodeError::InvalidValue("malformed settings file"))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn save(&self, path: &Path) -> io::Result<()> {
        let data = serde_json::to_string_pretty(self).expect("settings always serialize");
        let mut file = fs::File::create(path)?;
        file.write_all(data.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate_and_round_trip() {
        let settings = NodeSettings::new(1, 1);
        settings.validate().unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.json");
        settings.save(&path).unwrap();
        assert_eq!(NodeSettings::load(&path).unwrap(), settings);
    }

    #[test]
    fn bad_values_are_rejected() {
        assert!(NodeSettings::new(0, 1).validate().is_err());
        assert!(NodeSettings::new(1, 255).validate().is_err());

        let mut settings = NodeSettings::new(1, 1);
        settings.multicast = "192.168.1.1".into();
        assert!(settings.validate().is_err());
        settings.multicast = "not-an-address".into();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn sparse_settings_files_fill_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sparse.json");
        fs::write(&path, r#"{"subsystem_id": 3, "node_id": 7}"#).unwrap();

        let settings = NodeSettings::load(&path).unwrap();
        assert_eq!(settings.subsystem_id, 3);
        assert_eq!(settings.node_id, 7);
        assert_eq!(settings.transport, TransportFlavor::Udp);
        assert_eq!(settings.multicast, "224.1.0.1");
        assert!(!settings.subsystem_discovery);
    }
}
