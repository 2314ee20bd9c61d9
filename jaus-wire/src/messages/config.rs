use crate::address::Address;
use crate::codec::{codes, MessageBody};
use crate::error::WireError;
use crate::stream::Stream;
use std::collections::{BTreeMap, BTreeSet};

/// Advertised identity of a subsystem (or of a node manager itself).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Identification {
    pub authority: u8,
    pub type_code: u16,
    pub name: String,
}

impl Identification {
    fn write(&self, stream: &mut Stream) {
        stream.write_u8(self.authority);
        stream.write_u16(self.type_code);
        let name = self.name.as_bytes();
        stream.write_u8(name.len().min(255) as u8);
        stream.write_bytes(&name[..name.len().min(255)]);
    }

    fn read(stream: &mut Stream) -> Result<Self, WireError> {
        let authority = stream.read_u8()?;
        let type_code = stream.read_u16()?;
        let len = stream.read_u8()? as usize;
        let bytes = stream.read_bytes(len)?;
        let name =
            String::from_utf8(bytes).map_err(|_| WireError::BadPacket("identification name"))?;
        Ok(Self { authority, type_code, name })
    }
}

/// Per-node component membership: the set of `(component, instance)` pairs
/// alive on that node.
pub type NodeComponents = BTreeSet<(u8, u8)>;

/// System configuration tree: subsystem -> node -> components, plus the
/// identification each subsystem advertises.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Configuration {
    pub subsystems: BTreeMap<u8, BTreeMap<u8, NodeComponents>>,
    pub identifications: BTreeMap<u8, Identification>,
}

impl Configuration {
    /// Record a component address, creating subsystem/node entries as
    /// needed.
    pub fn add_component(&mut self, id: Address) {
        self.subsystems
            .entry(id.subsystem)
            .or_default()
            .entry(id.node)
            .or_default()
            .insert((id.component, id.instance));
    }

    pub fn remove_component(&mut self, id: Address) {
        if let Some(nodes) = self.subsystems.get_mut(&id.subsystem) {
            if let Some(components) = nodes.get_mut(&id.node) {
                components.remove(&(id.component, id.instance));
                if components.is_empty() {
                    nodes.remove(&id.node);
                }
            }
            if nodes.is_empty() {
                self.subsystems.remove(&id.subsystem);
            }
        }
    }

    pub fn remove_node(&mut self, subsystem: u8, node: u8) {
        if let Some(nodes) = self.subsystems.get_mut(&subsystem) {
            nodes.remove(&node);
            if nodes.is_empty() {
                self.subsystems.remove(&subsystem);
            }
        }
    }

    /// The slice of this tree covering a single subsystem.
    pub fn subsystem_view(&self, subsystem: u8) -> Configuration {
        let mut view = Configuration::default();
        if let Some(nodes) = self.subsystems.get(&subsystem) {
            view.subsystems.insert(subsystem, nodes.clone());
        }
        if let Some(ident) = self.identifications.get(&subsystem) {
            view.identifications.insert(subsystem, ident.clone());
        }
        view
    }

    /// The slice covering a single node.
    pub fn node_view(&self, subsystem: u8, node: u8) -> Configuration {
        let mut view = Configuration::default();
        if let Some(components) = self.subsystems.get(&subsystem).and_then(|n| n.get(&node)) {
            view.subsystems.insert(subsystem, BTreeMap::from([(node, components.clone())]));
        }
        view
    }

    /// Merge `other` into this tree, replacing overlapping node entries.
    pub fn merge(&mut self, other: &Configuration) {
        for (subsystem, nodes) in &other.subsystems {
            let mine = self.subsystems.entry(*subsystem).or_default();
            for (node, components) in nodes {
                mine.insert(*node, components.clone());
            }
        }
        for (subsystem, ident) in &other.identifications {
            self.identifications.insert(*subsystem, ident.clone());
        }
    }

    pub fn components_on_node(&self, subsystem: u8, node: u8) -> Vec<Address> {
        self.subsystems
            .get(&subsystem)
            .and_then(|n| n.get(&node))
            .map(|components| {
                components
                    .iter()
                    .map(|(c, i)| Address::new(subsystem, node, *c, *i))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn write(&self, stream: &mut Stream) {
        stream.write_u8(self.subsystems.len() as u8);
        for (subsystem, nodes) in &self.subsystems {
            stream.write_u8(*subsystem);
            stream.write_u8(nodes.len() as u8);
            for (node, components) in nodes {
                stream.write_u8(*node);
                stream.write_u8(components.len() as u8);
                for (component, instance) in components {
                    stream.write_u8(*component);
                    stream.write_u8(*instance);
                }
            }
        }
        stream.write_u8(self.identifications.len() as u8);
        for (subsystem, ident) in &self.identifications {
            stream.write_u8(*subsystem);
            ident.write(stream);
        }
    }

    fn read(stream: &mut Stream) -> Result<Self, WireError> {
        let mut config = Configuration::default();
        let subsystem_count = stream.read_u8()?;
        for _ in 0..subsystem_count {
            let subsystem = stream.read_u8()?;
            let nodes = config.subsystems.entry(subsystem).or_default();
            let node_count = stream.read_u8()?;
            for _ in 0..node_count {
                let node = stream.read_u8()?;
                let components = nodes.entry(node).or_default();
                let component_count = stream.read_u8()?;
                for _ in 0..component_count {
                    let component = stream.read_u8()?;
                    let instance = stream.read_u8()?;
                    components.insert((component, instance));
                }
            }
        }
        let ident_count = stream.read_u8()?;
        for _ in 0..ident_count {
            let subsystem = stream.read_u8()?;
            config.identifications.insert(subsystem, Identification::read(stream)?);
        }
        Ok(config)
    }
}

/// Which slice of the configuration tree a query asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ConfigurationQueryField {
    #[default]
    Subsystem = 1,
    Node = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueryConfiguration {
    pub field: ConfigurationQueryField,
}

impl MessageBody for QueryConfiguration {
    const CODE: u16 = codes::QUERY_CONFIGURATION;

    fn write_body(&self, stream: &mut Stream) {
        stream.write_u8(self.field as u8);
    }

    fn read_body(stream: &mut Stream) -> Result<Self, WireError> {
        let field = match stream.read_u8()? {
            1 => ConfigurationQueryField::Subsystem,
            2 => ConfigurationQueryField::Node,
            _ => return Err(WireError::BadPacket("configuration query field")),
        };
        Ok(Self { field })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReportConfiguration {
    pub configuration: Configuration,
}

impl MessageBody for ReportConfiguration {
    const CODE: u16 = codes::REPORT_CONFIGURATION;

    fn write_body(&self, stream: &mut Stream) {
        self.configuration.write(stream);
    }

    fn read_body(stream: &mut Stream) -> Result<Self, WireError> {
        Ok(Self { configuration: Configuration::read(stream)? })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum IdentificationQueryType {
    #[default]
    Subsystem = 1,
    Node = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueryIdentification {
    pub query_type: IdentificationQueryType,
}

impl MessageBody for QueryIdentification {
    const CODE: u16 = codes::QUERY_IDENTIFICATION;

    fn write_body(&self, stream: &mut Stream) {
        stream.write_u8(self.query_type as u8);
    }

    fn read_body(stream: &mut Stream) -> Result<Self, WireError> {
        let query_type = match stream.read_u8()? {
            1 => IdentificationQueryType::Subsystem,
            2 => IdentificationQueryType::Node,
            _ => return Err(WireError::BadPacket("identification query type")),
        };
        Ok(Self { query_type })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReportIdentification {
    pub query_type: IdentificationQueryType,
    pub identification: Identification,
}

impl MessageBody for ReportIdentification {
    const CODE: u16 = codes::REPORT_IDENTIFICATION;

    fn write_body(&self, stream: &mut Stream) {
        stream.write_u8(self.query_type as u8);
        self.identification.write(stream);
    }

    fn read_body(stream: &mut Stream) -> Result<Self, WireError> {
        let query_type = match stream.read_u8()? {
            1 => IdentificationQueryType::Subsystem,
            2 => IdentificationQueryType::Node,
            _ => return Err(WireError::BadPacket("identification query type")),
        };
        Ok(Self { query_type, identification: Identification::read(stream)? })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QuerySubsystemList;

impl MessageBody for QuerySubsystemList {
    const CODE: u16 = codes::QUERY_SUBSYSTEM_LIST;

    fn write_body(&self, _stream: &mut Stream) {}

    fn read_body(_stream: &mut Stream) -> Result<Self, WireError> {
        Ok(QuerySubsystemList)
    }
}

/// The node-manager addresses of every subsystem heard within the
/// staleness window.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReportSubsystemList {
    pub subsystems: Vec<Address>,
}

impl MessageBody for ReportSubsystemList {
    const CODE: u16 = codes::REPORT_SUBSYSTEM_LIST;

    fn write_body(&self, stream: &mut Stream) {
        stream.write_u8(self.subsystems.len() as u8);
        for id in &self.subsystems {
            stream.write_u32(id.to_u32());
        }
    }

    fn read_body(stream: &mut Stream) -> Result<Self, WireError> {
        let count = stream.read_u8()?;
        let mut subsystems = Vec::with_capacity(count as usize);
        for _ in 0..count {
            subsystems.push(Address::from_u32(stream.read_u32()?));
        }
        Ok(Self { subsystems })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueryServices;

impl MessageBody for QueryServices {
    const CODE: u16 = codes::QUERY_SERVICES;

    fn write_body(&self, _stream: &mut Stream) {}

    fn read_body(_stream: &mut Stream) -> Result<Self, WireError> {
        Ok(QueryServices)
    }
}

/// A service: its type plus the message codes it accepts and emits.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Service {
    pub service_type: u16,
    pub inputs: Vec<u16>,
    pub outputs: Vec<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReportServices {
    pub services: Vec<Service>,
}

impl MessageBody for ReportServices {
    const CODE: u16 = codes::REPORT_SERVICES;

    fn write_body(&self, stream: &mut Stream) {
        stream.write_u8(self.services.len() as u8);
        for service in &self.services {
            stream.write_u16(service.service_type);
            stream.write_u8(service.inputs.len() as u8);
            for code in &service.inputs {
                stream.write_u16(*code);
            }
            stream.write_u8(service.outputs.len() as u8);
            for code in &service.outputs {
                stream.write_u16(*code);
            }
        }
    }

    fn read_body(stream: &mut Stream) -> Result<Self, WireError> {
        let count = stream.read_u8()?;
        let mut services = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let service_type = stream.read_u16()?;
            let input_count = stream.read_u8()?;
            let mut inputs = Vec::with_capacity(input_count as usize);
            for _ in 0..input_count {
                inputs.push(stream.read_u16()?);
            }
            let output_count = stream.read_u8()?;
            let mut outputs = Vec::with_capacity(output_count as usize);
            for _ in 0..output_count {
                outputs.push(stream.read_u16()?);
            }
            services.push(Service { service_type, inputs, outputs });
        }
        Ok(Self { services })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configuration_round_trip() {
        let mut config = Configuration::default();
        config.add_component(Address::new(1, 1, 1, 1));
        config.add_component(Address::new(1, 1, 40, 1));
        config.add_component(Address::new(1, 2, 33, 1));
        config.identifications.insert(
            1,
            Identification { authority: 3, type_code: 10001, name: "rover".into() },
        );

        let mut stream = Stream::new();
        config.write(&mut stream);
        let decoded = Configuration::read(&mut stream).unwrap();
        assert_eq!(decoded, config);
    }

    #[test]
    fn views_and_merge() {
        let mut config = Configuration::default();
        config.add_component(Address::new(1, 1, 5, 1));
        config.add_component(Address::new(2, 1, 6, 1));

        let view = config.subsystem_view(1);
        assert!(view.subsystems.contains_key(&1));
        assert!(!view.subsystems.contains_key(&2));

        let mut other = Configuration::default();
        other.add_component(Address::new(2, 3, 7, 1));
        config.merge(&other);
        assert_eq!(config.components_on_node(2, 3), vec![Address::new(2, 3, 7, 1)]);

        config.remove_component(Address::new(1, 1, 5, 1));
        assert!(config.components_on_node(1, 1).is_empty());
        assert!(!config.subsystems.contains_key(&1));
    }
}
