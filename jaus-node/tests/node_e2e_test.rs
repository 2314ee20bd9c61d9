//! Same-host end-to-end: a node manager and a component talking over real
//! shared memory.

use jaus_component::{Component, ReceiptStatus};
use jaus_node::{NodeManager, NodeSettings};
use jaus_wire::codec::codes;
use jaus_wire::messages::QueryHeartbeatPulse;
use jaus_wire::Address;

fn test_settings() -> NodeSettings {
    // Identity derived from the pid keeps parallel test runs from
    // colliding in the shared-memory namespace.
    let pid = std::process::id();
    let mut settings =
        NodeSettings::new((pid % 200) as u8 + 1, (pid / 200 % 200) as u8 + 1);
    settings.mbsize = 64 * 1024;
    settings.conflict_window_ms = 50;
    settings
}

#[test]
fn component_queries_its_node_manager() {
    let settings = test_settings();
    let node_id = Address::new(settings.subsystem_id, settings.node_id, 1, 1);
    let mut manager = NodeManager::initialize(settings).expect("node manager starts");
    assert_eq!(manager.id(), node_id);

    let component_id = Address::new(node_id.subsystem, node_id.node, 2, 1);
    let mut component = Component::initialize(component_id, 0).expect("component starts");

    let receipt = component
        .query(node_id, &QueryHeartbeatPulse)
        .expect("blocking send accepted");
    assert_eq!(receipt.status, ReceiptStatus::Success);
    let response = receipt.response.expect("reply stream");
    let header = response.peek_header().unwrap();
    assert_eq!(header.command_code, codes::REPORT_HEARTBEAT_PULSE);
    assert_eq!(header.source, node_id);
    assert_eq!(header.destination, component_id);

    component.shutdown();
    manager.shutdown();
}
