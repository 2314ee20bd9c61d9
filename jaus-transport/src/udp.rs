//! UDP transports: unicast point-to-point links, the multicast discovery
//! channel, and broadcast fallback.

use crate::error::TransportError;
use crate::{SharedStreamHandler, TransportKind, WIRE_PORT};
use jaus_wire::{Address, Header, Stream, MAX_PACKET_SIZE};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, warn};

/// Default discovery multicast group.
pub const DEFAULT_MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(224, 1, 0, 1);
/// Default multicast TTL: same-segment only.
pub const DEFAULT_MULTICAST_TTL: u32 = 1;

/// Reject groups outside the administratively usable multicast range.
pub fn validate_multicast_group(group: Ipv4Addr) -> Result<(), TransportError> {
    if group.is_multicast() {
        Ok(())
    } else {
        Err(TransportError::InvalidValue("multicast group outside 224.0.0.0/4"))
    }
}

/// Unicast sender to one peer host.
pub struct UdpClient {
    socket: UdpSocket,
    peer: SocketAddr,
}

impl UdpClient {
    pub fn connect(host: IpAddr, port: u16) -> Result<Self, TransportError> {
        let bind_addr: SocketAddr = match host {
            IpAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            IpAddr::V6(_) => (std::net::Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let socket = UdpSocket::bind(bind_addr)?;
        Ok(Self { socket, peer: SocketAddr::new(host, port) })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn send_stream(&self, stream: &Stream) -> Result<(), TransportError> {
        self.socket.send_to(stream.as_slice(), self.peer)?;
        Ok(())
    }
}

/// Multicast sender on a configured group.
pub struct MulticastClient {
    socket: UdpSocket,
    group: SocketAddr,
}

impl MulticastClient {
    pub fn open(group: Ipv4Addr, port: u16, ttl: u32) -> Result<Self, TransportError> {
        validate_multicast_group(group)?;
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        socket.set_multicast_ttl_v4(ttl)?;
        Ok(Self { socket, group: (group, port).into() })
    }

    pub fn send_stream(&self, stream: &Stream) -> Result<(), TransportError> {
        self.socket.send_to(stream.as_slice(), self.group)?;
        Ok(())
    }
}

/// Broadcast sender for local-segment dissemination.
pub struct BroadcastClient {
    socket: UdpSocket,
    target: SocketAddr,
}

impl BroadcastClient {
    pub fn open(port: u16) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        socket.set_broadcast(true)?;
        Ok(Self { socket, target: (Ipv4Addr::BROADCAST, port).into() })
    }

    pub fn send_stream(&self, stream: &Stream) -> Result<(), TransportError> {
        self.socket.send_to(stream.as_slice(), self.target)?;
        Ok(())
    }
}

/// Receiving side of the UDP transport. Binds the wire port, optionally
/// joins the discovery multicast group, and runs a reader thread that hands
/// parsed frames to the stream handler.
///
/// Also remembers which host each source address last transmitted from, so
/// routing can open a unicast connection back to a node it only knows from
/// a multicast heartbeat.
pub struct UdpServer {
    socket: UdpSocket,
    hosts: Arc<RwLock<HashMap<(u8, u8), IpAddr>>>,
    quit: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
}

impl UdpServer {
    pub fn bind(
        port: u16,
        multicast: Option<(Ipv4Addr, Option<Ipv4Addr>)>,
        handler: SharedStreamHandler,
    ) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port))?;
        if let Some((group, interface)) = multicast {
            validate_multicast_group(group)?;
            socket.join_multicast_v4(&group, &interface.unwrap_or(Ipv4Addr::UNSPECIFIED))?;
        }
        socket.set_read_timeout(Some(Duration::from_millis(100)))?;

        let hosts: Arc<RwLock<HashMap<(u8, u8), IpAddr>>> = Arc::new(RwLock::new(HashMap::new()));
        let quit = Arc::new(AtomicBool::new(false));

        let reader = {
            let socket = socket.try_clone()?;
            let hosts = hosts.clone();
            let quit = quit.clone();
            std::thread::Builder::new()
                .name("jaus-udp-recv".into())
                .spawn(move || recv_loop(socket, hosts, handler, quit))?
        };

        Ok(Self { socket, hosts, quit, reader: Some(reader) })
    }

    /// Bind on an ephemeral port; used by tests and secondary links.
    pub fn bind_ephemeral(handler: SharedStreamHandler) -> Result<Self, TransportError> {
        Self::bind(0, None, handler)
    }

    pub fn local_port(&self) -> u16 {
        self.socket.local_addr().map(|a| a.port()).unwrap_or(0)
    }

    /// Last host seen transmitting for `id`'s node, if any.
    pub fn lookup_host(&self, id: Address) -> Option<IpAddr> {
        self.hosts.read().get(&(id.subsystem, id.node)).copied()
    }
}

impl Drop for UdpServer {
    fn drop(&mut self) {
        self.quit.store(true, Ordering::Release);
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
    }
}

fn recv_loop(
    socket: UdpSocket,
    hosts: Arc<RwLock<HashMap<(u8, u8), IpAddr>>>,
    handler: SharedStreamHandler,
    quit: Arc<AtomicBool>,
) {
    let mut buffer = [0u8; MAX_PACKET_SIZE];
    while !quit.load(Ordering::Acquire) {
        let (len, from) = match socket.recv_from(&mut buffer) {
            Ok(received) => received,
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue
            }
            Err(e) => {
                warn!("UDP receive failed: {e}");
                continue;
            }
        };

        let header = match Header::decode(&buffer[..len]) {
            Ok(header) => header,
            Err(_) => {
                debug!("dropping malformed datagram from {from} ({len} bytes)");
                continue;
            }
        };
        hosts
            .write()
            .insert((header.source.subsystem, header.source.node), from.ip());

        let stream = Stream::from_bytes(buffer[..len].to_vec());
        handler.on_stream(stream, Some(header), TransportKind::Udp);
    }
}

/// Resolve a `host[:port]` string for a static node connection entry.
pub fn resolve_host(host: &str) -> Result<(IpAddr, u16), TransportError> {
    if let Some((addr, port)) = host.rsplit_once(':') {
        if let (Ok(addr), Ok(port)) = (addr.parse(), port.parse()) {
            return Ok((addr, port));
        }
    }
    host.parse()
        .map(|addr| (addr, WIRE_PORT))
        .map_err(|_| TransportError::InvalidValue("unparseable host address"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multicast_group_validation() {
        assert!(validate_multicast_group(Ipv4Addr::new(224, 1, 0, 1)).is_ok());
        assert!(validate_multicast_group(Ipv4Addr::new(239, 255, 0, 1)).is_ok());
        assert!(validate_multicast_group(Ipv4Addr::new(192, 168, 0, 1)).is_err());
    }

    #[test]
    fn host_strings_resolve_with_default_port() {
        assert_eq!(
            resolve_host("10.0.0.1").unwrap(),
            ("10.0.0.1".parse::<IpAddr>().unwrap(), WIRE_PORT)
        );
        assert_eq!(
            resolve_host("10.0.0.1:4000").unwrap(),
            ("10.0.0.1".parse::<IpAddr>().unwrap(), 4000)
        );
        assert!(resolve_host("not a host").is_err());
    }
}
