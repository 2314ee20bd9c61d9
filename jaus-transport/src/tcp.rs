//! TCP transport for reliable inter-node links.
//!
//! The stream carries back-to-back wire messages: a 16-byte header whose
//! `data_size` field tells the reader how many body bytes follow. No extra
//! framing.

use crate::error::TransportError;
use crate::{SharedStreamHandler, TransportKind};
use jaus_wire::{Header, Stream, HEADER_SIZE, MAX_BODY_SIZE};
use parking_lot::Mutex;
use std::io::{Read, Write};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, warn};

/// Outgoing reliable link to one peer node.
pub struct TcpClient {
    stream: Mutex<TcpStream>,
    peer: SocketAddr,
}

impl TcpClient {
    pub fn connect(host: IpAddr, port: u16) -> Result<Self, TransportError> {
        let peer = SocketAddr::new(host, port);
        let stream = TcpStream::connect_timeout(&peer, Duration::from_millis(500))
            .map_err(|e| TransportError::ConnectionFailure(format!("tcp connect {peer}: {e}")))?;
        stream.set_nodelay(true)?;
        Ok(Self { stream: Mutex::new(stream), peer })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn send_stream(&self, stream: &Stream) -> Result<(), TransportError> {
        self.stream.lock().write_all(stream.as_slice())?;
        Ok(())
    }
}

/// Accepting side of the TCP transport; one reader thread per connection.
pub struct TcpServer {
    local: SocketAddr,
    quit: Arc<AtomicBool>,
    acceptor: Option<JoinHandle<()>>,
}

impl TcpServer {
    pub fn bind(port: u16, handler: SharedStreamHandler) -> Result<Self, TransportError> {
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, port))?;
        let local = listener.local_addr()?;
        listener.set_nonblocking(true)?;
        let quit = Arc::new(AtomicBool::new(false));

        let acceptor = {
            let quit = quit.clone();
            std::thread::Builder::new()
                .name("jaus-tcp-accept".into())
                .spawn(move || accept_loop(listener, handler, quit))?
        };

        Ok(Self { local, quit, acceptor: Some(acceptor) })
    }

    pub fn local_port(&self) -> u16 {
        self.local.port()
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        self.quit.store(true, Ordering::Release);
        if let Some(acceptor) = self.acceptor.take() {
            let _ = acceptor.join();
        }
    }
}

fn accept_loop(listener: TcpListener, handler: SharedStreamHandler, quit: Arc<AtomicBool>) {
    let mut readers: Vec<JoinHandle<()>> = Vec::new();
    while !quit.load(Ordering::Acquire) {
        match listener.accept() {
            Ok((connection, from)) => {
                debug!("accepted TCP link from {from}");
                let handler = handler.clone();
                let quit = quit.clone();
                match std::thread::Builder::new()
                    .name("jaus-tcp-recv".into())
                    .spawn(move || read_loop(connection, handler, quit))
                {
                    Ok(join) => readers.push(join),
                    Err(e) => warn!("failed to spawn TCP reader: {e}"),
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
            }
            Err(e) => {
                warn!("TCP accept failed: {e}");
                std::thread::sleep(Duration::from_millis(50));
            }
        }
    }
    for reader in readers {
        let _ = reader.join();
    }
}

fn read_loop(mut connection: TcpStream, handler: SharedStreamHandler, quit: Arc<AtomicBool>) {
    if connection
        .set_read_timeout(Some(Duration::from_millis(100)))
        .is_err()
    {
        return;
    }

    let mut header_bytes = [0u8; HEADER_SIZE];
    while !quit.load(Ordering::Acquire) {
        match read_exact_interruptible(&mut connection, &mut header_bytes, &quit) {
            Ok(true) => {}
            Ok(false) | Err(_) => return,
        }
        let header = match Header::decode(&header_bytes) {
            Ok(header) => header,
            Err(_) => {
                // Framing is lost once a header is garbage; drop the link.
                warn!("malformed header on TCP link, closing");
                return;
            }
        };
        if header.data_size as usize > MAX_BODY_SIZE {
            warn!("oversized body ({}) on TCP link, closing", header.data_size);
            return;
        }

        let mut frame = vec![0u8; HEADER_SIZE + header.data_size as usize];
        frame[..HEADER_SIZE].copy_from_slice(&header_bytes);
        match read_exact_interruptible(&mut connection, &mut frame[HEADER_SIZE..], &quit) {
            Ok(true) => {}
            Ok(false) | Err(_) => return,
        }
        handler.on_stream(Stream::from_bytes(frame), Some(header), TransportKind::Tcp);
    }
}

/// `read_exact` that keeps honoring the quit flag across read timeouts.
/// Returns `Ok(false)` on shutdown or EOF; a partial message at EOF is
/// dropped with the link.
fn read_exact_interruptible(
    connection: &mut TcpStream,
    buffer: &mut [u8],
    quit: &AtomicBool,
) -> std::io::Result<bool> {
    let mut filled = 0;
    while filled < buffer.len() {
        if quit.load(Ordering::Acquire) {
            return Ok(false);
        }
        match connection.read(&mut buffer[filled..]) {
            Ok(0) => return Ok(false),
            Ok(n) => filled += n,
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue
            }
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StreamHandler;
    use jaus_wire::Address;

    struct Collector {
        sender: crossbeam::channel::Sender<(Stream, Option<Header>, TransportKind)>,
    }

    impl StreamHandler for Collector {
        fn on_stream(&self, stream: Stream, header: Option<Header>, kind: TransportKind) {
            let _ = self.sender.send((stream, header, kind));
        }
    }

    #[test]
    fn messages_frame_correctly_over_tcp() {
        let (sender, receiver) = crossbeam::channel::unbounded();
        let server = TcpServer::bind(0, Arc::new(Collector { sender })).unwrap();
        let client =
            TcpClient::connect(IpAddr::V4(Ipv4Addr::LOCALHOST), server.local_port()).unwrap();

        let mut first = Stream::new();
        let mut header = Header::new(0x4202, Address::new(1, 1, 1, 1), Address::new(1, 2, 1, 1));
        header.data_size = 3;
        first.write_header(&header).unwrap();
        first.write_bytes(&[7, 8, 9]);

        let mut second = Stream::new();
        header.data_size = 0;
        header.command_code = 0x2202;
        second.write_header(&header).unwrap();

        // One write carrying both messages exercises the framing split.
        let mut combined = Stream::new();
        combined.write_bytes(first.as_slice());
        combined.write_bytes(second.as_slice());
        client.send_stream(&combined).unwrap();

        let (stream, parsed, kind) = receiver.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(kind, TransportKind::Tcp);
        assert_eq!(parsed.unwrap().command_code, 0x4202);
        assert_eq!(stream.body(), &[7, 8, 9]);

        let (_, parsed, _) = receiver.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(parsed.unwrap().command_code, 0x2202);
    }
}
