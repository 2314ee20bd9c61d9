//! Traffic logging: one line per message sent, received, or dropped.
//!
//! Opened when the node starts with `logdata` set. The format is a flat
//! comma-separated line per entry, cheap enough to leave on in the field.

use jaus_transport::TransportKind;
use jaus_wire::Header;
use parking_lot::Mutex;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::time::Instant;

/// Why an incoming packet was discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    InvalidHeader,
    Loopback,
    AddressConflict,
}

impl DropReason {
    fn label(self) -> &'static str {
        match self {
            DropReason::InvalidHeader => "invalid-header",
            DropReason::Loopback => "loopback",
            DropReason::AddressConflict => "address-conflict",
        }
    }
}

fn kind_label(kind: TransportKind) -> &'static str {
    match kind {
        TransportKind::SharedMemory => "shm",
        TransportKind::Udp => "udp",
        TransportKind::Tcp => "tcp",
        TransportKind::Serial => "serial",
        TransportKind::Communicator => "communicator",
    }
}

pub struct TrafficLog {
    out: Mutex<BufWriter<File>>,
    started: Instant,
}

impl TrafficLog {
    pub fn create(path: &Path) -> io::Result<Self> {
        let mut out = BufWriter::new(File::create(path)?);
        writeln!(out, "ms,direction,transport,code,source,destination,size,note")?;
        Ok(Self { out: Mutex::new(out), started: Instant::now() })
    }

    fn line(&self, direction: &str, transport: &str, header: Option<&Header>, note: &str) {
        let ms = self.started.elapsed().as_millis();
        let mut out = self.out.lock();
        let result = match header {
            Some(header) => writeln!(
                out,
                "{ms},{direction},{transport},{:#06x},{},{},{},{note}",
                header.command_code, header.source, header.destination, header.data_size
            ),
            None => writeln!(out, "{ms},{direction},{transport},,,,,{note}"),
        };
        // A full disk must not take the router down with it.
        let _ = result;
        let _ = out.flush();
    }

    pub fn sent(&self, header: &Header, delivered: bool) {
        self.line("sent", "-", Some(header), if delivered { "ok" } else { "failed" });
    }

    pub fn received(&self, header: &Header, kind: TransportKind) {
        self.line("recv", kind_label(kind), Some(header), "ok");
    }

    pub fn dropped(&self, header: Option<&Header>, kind: TransportKind, reason: DropReason) {
        self.line("drop", kind_label(kind), header, reason.label());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jaus_wire::Address;

    #[test]
    fn entries_land_in_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("traffic.log");
        let log = TrafficLog::create(&path).unwrap();

        let header =
            Header::new(0x4202, Address::new(1, 1, 2, 1), Address::new(1, 1, 1, 1));
        log.sent(&header, true);
        log.received(&header, TransportKind::Udp);
        log.dropped(Some(&header), TransportKind::Udp, DropReason::Loopback);
        log.dropped(None, TransportKind::Tcp, DropReason::InvalidHeader);

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 5);
        assert!(lines[1].contains("sent"));
        assert!(lines[2].contains("udp"));
        assert!(lines[3].contains("loopback"));
        assert!(lines[4].contains("invalid-header"));
    }
}
