//! Serial (RS-232 family) transport for fixed-peer links.
//!
//! Same wire format as every other transport: 16-byte header, then
//! `data_size` body bytes. The reader resynchronizes by discarding bytes
//! until a decodable header appears.

use crate::error::TransportError;
use crate::{SharedStreamHandler, TransportKind};
use jaus_wire::{Header, Stream, HEADER_SIZE, MAX_BODY_SIZE};
use parking_lot::Mutex;
use serialport::SerialPort;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, warn};

/// Line parameters for a serial peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialSettings {
    pub port: String,
    pub baud: u32,
    pub data_bits: u8,
    pub parity: u8,
    pub stop_bits: u8,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self { port: String::new(), baud: 9600, data_bits: 8, parity: 0, stop_bits: 1 }
    }
}

fn open_port(settings: &SerialSettings) -> Result<Box<dyn SerialPort>, TransportError> {
    let data_bits = match settings.data_bits {
        5 => serialport::DataBits::Five,
        6 => serialport::DataBits::Six,
        7 => serialport::DataBits::Seven,
        8 => serialport::DataBits::Eight,
        _ => return Err(TransportError::InvalidValue("serial data bits")),
    };
    let parity = match settings.parity {
        0 => serialport::Parity::None,
        1 => serialport::Parity::Odd,
        2 => serialport::Parity::Even,
        _ => return Err(TransportError::InvalidValue("serial parity")),
    };
    let stop_bits = match settings.stop_bits {
        1 => serialport::StopBits::One,
        2 => serialport::StopBits::Two,
        _ => return Err(TransportError::InvalidValue("serial stop bits")),
    };
    serialport::new(&settings.port, settings.baud)
        .data_bits(data_bits)
        .parity(parity)
        .stop_bits(stop_bits)
        .timeout(Duration::from_millis(100))
        .open()
        .map_err(|e| TransportError::ConnectionFailure(format!("serial {}: {e}", settings.port)))
}

/// A serial link: one writer handle, one background reader.
pub struct SerialConnection {
    writer: Mutex<Box<dyn SerialPort>>,
    quit: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
}

impl SerialConnection {
    pub fn open(
        settings: &SerialSettings,
        handler: SharedStreamHandler,
    ) -> Result<Self, TransportError> {
        let writer = open_port(settings)?;
        let reader_port = writer.try_clone().map_err(|e| {
            TransportError::ConnectionFailure(format!("serial clone {}: {e}", settings.port))
        })?;
        let quit = Arc::new(AtomicBool::new(false));

        let reader = {
            let quit = quit.clone();
            std::thread::Builder::new()
                .name("jaus-serial-recv".into())
                .spawn(move || read_loop(reader_port, handler, quit))?
        };

        Ok(Self { writer: Mutex::new(writer), quit, reader: Some(reader) })
    }

    pub fn send_stream(&self, stream: &Stream) -> Result<(), TransportError> {
        self.writer.lock().write_all(stream.as_slice())?;
        Ok(())
    }
}

impl Drop for SerialConnection {
    fn drop(&mut self) {
        self.quit.store(true, Ordering::Release);
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
    }
}

fn read_loop(mut port: Box<dyn SerialPort>, handler: SharedStreamHandler, quit: Arc<AtomicBool>) {
    let mut pending: Vec<u8> = Vec::with_capacity(2 * MAX_BODY_SIZE);
    let mut chunk = [0u8; 512];

    while !quit.load(Ordering::Acquire) {
        match port.read(&mut chunk) {
            Ok(0) => continue,
            Ok(n) => pending.extend_from_slice(&chunk[..n]),
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue
            }
            Err(e) => {
                warn!("serial read failed: {e}");
                return;
            }
        }

        // Extract as many whole messages as the buffer holds, discarding
        // garbage one byte at a time until a header decodes.
        loop {
            if pending.len() < HEADER_SIZE {
                break;
            }
            let header = match Header::decode(&pending[..HEADER_SIZE]) {
                Ok(header) if (header.data_size as usize) <= MAX_BODY_SIZE => header,
                _ => {
                    debug!("resynchronizing serial stream");
                    pending.remove(0);
                    continue;
                }
            };
            let frame_len = HEADER_SIZE + header.data_size as usize;
            if pending.len() < frame_len {
                break;
            }
            let frame: Vec<u8> = pending.drain(..frame_len).collect();
            handler.on_stream(Stream::from_bytes(frame), Some(header), TransportKind::Serial);
        }
    }
}
