//! Serial-port sample source.
//!
//! A background thread owns the port and forwards complete lines over a
//! bounded channel. The consumer waits on that channel with the
//! configured read timeout, so the session loop only ever suspends in
//! [`SerialSource::next_sample`].

use crate::config::duration_serde;
use crate::source::port::{PortGuard, PortRegistry};
use crate::source::types::{LineDecoder, Sample, SourceError};
use crate::source::SampleSource;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// How long the reader thread blocks on the device before re-checking
/// whether it should stop.
const DEVICE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Longest line kept while waiting for a terminator.
const MAX_LINE_BYTES: usize = 256;

/// Serial line settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Device path or name (e.g. `/dev/ttyACM0`, `COM4`)
    pub port: String,
    /// Baud rate
    pub baud_rate: u32,
    /// How long to wait for one reading before reporting a read timeout
    #[serde(with = "duration_serde")]
    pub read_timeout: Duration,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: default_port().to_string(),
            baud_rate: 115_200,
            read_timeout: Duration::from_secs(5),
        }
    }
}

#[cfg(target_os = "windows")]
fn default_port() -> &'static str {
    "COM4"
}

#[cfg(not(target_os = "windows"))]
fn default_port() -> &'static str {
    "/dev/ttyACM0"
}

enum ReaderMessage {
    Line(Vec<u8>),
    Failed(String),
}

/// Sample source backed by a physical serial port.
pub struct SerialSource {
    port_name: String,
    receiver: Receiver<ReaderMessage>,
    running: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
    read_timeout: Duration,
    decoder: LineDecoder,
    guard: Option<PortGuard>,
}

impl SerialSource {
    /// Open the port exclusively and start the reader thread.
    ///
    /// Fails with `PortBusy` if another session holds the port and with
    /// `Connection` if the device cannot be opened.
    pub fn open(config: &SerialConfig, ports: &PortRegistry) -> Result<Self, SourceError> {
        let guard = ports.acquire(&config.port)?;

        let device = serialport::new(&config.port, config.baud_rate)
            .timeout(DEVICE_POLL_INTERVAL)
            .open()
            .map_err(|e| SourceError::Connection {
                port: config.port.clone(),
                reason: e.to_string(),
            })?;

        let (sender, receiver) = bounded(1024);
        let running = Arc::new(AtomicBool::new(true));

        let thread_running = running.clone();
        let handle = thread::Builder::new()
            .name(format!("serial-reader:{}", config.port))
            .spawn(move || read_lines(device, sender, thread_running))
            .map_err(|e| SourceError::Connection {
                port: config.port.clone(),
                reason: format!("failed to spawn reader thread: {e}"),
            })?;

        tracing::info!(
            port = %config.port,
            baud = config.baud_rate,
            "serial port opened"
        );

        Ok(Self {
            port_name: config.port.clone(),
            receiver,
            running,
            thread_handle: Some(handle),
            read_timeout: config.read_timeout,
            decoder: LineDecoder::new(),
            guard: Some(guard),
        })
    }
}

impl SampleSource for SerialSource {
    fn next_sample(&mut self) -> Result<Sample, SourceError> {
        if self.guard.is_none() {
            return Err(SourceError::Closed);
        }

        let deadline = Instant::now() + self.read_timeout;
        loop {
            match self.receiver.recv_deadline(deadline) {
                Ok(ReaderMessage::Line(raw)) => match self.decoder.decode(&raw) {
                    Some(result) => return result,
                    None => continue,
                },
                Ok(ReaderMessage::Failed(reason)) => return Err(SourceError::Io(reason)),
                Err(RecvTimeoutError::Timeout) => {
                    return Err(SourceError::ReadTimeout(self.read_timeout))
                }
                Err(RecvTimeoutError::Disconnected) => return Err(SourceError::Closed),
            }
        }
    }

    fn close(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        // Dropping the receiver unblocks a reader stuck on a full channel.
        self.receiver = crossbeam_channel::never();
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
        if self.guard.take().is_some() {
            tracing::info!(
                port = %self.port_name,
                lines = self.decoder.lines_seen(),
                "serial port closed"
            );
        }
    }

    fn describe(&self) -> String {
        format!("serial:{}", self.port_name)
    }
}

impl Drop for SerialSource {
    fn drop(&mut self) {
        self.close();
    }
}

/// Reader thread body: split the byte stream into lines.
///
/// A partial line survives device timeouts and is completed by later reads.
fn read_lines<R: Read>(mut device: R, sender: Sender<ReaderMessage>, running: Arc<AtomicBool>) {
    let mut pending: Vec<u8> = Vec::with_capacity(64);
    let mut buf = [0u8; 256];

    while running.load(Ordering::SeqCst) {
        match device.read(&mut buf) {
            Ok(0) => continue,
            Ok(n) => {
                for &byte in &buf[..n] {
                    if byte == b'\n' || pending.len() >= MAX_LINE_BYTES {
                        let line = std::mem::take(&mut pending);
                        if sender.send(ReaderMessage::Line(line)).is_err() {
                            return;
                        }
                        if byte == b'\n' {
                            continue;
                        }
                    }
                    pending.push(byte);
                }
            }
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::TimedOut
                        | std::io::ErrorKind::WouldBlock
                        | std::io::ErrorKind::Interrupted
                ) =>
            {
                continue
            }
            Err(e) => {
                let _ = sender.send(ReaderMessage::Failed(e.to_string()));
                break;
            }
        }
    }

    running.store(false, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Feeds a fixed byte stream, then behaves like an idle device.
    struct ChunkedDevice {
        chunks: Vec<Vec<u8>>,
    }

    impl Read for ChunkedDevice {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.chunks.is_empty() {
                std::thread::sleep(Duration::from_millis(5));
                return Err(std::io::ErrorKind::TimedOut.into());
            }
            let chunk = self.chunks.remove(0);
            buf[..chunk.len()].copy_from_slice(&chunk);
            Ok(chunk.len())
        }
    }

    fn collect_lines(device: impl Read + Send + 'static, expected: usize) -> Vec<Vec<u8>> {
        let (sender, receiver) = bounded(16);
        let running = Arc::new(AtomicBool::new(true));
        let r = running.clone();
        let handle = thread::spawn(move || read_lines(device, sender, r));

        let mut lines = Vec::new();
        while lines.len() < expected {
            match receiver.recv_timeout(Duration::from_secs(2)) {
                Ok(ReaderMessage::Line(line)) => lines.push(line),
                Ok(ReaderMessage::Failed(reason)) => panic!("reader failed: {reason}"),
                Err(_) => break,
            }
        }
        running.store(false, Ordering::SeqCst);
        drop(receiver);
        handle.join().unwrap();
        lines
    }

    #[test]
    fn test_partial_lines_are_joined() {
        let device = ChunkedDevice {
            chunks: vec![b"900.".to_vec(), b"5,45\n85".to_vec(), b"0,44\n".to_vec()],
        };
        let lines = collect_lines(device, 2);
        assert_eq!(lines, vec![b"900.5,45".to_vec(), b"850,44".to_vec()]);
    }

    #[test]
    fn test_overlong_line_is_cut() {
        let mut noise = vec![b'x'; MAX_LINE_BYTES + 10];
        noise.push(b'\n');
        let device = ChunkedDevice {
            chunks: noise.chunks(64).map(|c| c.to_vec()).collect(),
        };
        let lines = collect_lines(device, 2);
        assert_eq!(lines[0].len(), MAX_LINE_BYTES);
        assert_eq!(lines[1].len(), 10);
    }

    #[test]
    fn test_device_error_is_reported() {
        struct Broken;
        impl Read for Broken {
            fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
                Err(std::io::ErrorKind::BrokenPipe.into())
            }
        }

        let (sender, receiver) = bounded(4);
        read_lines(Broken, sender, Arc::new(AtomicBool::new(true)));
        assert!(matches!(receiver.try_recv(), Ok(ReaderMessage::Failed(_))));
    }

    #[test]
    fn test_reader_stops_on_flag() {
        let (sender, _receiver) = bounded(4);
        let running = Arc::new(AtomicBool::new(false));
        read_lines(Cursor::new(b"900,45\n".to_vec()), sender, running.clone());
        assert!(!running.load(Ordering::SeqCst));
    }

    #[test]
    fn test_open_missing_device_fails() {
        let registry = PortRegistry::new();
        let config = SerialConfig {
            port: "/dev/definitely-not-a-co2-sensor".to_string(),
            ..SerialConfig::default()
        };
        match SerialSource::open(&config, &registry) {
            Err(SourceError::Connection { port, .. }) => {
                assert_eq!(port, config.port);
            }
            Err(other) => panic!("expected connection error, got {other}"),
            Ok(_) => panic!("opening a missing device should fail"),
        }
        // The lock must not leak on the error path
        assert!(!registry.is_held(&config.port));
    }

    #[test]
    fn test_open_busy_port_fails_before_device() {
        let registry = PortRegistry::new();
        let config = SerialConfig::default();
        let _held = registry.acquire(&config.port).unwrap();
        assert!(matches!(
            SerialSource::open(&config, &registry),
            Err(SourceError::PortBusy(_))
        ));
    }
}
