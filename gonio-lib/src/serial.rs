use crate::channel::Channel;
use crate::constants::{COMMAND_DELAY, DEFAULT_BAUD_RATE, DEFAULT_DEVICE_REGEX, READ_TIMEOUT};
use crate::error::ChannelError;
use async_trait::async_trait;
use bytes::Bytes;
use regex::Regex;
use serialport::{SerialPort, SerialPortInfo, SerialPortType};
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How a [`SerialChannel`] picks and drives its port.
#[derive(Debug, Clone)]
pub struct SerialSettings {
    /// Explicit port name; when unset the first port whose description
    /// matches `device_regex` is used
    pub port: Option<String>,
    pub device_regex: String,
    pub baud_rate: u32,
    /// Bound on a single blocking read
    pub read_timeout: Duration,
    /// Pause before every write, needed by the firmware between commands
    pub command_delay: Duration,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            port: None,
            device_regex: DEFAULT_DEVICE_REGEX.to_string(),
            baud_rate: DEFAULT_BAUD_RATE,
            read_timeout: READ_TIMEOUT,
            command_delay: COMMAND_DELAY,
        }
    }
}

/// A blocking read that outlives a cancelled `receive`.
///
/// Work on the blocking pool cannot be aborted, so the handle is kept and the
/// next call collects its bytes instead of starting a second read.
#[derive(Default)]
struct InFlightRead(Option<JoinHandle<Result<Bytes, ChannelError>>>);

impl InFlightRead {
    /// Awaits the pending read, starting `read` first if none is pending.
    async fn complete<F>(&mut self, read: F) -> Result<Bytes, ChannelError>
    where
        F: FnOnce() -> Result<Bytes, ChannelError> + Send + 'static,
    {
        let pending = self.0.get_or_insert_with(|| tokio::task::spawn_blocking(read));
        let joined = pending.await;
        self.0 = None;
        joined.map_err(|_| ChannelError::Disconnected)?
    }

    /// Waits out a pending read and drops what it returned.
    async fn discard(&mut self) {
        if let Some(pending) = self.0.take() {
            let _ = pending.await;
        }
    }
}

/// [`Channel`] over a serial port.
///
/// The blocking `serialport` calls run on the blocking thread pool. A read
/// cancelled by its caller keeps running and holds the port until it returns
/// or hits the read timeout; its bytes are delivered by the next `receive`.
pub struct SerialChannel {
    settings: SerialSettings,
    port_name: Option<String>,
    port: Option<Arc<Mutex<Box<dyn SerialPort>>>>,
    in_flight: InFlightRead,
}

impl SerialChannel {
    pub fn new(settings: SerialSettings) -> Self {
        Self {
            settings,
            port_name: None,
            port: None,
            in_flight: InFlightRead::default(),
        }
    }

    /// Picks the port to open: the configured one, else the first match.
    pub fn resolve_port(&self) -> Result<String, ChannelError> {
        if let Some(port) = &self.settings.port {
            return Ok(port.clone());
        }
        let ports = available_ports()?;
        find_by_description(&ports, &self.settings.device_regex)
            .map(|info| info.port_name.clone())
            .ok_or_else(|| ChannelError::DeviceNotFound(self.settings.device_regex.clone()))
    }

    fn handle(&self) -> Result<Arc<Mutex<Box<dyn SerialPort>>>, ChannelError> {
        self.port.as_ref().map(Arc::clone).ok_or(ChannelError::NotOpen)
    }
}

#[async_trait]
impl Channel for SerialChannel {
    async fn open(&mut self) -> Result<(), ChannelError> {
        if self.port.is_some() {
            return Ok(());
        }
        let name = self.resolve_port()?;
        info!(port = %name, baud = self.settings.baud_rate, "opening serial port");
        let port = serialport::new(&name, self.settings.baud_rate)
            .timeout(self.settings.read_timeout)
            .open()
            .map_err(|e| match e.kind() {
                serialport::ErrorKind::NoDevice => ChannelError::DeviceNotFound(name.clone()),
                serialport::ErrorKind::Io(io::ErrorKind::PermissionDenied) => {
                    ChannelError::PortBusy(name.clone())
                }
                _ => ChannelError::Serial(e),
            })?;
        self.port = Some(Arc::new(Mutex::new(port)));
        self.port_name = Some(name);
        Ok(())
    }

    async fn close(&mut self) {
        self.in_flight = InFlightRead::default();
        if self.port.take().is_some() {
            info!(port = ?self.port_name, "serial port closed");
        }
        self.port_name = None;
    }

    async fn send(&mut self, text: &str) -> Result<(), ChannelError> {
        let port = self.handle()?;
        tokio::time::sleep(self.settings.command_delay).await;
        let payload = text.as_bytes().to_vec();
        debug!(text, "serial write");
        tokio::task::spawn_blocking(move || -> Result<(), ChannelError> {
            let mut port = port.blocking_lock();
            port.write_all(&payload)?;
            port.flush()?;
            Ok(())
        })
        .await
        .map_err(|_| ChannelError::Disconnected)?
    }

    async fn receive(&mut self) -> Result<Bytes, ChannelError> {
        let port = self.handle()?;
        self.in_flight
            .complete(move || {
                let mut port = port.blocking_lock();
                let mut buf = vec![0u8; 1024];
                match port.read(&mut buf) {
                    Ok(0) => Err(ChannelError::Disconnected),
                    Ok(n) => {
                        buf.truncate(n);
                        Ok(Bytes::from(buf))
                    }
                    Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(Bytes::new()),
                    Err(e) => Err(e.into()),
                }
            })
            .await
    }

    async fn discard_input(&mut self) -> Result<(), ChannelError> {
        let port = self.handle()?;
        self.in_flight.discard().await;
        let port = port.lock().await;
        port.clear(serialport::ClearBuffer::Input)?;
        Ok(())
    }

    fn list_available(&self) -> Result<Vec<String>, ChannelError> {
        Ok(available_ports()?.into_iter().map(|p| p.port_name).collect())
    }

    fn describe(&self, id: &str) -> Option<String> {
        available_ports()
            .ok()?
            .into_iter()
            .find(|p| p.port_name == id)
            .map(|p| describe_port(&p))
    }
}

pub fn available_ports() -> Result<Vec<SerialPortInfo>, ChannelError> {
    Ok(serialport::available_ports()?)
}

/// Human-readable description of a port: USB product and manufacturer when
/// known, else the port type.
pub fn describe_port(info: &SerialPortInfo) -> String {
    match &info.port_type {
        SerialPortType::UsbPort(usb) => {
            let parts: Vec<&str> = [usb.manufacturer.as_deref(), usb.product.as_deref()]
                .into_iter()
                .flatten()
                .collect();
            if parts.is_empty() {
                format!("USB {:04x}:{:04x}", usb.vid, usb.pid)
            } else {
                parts.join(" ")
            }
        }
        SerialPortType::PciPort => "PCI serial port".to_string(),
        SerialPortType::BluetoothPort => "Bluetooth serial port".to_string(),
        SerialPortType::Unknown => "Serial port".to_string(),
    }
}

/// First port whose description matches `pattern`.
///
/// An invalid pattern matches nothing.
pub fn find_by_description<'a>(ports: &'a [SerialPortInfo], pattern: &str) -> Option<&'a SerialPortInfo> {
    let regex = match Regex::new(pattern) {
        Ok(regex) => regex,
        Err(e) => {
            warn!(pattern, "invalid device pattern: {}", e);
            return None;
        }
    };
    ports.iter().find(|p| regex.is_match(&describe_port(p)))
}
