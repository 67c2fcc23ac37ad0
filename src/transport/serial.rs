//! Generic serial port transport
//!
//! Wraps `tokio-serial` so reads and writes are natively async; the port is
//! opened on `connect` with 8N1 framing and no flow control. Without the
//! `instrument_serial` feature every link operation returns
//! [`TransportError::FeatureNotEnabled`].

use super::{
    timed, FrameBuffer, InterfaceKind, ReadMode, SerialSettings, Terminator, TimeoutOptions,
    Transport, TransportError,
};
use async_trait::async_trait;
use tracing::{debug, info};

#[cfg(feature = "instrument_serial")]
use tokio::io::AsyncWriteExt;
#[cfg(feature = "instrument_serial")]
use tokio_serial::{SerialPortBuilderExt, SerialStream};

/// Serial transport for RS-232 instruments
pub struct SerialTransport {
    name: String,
    settings: SerialSettings,
    terminator: Terminator,
    timeouts: TimeoutOptions,
    frames: FrameBuffer,
    #[cfg(feature = "instrument_serial")]
    stream: Option<SerialStream>,
}

impl SerialTransport {
    /// Create a serial transport; nothing is opened until `connect`
    ///
    /// # Arguments
    /// * `name` - Interface name
    /// * `settings` - Port path (e.g., "/dev/ttyUSB0", "COM3") and baud rate
    pub fn new(name: impl Into<String>, settings: SerialSettings) -> Self {
        Self {
            name: name.into(),
            settings,
            terminator: Terminator::CrLf,
            timeouts: TimeoutOptions::default(),
            frames: FrameBuffer::new(),
            #[cfg(feature = "instrument_serial")]
            stream: None,
        }
    }

    /// Terminator appended to writes and scanned for on reads.
    pub fn with_terminator(mut self, terminator: Terminator) -> Self {
        self.terminator = terminator;
        self
    }
}

/// Open a serial port for async I/O.
#[cfg(feature = "instrument_serial")]
pub(crate) fn open_port(settings: &SerialSettings) -> Result<SerialStream, TransportError> {
    tokio_serial::new(&settings.port, settings.baud_rate)
        .data_bits(tokio_serial::DataBits::Eight)
        .parity(tokio_serial::Parity::None)
        .stop_bits(tokio_serial::StopBits::One)
        .flow_control(tokio_serial::FlowControl::None)
        .open_native_async()
        .map_err(|e| {
            TransportError::connect(
                format!("{} at {} baud", settings.port, settings.baud_rate),
                e,
            )
        })
}

#[async_trait]
impl Transport for SerialTransport {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> InterfaceKind {
        InterfaceKind::SerialPort
    }

    fn resource_key(&self) -> String {
        format!("serial:{}", self.settings.port)
    }

    fn configure(&mut self, options: TimeoutOptions) -> Result<(), TransportError> {
        if self.is_connected() {
            return Err(TransportError::AlreadyConnected);
        }
        self.timeouts = options;
        Ok(())
    }

    fn timeouts(&self) -> TimeoutOptions {
        self.timeouts
    }

    #[cfg(feature = "instrument_serial")]
    async fn connect(&mut self) -> Result<(), TransportError> {
        if self.stream.is_some() {
            return Ok(());
        }
        let settings = self.settings.clone();
        let port = timed("connect", self.timeouts.connect_timeout, async move {
            open_port(&settings)
        })
        .await?;
        self.stream = Some(port);
        self.frames.clear();
        info!(
            "Serial port '{}' opened at {} baud",
            self.settings.port, self.settings.baud_rate
        );
        Ok(())
    }

    #[cfg(not(feature = "instrument_serial"))]
    async fn connect(&mut self) -> Result<(), TransportError> {
        Err(TransportError::FeatureNotEnabled("instrument_serial"))
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        #[cfg(feature = "instrument_serial")]
        if self.stream.take().is_some() {
            debug!("Serial port '{}' closed", self.settings.port);
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        #[cfg(feature = "instrument_serial")]
        {
            self.stream.is_some()
        }
        #[cfg(not(feature = "instrument_serial"))]
        {
            false
        }
    }

    fn terminator(&self) -> Terminator {
        self.terminator
    }

    async fn set_terminator(&mut self, terminator: Terminator) -> Result<(), TransportError> {
        self.terminator = terminator;
        Ok(())
    }

    #[cfg(feature = "instrument_serial")]
    async fn write_bytes(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::NotConnected)?;
        timed("write", self.timeouts.write_timeout, async {
            stream.write_all(data).await?;
            stream.flush().await?;
            Ok(())
        })
        .await?;
        debug!("Sent serial data: {}", String::from_utf8_lossy(data).trim_end());
        Ok(())
    }

    #[cfg(not(feature = "instrument_serial"))]
    async fn write_bytes(&mut self, _data: &[u8]) -> Result<(), TransportError> {
        Err(TransportError::FeatureNotEnabled("instrument_serial"))
    }

    #[cfg(feature = "instrument_serial")]
    async fn read(&mut self, mode: ReadMode) -> Result<Vec<u8>, TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::NotConnected)?;
        let frame = self
            .frames
            .read_frame_within(stream, self.terminator, mode, self.timeouts.read_timeout)
            .await?;
        debug!("Received serial data: {}", String::from_utf8_lossy(&frame));
        Ok(frame)
    }

    #[cfg(not(feature = "instrument_serial"))]
    async fn read(&mut self, _mode: ReadMode) -> Result<Vec<u8>, TransportError> {
        Err(TransportError::FeatureNotEnabled("instrument_serial"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> SerialSettings {
        SerialSettings {
            port: "/dev/ttyUSB-none".to_string(),
            baud_rate: 9600,
        }
    }

    #[test]
    fn test_resource_key_names_port() {
        let transport = SerialTransport::new("dmm-serial", settings());
        assert_eq!(transport.resource_key(), "serial:/dev/ttyUSB-none");
        assert_eq!(transport.terminator(), Terminator::CrLf);
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_io_before_connect_fails() {
        let mut transport = SerialTransport::new("dmm-serial", settings());
        assert!(transport.write_string("*IDN?").await.is_err());
        assert!(transport.read(ReadMode::Terminated).await.is_err());
    }

    #[tokio::test]
    async fn test_connect_to_missing_port_fails() {
        let mut transport = SerialTransport::new("dmm-serial", settings());
        assert!(transport.connect().await.is_err());
        assert!(!transport.is_connected());
    }
}
