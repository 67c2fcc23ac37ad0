//! Prologix GPIB-ETHERNET / GPIB-USB controller
//!
//! Reference: Prologix GPIB-ETHERNET Controller User Manual
//!
//! Protocol Overview:
//! - Lines starting with `++` are controller commands, everything else is
//!   forwarded to the addressed instrument
//! - Controller commands and data both end with LF; the controller appends
//!   the GPIB terminator selected with `++eos`
//! - CR, LF, ESC and `+` inside instrument data must be escaped with ESC
//! - Read-after-write is disabled (`++auto 0`); reads are requested with
//!   `++read eoi`
//!
//! The same protocol runs over TCP (default port 1234) or a USB virtual
//! serial port, so the transport is generic over a [`PrologixLink`].

use super::{
    timed, FrameBuffer, GpibTransport, InterfaceKind, ReadMode, StatusByte, TcpSettings,
    Terminator, TimeoutOptions, Transport, TransportError,
};
use super::{status::parse_register, EndOfTransmission, SerialSettings};
use async_trait::async_trait;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tracing::{debug, info};

/// `++trg` accepts at most this many addresses per command.
pub const MAX_TRIGGER_ADDRESSES: usize = 15;

const ESC: u8 = 0x1b;

/// Byte stream to the controller.
pub enum PrologixLink {
    /// Prologix GPIB-ETHERNET.
    Tcp(TcpStream),
    /// Prologix GPIB-USB.
    #[cfg(feature = "instrument_serial")]
    Serial(tokio_serial::SerialStream),
}

impl AsyncRead for PrologixLink {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            PrologixLink::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            #[cfg(feature = "instrument_serial")]
            PrologixLink::Serial(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for PrologixLink {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            PrologixLink::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            #[cfg(feature = "instrument_serial")]
            PrologixLink::Serial(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            PrologixLink::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            #[cfg(feature = "instrument_serial")]
            PrologixLink::Serial(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            PrologixLink::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            #[cfg(feature = "instrument_serial")]
            PrologixLink::Serial(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

#[derive(Debug, Clone)]
enum Endpoint {
    Tcp(TcpSettings),
    Serial(SerialSettings),
}

/// Prologix GPIB controller transport
pub struct PrologixTransport {
    name: String,
    endpoint: Endpoint,
    link: Option<PrologixLink>,
    frames: FrameBuffer,
    terminator: Terminator,
    timeouts: TimeoutOptions,
    /// Last `++addr` sent; avoids re-addressing on every command
    address: Option<u8>,
}

impl PrologixTransport {
    /// Controller reached over TCP (GPIB-ETHERNET)
    pub fn tcp(name: impl Into<String>, settings: TcpSettings) -> Self {
        Self::with_endpoint(name.into(), Endpoint::Tcp(settings))
    }

    /// Controller reached over its USB virtual serial port (GPIB-USB)
    pub fn usb(name: impl Into<String>, settings: SerialSettings) -> Self {
        Self::with_endpoint(name.into(), Endpoint::Serial(settings))
    }

    fn with_endpoint(name: String, endpoint: Endpoint) -> Self {
        Self {
            name,
            endpoint,
            link: None,
            frames: FrameBuffer::new(),
            terminator: Terminator::Lf,
            timeouts: TimeoutOptions::default(),
            address: None,
        }
    }

    /// Terminator appended to device writes.
    pub fn with_terminator(mut self, terminator: Terminator) -> Self {
        self.terminator = terminator;
        self
    }

    /// Currently addressed device, as far as the controller was told
    pub fn current_address(&self) -> Option<u8> {
        self.address
    }

    /// Power-on reset of the controller, followed by the connect setup.
    pub async fn restart_controller(&mut self) -> Result<(), TransportError> {
        self.controller_command("++rst").await?;
        self.address = None;
        self.frames.clear();
        self.initialize().await
    }

    async fn open_link(&self) -> Result<PrologixLink, TransportError> {
        match &self.endpoint {
            Endpoint::Tcp(tcp) => {
                let stream = TcpStream::connect((tcp.host.as_str(), tcp.port))
                    .await
                    .map_err(|e| TransportError::connect(self.resource_key(), e))?;
                stream.set_nodelay(true)?;
                Ok(PrologixLink::Tcp(stream))
            }
            #[cfg(feature = "instrument_serial")]
            Endpoint::Serial(serial) => Ok(PrologixLink::Serial(super::serial::open_port(serial)?)),
            #[cfg(not(feature = "instrument_serial"))]
            Endpoint::Serial(_) => Err(TransportError::FeatureNotEnabled("instrument_serial")),
        }
    }

    /// Put the controller into a known state.
    async fn initialize(&mut self) -> Result<(), TransportError> {
        self.controller_command("++savecfg 0").await?;
        self.controller_command("++auto 0").await?;
        self.controller_command("++mode 1").await?;
        self.controller_command("++ifc").await?;
        let eos = format!("++eos {}", self.terminator.prologix_code());
        self.controller_command(&eos).await?;
        Ok(())
    }

    async fn send_raw(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let link = self.link.as_mut().ok_or(TransportError::NotConnected)?;
        timed("write", self.timeouts.write_timeout, async {
            link.write_all(bytes).await?;
            link.flush().await?;
            Ok(())
        })
        .await
    }

    async fn controller_command(&mut self, command: &str) -> Result<(), TransportError> {
        debug!(interface = %self.name, "-> {}", command);
        let mut line = command.as_bytes().to_vec();
        line.push(b'\n');
        self.send_raw(&line).await
    }

    /// Controller commands that answer with one line (`++eoi`, `++spoll`).
    async fn controller_query(&mut self, command: &str) -> Result<String, TransportError> {
        self.controller_command(command).await?;
        let frame = self.read_link(Terminator::Lf, ReadMode::Terminated).await?;
        let text = String::from_utf8_lossy(&frame).trim().to_string();
        debug!(interface = %self.name, "<- {}", text);
        Ok(text)
    }

    async fn read_link(
        &mut self,
        terminator: Terminator,
        mode: ReadMode,
    ) -> Result<Vec<u8>, TransportError> {
        let link = self.link.as_mut().ok_or(TransportError::NotConnected)?;
        self.frames
            .read_frame_within(link, terminator, mode, self.timeouts.read_timeout)
            .await
    }
}

/// Escape instrument data so the controller forwards it verbatim.
pub(crate) fn escape(data: &[u8]) -> Vec<u8> {
    let mut escaped = Vec::with_capacity(data.len() + 1);
    for &byte in data {
        if matches!(byte, b'\r' | b'\n' | ESC | b'+') {
            escaped.push(ESC);
        }
        escaped.push(byte);
    }
    escaped
}

#[async_trait]
impl Transport for PrologixTransport {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> InterfaceKind {
        match self.endpoint {
            Endpoint::Tcp(_) => InterfaceKind::PrologixGpibTcp,
            Endpoint::Serial(_) => InterfaceKind::PrologixGpibUsb,
        }
    }

    fn resource_key(&self) -> String {
        match &self.endpoint {
            Endpoint::Tcp(tcp) => format!("tcp:{}:{}", tcp.host, tcp.port),
            Endpoint::Serial(serial) => format!("serial:{}", serial.port),
        }
    }

    fn configure(&mut self, options: TimeoutOptions) -> Result<(), TransportError> {
        if self.link.is_some() {
            return Err(TransportError::AlreadyConnected);
        }
        self.timeouts = options;
        Ok(())
    }

    fn timeouts(&self) -> TimeoutOptions {
        self.timeouts
    }

    async fn connect(&mut self) -> Result<(), TransportError> {
        if self.link.is_some() {
            return Ok(());
        }
        let link = timed("connect", self.timeouts.connect_timeout, self.open_link()).await?;
        self.link = Some(link);
        self.frames.clear();
        self.address = None;

        if let Err(e) = self.initialize().await {
            self.link = None;
            return Err(e);
        }
        info!(interface = %self.name, resource = %self.resource_key(), "Prologix GPIB connected");
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        if let Some(mut link) = self.link.take() {
            // Best effort; the peer may already be gone
            let _ = link.shutdown().await;
            debug!(interface = %self.name, "Prologix GPIB disconnected");
        }
        self.address = None;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.link.is_some()
    }

    fn terminator(&self) -> Terminator {
        self.terminator
    }

    async fn set_terminator(&mut self, terminator: Terminator) -> Result<(), TransportError> {
        if self.link.is_some() {
            self.controller_command(&format!("++eos {}", terminator.prologix_code()))
                .await?;
        }
        self.terminator = terminator;
        Ok(())
    }

    async fn write_bytes(&mut self, data: &[u8]) -> Result<(), TransportError> {
        debug!(interface = %self.name, "-> {}", String::from_utf8_lossy(data).trim_end());
        let mut line = escape(data);
        line.push(b'\n');
        self.send_raw(&line).await
    }

    /// The controller appends the `++eos` terminator itself.
    async fn write_string(&mut self, data: &str) -> Result<(), TransportError> {
        self.write_bytes(data.as_bytes()).await
    }

    async fn read(&mut self, mode: ReadMode) -> Result<Vec<u8>, TransportError> {
        self.controller_command("++read eoi").await?;
        let terminator = match self.terminator {
            // Device sends no terminator; the controller ends the reply with LF
            Terminator::None => Terminator::Lf,
            other => other,
        };
        let frame = self.read_link(terminator, mode).await?;
        debug!(interface = %self.name, "<- {}", String::from_utf8_lossy(&frame));
        Ok(frame)
    }
}

#[async_trait]
impl GpibTransport for PrologixTransport {
    fn as_transport(&mut self) -> &mut dyn Transport {
        self
    }

    fn as_transport_ref(&self) -> &dyn Transport {
        self
    }

    async fn set_address(&mut self, address: u8) -> Result<(), TransportError> {
        if self.address != Some(address) {
            self.controller_command(&format!("++addr {}", address)).await?;
            self.address = Some(address);
        }
        Ok(())
    }

    async fn selected_device_clear(&mut self, address: Option<u8>) -> Result<(), TransportError> {
        if let Some(address) = address {
            self.set_address(address).await?;
        }
        self.controller_command("++clr").await
    }

    async fn end_of_instruction(&mut self) -> Result<bool, TransportError> {
        Ok(self.controller_query("++eoi").await? == "1")
    }

    async fn set_end_of_instruction(&mut self, enabled: bool) -> Result<(), TransportError> {
        self.controller_command(&format!("++eoi {}", u8::from(enabled)))
            .await
    }

    async fn end_of_transmission(&mut self) -> Result<EndOfTransmission, TransportError> {
        let enabled = self.controller_query("++eot_enable").await? == "1";
        let text = self.controller_query("++eot_char").await?;
        let character = parse_register(&text)
            .ok_or_else(|| TransportError::MalformedResponse(format!("'{}' is not a character code", text)))?;
        Ok(EndOfTransmission { enabled, character })
    }

    async fn set_end_of_transmission(
        &mut self,
        options: EndOfTransmission,
    ) -> Result<(), TransportError> {
        self.controller_command(&format!("++eot_enable {}", u8::from(options.enabled)))
            .await?;
        self.controller_command(&format!("++eot_char {}", options.character))
            .await
    }

    async fn become_controller_in_charge(&mut self) -> Result<(), TransportError> {
        self.controller_command("++ifc").await
    }

    async fn go_to_local(&mut self, address: u8) -> Result<(), TransportError> {
        self.set_address(address).await?;
        self.controller_command("++loc").await
    }

    /// Interface clear on the bus.
    async fn reset(&mut self) -> Result<(), TransportError> {
        self.controller_command("++ifc").await
    }

    async fn serial_poll(
        &mut self,
        primary: u8,
        secondary: Option<u8>,
    ) -> Result<StatusByte, TransportError> {
        let command = match secondary {
            Some(secondary) => format!("++spoll {} {}", primary, secondary),
            None => format!("++spoll {}", primary),
        };
        let text = self.controller_query(&command).await?;
        parse_register(&text)
            .map(StatusByte::from_bits_retain)
            .ok_or_else(|| TransportError::MalformedResponse(format!("'{}' is not a status byte", text)))
    }

    async fn trigger(&mut self, addresses: &[u8]) -> Result<(), TransportError> {
        if addresses.is_empty() {
            return self.controller_command("++trg").await;
        }
        for group in addresses.chunks(MAX_TRIGGER_ADDRESSES) {
            let list: Vec<String> = group.iter().map(u8::to_string).collect();
            self.controller_command(&format!("++trg {}", list.join(" ")))
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_special_bytes() {
        assert_eq!(escape(b"VOLT 1"), b"VOLT 1".to_vec());
        assert_eq!(
            escape(b"+1\r\n\x1b"),
            vec![ESC, b'+', b'1', ESC, b'\r', ESC, b'\n', ESC, ESC]
        );
    }

    #[test]
    fn test_kind_and_resource_key() {
        let tcp = PrologixTransport::tcp(
            "bench",
            TcpSettings {
                host: "10.0.0.5".into(),
                port: 1234,
            },
        );
        assert_eq!(tcp.kind(), InterfaceKind::PrologixGpibTcp);
        assert_eq!(tcp.resource_key(), "tcp:10.0.0.5:1234");

        let usb = PrologixTransport::usb(
            "bench-usb",
            SerialSettings {
                port: "/dev/ttyUSB0".into(),
                baud_rate: 115200,
            },
        );
        assert_eq!(usb.kind(), InterfaceKind::PrologixGpibUsb);
        assert_eq!(usb.resource_key(), "serial:/dev/ttyUSB0");
    }

    #[tokio::test]
    async fn test_commands_require_connection() {
        let mut transport = PrologixTransport::tcp(
            "bench",
            TcpSettings {
                host: "127.0.0.1".into(),
                port: 1,
            },
        );
        assert!(matches!(
            transport.set_address(5).await,
            Err(TransportError::NotConnected)
        ));
        assert_eq!(transport.current_address(), None);
    }
}
