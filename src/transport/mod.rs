//! Transport abstraction over physical instrument links.
//!
//! Every link implements [`Transport`]: connect/disconnect, raw and typed
//! writes, terminator-aware reads. Links that drive an IEEE-488 bus also
//! implement [`GpibTransport`], which adds addressing, device clear, triggers
//! and the IEEE-488.2 status register operations.
//!
//! Callers never probe for GPIB support per call. An [`InterfaceHandle`] is
//! either a `Gpib` or a `Stream` handle, decided when the interface is built,
//! and the executor checks which one it holds when it binds a plan.
//!
//! ## Variants
//!
//! - [`EmulatedTransport`]: canned or echoed responses, no physical I/O
//! - [`SerialTransport`]: generic serial port (`instrument_serial` feature)
//! - [`PrologixTransport`]: Prologix GPIB controller over TCP or USB serial
//! - [`NiGpibTransport`]: National Instruments GPIB via VISA (`instrument_visa` feature)
//!
//! A transport instance is not reentrant; all I/O takes `&mut self` and shared
//! use goes through the [`InterfaceManager`], which wraps each interface in a
//! `tokio::sync::Mutex`.

mod emulated;
mod error;
mod framing;
mod manager;
mod ni_gpib;
mod prologix;
mod serial;
mod status;
mod terminator;

pub use emulated::{EmulatedTransport, Responder};
pub use error::TransportError;
pub use framing::{FrameBuffer, ReadMode};
pub use manager::{build_interface, InterfaceManager, SharedInterface};
pub use ni_gpib::NiGpibTransport;
pub use prologix::{PrologixLink, PrologixTransport, MAX_TRIGGER_ADDRESSES};
pub use serial::SerialTransport;
pub use status::{EventStatus, StatusByte};
pub use terminator::Terminator;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Default TCP port of a Prologix GPIB-ETHERNET controller.
pub const PROLOGIX_TCP_PORT: u16 = 1234;

/// The communication interface types a configuration record may name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InterfaceKind {
    /// NI-488.2 board through VISA.
    #[serde(rename = "National Instruments GPIB")]
    NationalInstrumentsGpib,
    /// Plain serial port.
    #[serde(rename = "Serial Port")]
    SerialPort,
    /// Prologix GPIB-ETHERNET controller.
    #[serde(rename = "Prologix GPIB TCP")]
    PrologixGpibTcp,
    /// Prologix GPIB-USB controller.
    #[serde(rename = "Prologix GPIB USB")]
    PrologixGpibUsb,
    /// In-process stand-in.
    #[serde(rename = "Emulated")]
    Emulated,
}

impl InterfaceKind {
    /// Whether interfaces of this kind drive an IEEE-488 bus.
    pub fn is_gpib(self) -> bool {
        matches!(
            self,
            InterfaceKind::NationalInstrumentsGpib
                | InterfaceKind::PrologixGpibTcp
                | InterfaceKind::PrologixGpibUsb
                | InterfaceKind::Emulated
        )
    }
}

impl fmt::Display for InterfaceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InterfaceKind::NationalInstrumentsGpib => "National Instruments GPIB",
            InterfaceKind::SerialPort => "Serial Port",
            InterfaceKind::PrologixGpibTcp => "Prologix GPIB TCP",
            InterfaceKind::PrologixGpibUsb => "Prologix GPIB USB",
            InterfaceKind::Emulated => "Emulated",
        };
        f.write_str(name)
    }
}

/// Per-operation timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeoutOptions {
    /// Budget for opening the link.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Budget for one read.
    #[serde(with = "humantime_serde")]
    pub read_timeout: Duration,
    /// Budget for one write.
    #[serde(with = "humantime_serde")]
    pub write_timeout: Duration,
}

impl Default for TimeoutOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(2),
            write_timeout: Duration::from_secs(2),
        }
    }
}

/// GPIB end-of-transmission setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EndOfTransmission {
    /// Append `character` when set.
    pub enabled: bool,
    /// Byte appended to writes.
    pub character: u8,
}

/// Character encodings accepted for string writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TextEncoding {
    /// UTF-8.
    #[default]
    Utf8,
    /// 7-bit ASCII.
    Ascii,
    /// ISO 8859-1.
    Latin1,
}

/// A value written at an exact binary width.
///
/// Numbers are encoded big-endian (network order), as instruments with binary
/// block commands expect.
#[derive(Debug, Clone, PartialEq)]
pub enum TypedValue {
    /// Signed 8-bit.
    I8(i8),
    /// Unsigned 8-bit.
    U8(u8),
    /// Signed 16-bit.
    I16(i16),
    /// Unsigned 16-bit.
    U16(u16),
    /// Signed 32-bit.
    I32(i32),
    /// Unsigned 32-bit.
    U32(u32),
    /// Signed 64-bit.
    I64(i64),
    /// Unsigned 64-bit.
    U64(u64),
    /// 32-bit float.
    F32(f32),
    /// 64-bit float.
    F64(f64),
    /// Text in the given encoding.
    Text(String, TextEncoding),
}

impl TypedValue {
    /// Bytes to put on the wire.
    pub fn encode(&self) -> Result<Vec<u8>, TransportError> {
        let bytes = match self {
            TypedValue::I8(v) => v.to_be_bytes().to_vec(),
            TypedValue::U8(v) => v.to_be_bytes().to_vec(),
            TypedValue::I16(v) => v.to_be_bytes().to_vec(),
            TypedValue::U16(v) => v.to_be_bytes().to_vec(),
            TypedValue::I32(v) => v.to_be_bytes().to_vec(),
            TypedValue::U32(v) => v.to_be_bytes().to_vec(),
            TypedValue::I64(v) => v.to_be_bytes().to_vec(),
            TypedValue::U64(v) => v.to_be_bytes().to_vec(),
            TypedValue::F32(v) => v.to_be_bytes().to_vec(),
            TypedValue::F64(v) => v.to_be_bytes().to_vec(),
            TypedValue::Text(text, TextEncoding::Utf8) => text.as_bytes().to_vec(),
            TypedValue::Text(text, TextEncoding::Ascii) => {
                if !text.is_ascii() {
                    return Err(TransportError::Encoding(format!(
                        "'{}' cannot be encoded as ASCII",
                        text
                    )));
                }
                text.as_bytes().to_vec()
            }
            TypedValue::Text(text, TextEncoding::Latin1) => text
                .chars()
                .map(|c| u8::try_from(u32::from(c)))
                .collect::<Result<Vec<u8>, _>>()
                .map_err(|_| {
                    TransportError::Encoding(format!(
                        "'{}' cannot be encoded as Latin-1",
                        text
                    ))
                })?,
        };
        Ok(bytes)
    }
}

/// Base capability set shared by every link.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Interface name from its configuration record.
    fn name(&self) -> &str;

    /// Interface type.
    fn kind(&self) -> InterfaceKind;

    /// Identifies the physical link; two interfaces with the same key cannot
    /// be connected at the same time.
    fn resource_key(&self) -> String;

    /// Apply timeouts. Rejected with [`TransportError::AlreadyConnected`]
    /// while connected.
    fn configure(&mut self, options: TimeoutOptions) -> Result<(), TransportError>;

    /// Timeouts in effect.
    fn timeouts(&self) -> TimeoutOptions;

    /// Open the link. Idempotent.
    async fn connect(&mut self) -> Result<(), TransportError>;

    /// Close the link. Idempotent.
    async fn disconnect(&mut self) -> Result<(), TransportError>;

    /// Whether the link is open.
    fn is_connected(&self) -> bool;

    /// Terminator appended by `write_string`.
    fn terminator(&self) -> Terminator;

    /// Change the terminator, on the controller too where it has one.
    async fn set_terminator(&mut self, terminator: Terminator) -> Result<(), TransportError>;

    /// Write raw bytes; no terminator is appended.
    async fn write_bytes(&mut self, data: &[u8]) -> Result<(), TransportError>;

    /// Read one response, terminator stripped.
    async fn read(&mut self, mode: ReadMode) -> Result<Vec<u8>, TransportError>;

    /// Write a value at its exact binary width.
    async fn write_typed(&mut self, value: TypedValue) -> Result<(), TransportError> {
        let bytes = value.encode()?;
        self.write_bytes(&bytes).await
    }

    /// Write `data` followed by the end-of-string terminator.
    async fn write_string(&mut self, data: &str) -> Result<(), TransportError> {
        let mut bytes = data.as_bytes().to_vec();
        bytes.extend_from_slice(self.terminator().as_bytes());
        self.write_bytes(&bytes).await
    }

    /// Read one terminated response as text.
    async fn read_string(&mut self) -> Result<String, TransportError> {
        let bytes = self.read(ReadMode::Terminated).await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Write `data`, then read the reply.
    async fn query_string(&mut self, data: &str) -> Result<String, TransportError> {
        self.write_string(data).await?;
        self.read_string().await
    }
}

/// Operations available on links that control an IEEE-488 bus.
///
/// Optional controller features default to [`TransportError::Unsupported`].
#[async_trait]
pub trait GpibTransport: Transport {
    /// View this link through its base capability set.
    fn as_transport(&mut self) -> &mut dyn Transport;

    /// Shared view of this link through its base capability set.
    fn as_transport_ref(&self) -> &dyn Transport;

    /// Primary address subsequent I/O is directed at.
    async fn set_address(&mut self, address: u8) -> Result<(), TransportError>;

    /// Selected device clear of `address`, or of the current address.
    async fn selected_device_clear(&mut self, address: Option<u8>) -> Result<(), TransportError>;

    /// Whether EOI is asserted with the last byte of writes.
    async fn end_of_instruction(&mut self) -> Result<bool, TransportError>;

    /// Assert EOI with the last byte of writes.
    async fn set_end_of_instruction(&mut self, enabled: bool) -> Result<(), TransportError>;

    /// End-of-transmission character setting.
    async fn end_of_transmission(&mut self) -> Result<EndOfTransmission, TransportError> {
        Err(TransportError::Unsupported("end_of_transmission"))
    }

    /// Change the end-of-transmission character setting.
    async fn set_end_of_transmission(
        &mut self,
        _options: EndOfTransmission,
    ) -> Result<(), TransportError> {
        Err(TransportError::Unsupported("set_end_of_transmission"))
    }

    /// Take control of the bus.
    async fn become_controller_in_charge(&mut self) -> Result<(), TransportError> {
        Err(TransportError::Unsupported("become_controller_in_charge"))
    }

    /// Put `address` into remote state.
    async fn go_to_remote(&mut self, _address: u8) -> Result<(), TransportError> {
        Err(TransportError::Unsupported("go_to_remote"))
    }

    /// Return `address` to local control.
    async fn go_to_local(&mut self, _address: u8) -> Result<(), TransportError> {
        Err(TransportError::Unsupported("go_to_local"))
    }

    /// Whether the controller is in listen-only mode.
    async fn listen_only(&mut self) -> Result<bool, TransportError> {
        Err(TransportError::Unsupported("listen_only"))
    }

    /// Enter or leave listen-only mode.
    async fn set_listen_only(&mut self, _enabled: bool) -> Result<(), TransportError> {
        Err(TransportError::Unsupported("set_listen_only"))
    }

    /// Interface clear / controller reset.
    async fn reset(&mut self) -> Result<(), TransportError> {
        Err(TransportError::Unsupported("reset"))
    }

    /// Serial poll the device at `primary`/`secondary`.
    async fn serial_poll(
        &mut self,
        primary: u8,
        secondary: Option<u8>,
    ) -> Result<StatusByte, TransportError>;

    /// Status byte of the current device.
    async fn read_status_byte(&mut self) -> Result<StatusByte, TransportError> {
        Err(TransportError::Unsupported("read_status_byte"))
    }

    /// `*CLS`
    async fn clear_status(&mut self) -> Result<(), TransportError> {
        self.write_string("*CLS").await
    }

    /// `*ESR?`
    async fn read_event_status_register(&mut self) -> Result<EventStatus, TransportError> {
        let text = self.query_string("*ESR?").await?;
        parse_event_status(&text)
    }

    /// `*ESE?`
    async fn event_status_enable(&mut self) -> Result<EventStatus, TransportError> {
        let text = self.query_string("*ESE?").await?;
        parse_event_status(&text)
    }

    /// `*ESE n`
    async fn set_event_status_enable(&mut self, mask: EventStatus) -> Result<(), TransportError> {
        self.write_string(&format!("*ESE {}", mask.bits())).await
    }

    /// `*ESE 0`
    async fn clear_event_status_enable(&mut self) -> Result<(), TransportError> {
        self.write_string("*ESE 0").await
    }

    /// Group execute trigger to one or more addresses.
    async fn trigger(&mut self, addresses: &[u8]) -> Result<(), TransportError>;
}

/// Run one link operation under its per-operation timeout.
pub(crate) async fn timed<T, F>(
    operation: &'static str,
    after: Duration,
    fut: F,
) -> Result<T, TransportError>
where
    F: std::future::Future<Output = Result<T, TransportError>>,
{
    match tokio::time::timeout(after, fut).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::Timeout { operation, after }),
    }
}

fn parse_event_status(text: &str) -> Result<EventStatus, TransportError> {
    status::parse_register(text)
        .map(EventStatus::from_bits_retain)
        .ok_or_else(|| TransportError::MalformedResponse(format!("'{}' is not a register value", text.trim())))
}

/// A built interface, typed by whether it can drive a GPIB bus.
pub enum InterfaceHandle {
    /// Drives an IEEE-488 bus.
    Gpib(Box<dyn GpibTransport>),
    /// Plain byte stream.
    Stream(Box<dyn Transport>),
}

impl InterfaceHandle {
    /// The transport view.
    pub fn transport(&self) -> &dyn Transport {
        match self {
            InterfaceHandle::Gpib(t) => t.as_transport_ref(),
            InterfaceHandle::Stream(t) => t.as_ref(),
        }
    }

    /// The mutable transport view.
    pub fn transport_mut(&mut self) -> &mut dyn Transport {
        match self {
            InterfaceHandle::Gpib(t) => t.as_transport(),
            InterfaceHandle::Stream(t) => t.as_mut(),
        }
    }

    /// The GPIB view, when this interface has one.
    pub fn gpib_mut(&mut self) -> Option<&mut (dyn GpibTransport + 'static)> {
        match self {
            InterfaceHandle::Gpib(t) => Some(t.as_mut()),
            InterfaceHandle::Stream(_) => None,
        }
    }

    /// Whether the interface drives a GPIB bus.
    pub fn is_gpib(&self) -> bool {
        matches!(self, InterfaceHandle::Gpib(_))
    }

    /// Interface name.
    pub fn name(&self) -> &str {
        self.transport().name()
    }
}

impl fmt::Debug for InterfaceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let variant = if self.is_gpib() { "Gpib" } else { "Stream" };
        f.debug_struct("InterfaceHandle")
            .field("variant", &variant)
            .field("name", &self.name())
            .field("kind", &self.transport().kind())
            .finish()
    }
}

// ============================================================================
// Communication-interface configuration records
// ============================================================================

/// Configuration record of one communication interface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterfaceConfig {
    /// Unique interface name.
    pub name: String,
    /// Interface type.
    #[serde(rename = "type")]
    pub kind: InterfaceKind,
    /// Settings of `National Instruments GPIB` interfaces.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub national_instruments_gpib: Option<NiGpibSettings>,
    /// Settings of `Prologix GPIB TCP` interfaces.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp: Option<TcpSettings>,
    /// Settings of `Serial Port` and `Prologix GPIB USB` interfaces.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial: Option<SerialSettings>,
    /// Controller's own bus address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpib: Option<GpibSettings>,
    /// Settings of `Emulated` interfaces.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emulated: Option<EmulatedSettings>,
    /// Line terminator; the driver default applies when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminator: Option<Terminator>,
    /// Overrides the engine-wide timeouts for this interface.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeouts: Option<TimeoutOptions>,
}

impl InterfaceConfig {
    /// Emulated interface record, mostly useful in tests.
    pub fn emulated(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: InterfaceKind::Emulated,
            national_instruments_gpib: None,
            tcp: None,
            serial: None,
            gpib: None,
            emulated: None,
            terminator: None,
            timeouts: None,
        }
    }
}

/// NI GPIB board selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NiGpibSettings {
    /// GPIB board index (`GPIB<board>::...`).
    #[serde(alias = "board")]
    pub address: u8,
}

/// Prologix TCP endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpSettings {
    /// Host name or address.
    pub host: String,
    /// Port, 1234 by default.
    #[serde(default = "default_prologix_port")]
    pub port: u16,
}

/// Serial port selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerialSettings {
    /// Device path, e.g. `/dev/ttyUSB0` or `COM3`.
    pub port: String,
    /// Baud rate.
    #[serde(default = "default_baud_rate", alias = "baud_rate")]
    pub baud_rate: u32,
}

/// Controller bus address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpibSettings {
    /// Primary address, 0 to 30.
    pub address: u8,
}

/// How an emulated interface answers reads.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmulatedSettings {
    /// Echo the last written command back.
    #[serde(default)]
    pub echo: bool,
    /// Answer every read with this text.
    #[serde(default, alias = "fixed_response")]
    pub fixed_response: Option<String>,
}

fn default_prologix_port() -> u16 {
    PROLOGIX_TCP_PORT
}

fn default_baud_rate() -> u32 {
    9600
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_writes_are_big_endian_at_exact_width() {
        assert_eq!(TypedValue::I16(-2).encode().unwrap(), vec![0xff, 0xfe]);
        assert_eq!(TypedValue::U32(1).encode().unwrap(), vec![0, 0, 0, 1]);
        assert_eq!(TypedValue::U64(0x0102).encode().unwrap().len(), 8);
        assert_eq!(
            TypedValue::F32(1.0).encode().unwrap(),
            vec![0x3f, 0x80, 0x00, 0x00]
        );
        assert_eq!(TypedValue::F64(0.0).encode().unwrap(), vec![0; 8]);
    }

    #[test]
    fn test_text_encodings() {
        let latin = TypedValue::Text("µV".into(), TextEncoding::Latin1);
        assert_eq!(latin.encode().unwrap(), vec![0xb5, b'V']);
        let err = TypedValue::Text("µV".into(), TextEncoding::Ascii).encode().unwrap_err();
        assert!(matches!(err, TransportError::Encoding(_)));
        assert!(!err.is_retryable());
        let err = TypedValue::Text("Ω".into(), TextEncoding::Latin1).encode().unwrap_err();
        assert!(matches!(err, TransportError::Encoding(_)));
        assert_eq!(
            TypedValue::Text("µ".into(), TextEncoding::Utf8).encode().unwrap(),
            vec![0xc2, 0xb5]
        );
    }

    #[test]
    fn test_interface_record_json_shape() {
        let json = r#"{
            "name": "bench",
            "type": "Prologix GPIB USB",
            "serial": { "port": "/dev/ttyUSB0", "baudRate": 115200 },
            "gpib": { "address": 0 }
        }"#;
        let record: InterfaceConfig = serde_json::from_str(json).unwrap();
        assert_eq!(record.kind, InterfaceKind::PrologixGpibUsb);
        assert_eq!(record.serial.unwrap().baud_rate, 115200);
        assert_eq!(record.kind.to_string(), "Prologix GPIB USB");
    }

    #[test]
    fn test_tcp_port_defaults_to_prologix() {
        let tcp: TcpSettings = serde_json::from_str(r#"{ "host": "10.0.0.5" }"#).unwrap();
        assert_eq!(tcp.port, 1234);
    }
}
