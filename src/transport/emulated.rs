//! Emulated transport for offline procedure development and tests
//!
//! No physical I/O happens. Writes are recorded, reads are answered by a
//! [`Responder`], and the IEEE-488.2 registers are plain values so status
//! operations behave like a well-mannered instrument. It provides:
//! - Echo, fixed, scripted and random responses
//! - Read timeout injection
//! - Call logging for test verification
//!
//! The transport is `Clone`; clones share state, so a test can keep one
//! handle while another is owned by an [`InterfaceManager`](super::InterfaceManager).

use super::{
    EndOfTransmission, EventStatus, GpibTransport, InterfaceKind, ReadMode, StatusByte,
    Terminator, TimeoutOptions, Transport, TransportError,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tracing::debug;

/// How an emulated device answers.
#[derive(Debug, Clone, PartialEq)]
pub enum Responder {
    /// Return the last written command.
    Echo,
    /// Return the same text for every read.
    Fixed(String),
    /// Look the last written command up; unknown commands get `fallback`.
    Scripted {
        responses: HashMap<String, String>,
        fallback: Option<String>,
    },
    /// A random reading between 0 and 100.
    Random,
}

impl Responder {
    /// Answer each listed command with its reply.
    pub fn scripted<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Responder::Scripted {
            responses: pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
            fallback: None,
        }
    }

    fn respond(&self, last_command: Option<&str>) -> Option<String> {
        match self {
            Responder::Echo => last_command.map(str::to_string),
            Responder::Fixed(text) => Some(text.clone()),
            Responder::Scripted {
                responses,
                fallback,
            } => last_command
                .and_then(|cmd| responses.get(cmd).cloned())
                .or_else(|| fallback.clone()),
            Responder::Random => Some(rand::thread_rng().gen_range(0.0..100.0f64).to_string()),
        }
    }
}

#[derive(Debug, Default)]
struct DeviceState {
    connected: bool,
    terminator: Terminator,
    timeouts: TimeoutOptions,
    address: Option<u8>,
    last_command: Option<String>,
    status_byte: StatusByte,
    event_status: EventStatus,
    event_status_enable: EventStatus,
    end_of_instruction: bool,
    end_of_transmission: EndOfTransmission,
    listen_only: bool,
}

/// Emulated communication interface
#[derive(Clone)]
pub struct EmulatedTransport {
    name: String,
    responder: Arc<Mutex<Responder>>,
    state: Arc<Mutex<DeviceState>>,
    failing_reads: Arc<AtomicU32>,
    fail_next_connect: Arc<AtomicBool>,
    call_log: Arc<Mutex<Vec<String>>>,
}

impl EmulatedTransport {
    /// Create an emulated interface answering with random readings
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_responder(name, Responder::Random)
    }

    /// Create an emulated interface answering with `responder`
    pub fn with_responder(name: impl Into<String>, responder: Responder) -> Self {
        Self {
            name: name.into(),
            responder: Arc::new(Mutex::new(responder)),
            state: Arc::new(Mutex::new(DeviceState {
                end_of_instruction: true,
                ..DeviceState::default()
            })),
            failing_reads: Arc::new(AtomicU32::new(0)),
            fail_next_connect: Arc::new(AtomicBool::new(false)),
            call_log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Set the terminator reads report
    pub fn with_terminator(self, terminator: Terminator) -> Self {
        self.state.lock().terminator = terminator;
        self
    }

    /// Swap the responder
    pub fn set_responder(&self, responder: Responder) {
        *self.responder.lock() = responder;
    }

    /// The next `count` reads time out
    pub fn fail_next_reads(&self, count: u32) {
        self.failing_reads.store(count, Ordering::SeqCst);
    }

    /// The next connect attempt fails
    pub fn fail_next_connect(&self) {
        self.fail_next_connect.store(true, Ordering::SeqCst);
    }

    /// Status byte the next serial poll returns
    pub fn set_status_byte(&self, value: StatusByte) {
        self.state.lock().status_byte = value;
    }

    /// Register value `*ESR?` returns
    pub fn set_event_status(&self, value: EventStatus) {
        self.state.lock().event_status = value;
    }

    /// Currently addressed device
    pub fn address(&self) -> Option<u8> {
        self.state.lock().address
    }

    /// Get the call log
    pub fn call_log(&self) -> Vec<String> {
        self.call_log.lock().clone()
    }

    /// Clear the call log
    pub fn clear_log(&self) {
        self.call_log.lock().clear();
    }

    fn log_call(&self, call: String) {
        debug!(interface = %self.name, "{}", call);
        self.call_log.lock().push(call);
    }

    fn ensure_connected(&self) -> Result<(), TransportError> {
        if self.state.lock().connected {
            Ok(())
        } else {
            Err(TransportError::NotConnected)
        }
    }
}

#[async_trait]
impl Transport for EmulatedTransport {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> InterfaceKind {
        InterfaceKind::Emulated
    }

    fn resource_key(&self) -> String {
        format!("emulated:{}", self.name)
    }

    fn configure(&mut self, options: TimeoutOptions) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if state.connected {
            return Err(TransportError::AlreadyConnected);
        }
        state.timeouts = options;
        Ok(())
    }

    fn timeouts(&self) -> TimeoutOptions {
        self.state.lock().timeouts
    }

    async fn connect(&mut self) -> Result<(), TransportError> {
        self.log_call("connect".to_string());
        if self.fail_next_connect.swap(false, Ordering::SeqCst) {
            return Err(TransportError::connect(self.resource_key(), "injected failure"));
        }
        self.state.lock().connected = true;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        self.log_call("disconnect".to_string());
        self.state.lock().connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    fn terminator(&self) -> Terminator {
        self.state.lock().terminator
    }

    async fn set_terminator(&mut self, terminator: Terminator) -> Result<(), TransportError> {
        self.log_call(format!("terminator: {}", terminator));
        self.state.lock().terminator = terminator;
        Ok(())
    }

    async fn write_bytes(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.ensure_connected()?;
        let mut state = self.state.lock();
        let text = String::from_utf8_lossy(state.terminator.strip(data)).into_owned();
        state.last_command = Some(text.clone());
        drop(state);
        self.log_call(format!("write: {}", text));
        Ok(())
    }

    async fn read(&mut self, mode: ReadMode) -> Result<Vec<u8>, TransportError> {
        self.ensure_connected()?;
        let timeout = self.timeouts().read_timeout;

        let injected = self
            .failing_reads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            self.log_call("read: timeout".to_string());
            return Err(TransportError::Timeout {
                operation: "read",
                after: timeout,
            });
        }

        let last_command = self.state.lock().last_command.clone();
        let response = self.responder.lock().respond(last_command.as_deref());
        let Some(response) = response else {
            self.log_call("read: no response".to_string());
            return Err(TransportError::Timeout {
                operation: "read",
                after: timeout,
            });
        };

        self.log_call(format!("read: {}", response));
        let mut bytes = response.into_bytes();
        if let ReadMode::Length(len) = mode {
            bytes.truncate(len);
        }
        Ok(bytes)
    }
}

#[async_trait]
impl GpibTransport for EmulatedTransport {
    fn as_transport(&mut self) -> &mut dyn Transport {
        self
    }

    fn as_transport_ref(&self) -> &dyn Transport {
        self
    }

    async fn set_address(&mut self, address: u8) -> Result<(), TransportError> {
        self.state.lock().address = Some(address);
        self.log_call(format!("address: {}", address));
        Ok(())
    }

    async fn selected_device_clear(&mut self, address: Option<u8>) -> Result<(), TransportError> {
        self.ensure_connected()?;
        if let Some(address) = address {
            self.state.lock().address = Some(address);
        }
        self.state.lock().last_command = None;
        self.log_call(format!("device clear: {:?}", address));
        Ok(())
    }

    async fn end_of_instruction(&mut self) -> Result<bool, TransportError> {
        Ok(self.state.lock().end_of_instruction)
    }

    async fn set_end_of_instruction(&mut self, enabled: bool) -> Result<(), TransportError> {
        self.state.lock().end_of_instruction = enabled;
        Ok(())
    }

    async fn end_of_transmission(&mut self) -> Result<EndOfTransmission, TransportError> {
        Ok(self.state.lock().end_of_transmission)
    }

    async fn set_end_of_transmission(
        &mut self,
        options: EndOfTransmission,
    ) -> Result<(), TransportError> {
        self.state.lock().end_of_transmission = options;
        Ok(())
    }

    async fn become_controller_in_charge(&mut self) -> Result<(), TransportError> {
        self.log_call("controller in charge".to_string());
        Ok(())
    }

    async fn go_to_remote(&mut self, address: u8) -> Result<(), TransportError> {
        self.log_call(format!("remote: {}", address));
        Ok(())
    }

    async fn go_to_local(&mut self, address: u8) -> Result<(), TransportError> {
        self.log_call(format!("local: {}", address));
        Ok(())
    }

    async fn listen_only(&mut self) -> Result<bool, TransportError> {
        Ok(self.state.lock().listen_only)
    }

    async fn set_listen_only(&mut self, enabled: bool) -> Result<(), TransportError> {
        self.state.lock().listen_only = enabled;
        Ok(())
    }

    async fn reset(&mut self) -> Result<(), TransportError> {
        self.ensure_connected()?;
        self.log_call("interface reset".to_string());
        let mut state = self.state.lock();
        state.last_command = None;
        state.status_byte = StatusByte::empty();
        Ok(())
    }

    async fn serial_poll(
        &mut self,
        primary: u8,
        secondary: Option<u8>,
    ) -> Result<StatusByte, TransportError> {
        self.ensure_connected()?;
        self.log_call(format!("serial poll: {} {:?}", primary, secondary));
        Ok(self.state.lock().status_byte)
    }

    async fn read_status_byte(&mut self) -> Result<StatusByte, TransportError> {
        self.ensure_connected()?;
        Ok(self.state.lock().status_byte)
    }

    async fn clear_status(&mut self) -> Result<(), TransportError> {
        self.ensure_connected()?;
        self.log_call("*CLS".to_string());
        let mut state = self.state.lock();
        state.event_status = EventStatus::empty();
        state.status_byte.remove(StatusByte::EVENT_SUMMARY);
        Ok(())
    }

    /// Reading the register clears it, as `*ESR?` does on a real device.
    async fn read_event_status_register(&mut self) -> Result<EventStatus, TransportError> {
        self.ensure_connected()?;
        let mut state = self.state.lock();
        Ok(std::mem::take(&mut state.event_status))
    }

    async fn event_status_enable(&mut self) -> Result<EventStatus, TransportError> {
        self.ensure_connected()?;
        Ok(self.state.lock().event_status_enable)
    }

    async fn set_event_status_enable(&mut self, mask: EventStatus) -> Result<(), TransportError> {
        self.ensure_connected()?;
        self.log_call(format!("*ESE {}", mask.bits()));
        self.state.lock().event_status_enable = mask;
        Ok(())
    }

    async fn clear_event_status_enable(&mut self) -> Result<(), TransportError> {
        self.set_event_status_enable(EventStatus::empty()).await
    }

    async fn trigger(&mut self, addresses: &[u8]) -> Result<(), TransportError> {
        self.ensure_connected()?;
        self.log_call(format!("trigger: {:?}", addresses));
        Ok(())
    }
}
