//! National Instruments GPIB transport
//!
//! Talks to NI-488.2 boards through the VISA runtime (`visa-rs`). Each bus
//! address gets its own VISA session, opened lazily on first use with the
//! resource string `GPIB<board>::<address>::INSTR`. VISA calls block, so they
//! run on Tokio's blocking thread pool.
//!
//! Without the `instrument_visa` feature `connect` returns
//! [`TransportError::FeatureNotEnabled`].

use super::{
    GpibTransport, InterfaceKind, NiGpibSettings, ReadMode, StatusByte, Terminator,
    TimeoutOptions, Transport, TransportError,
};
use async_trait::async_trait;
use tracing::debug;

#[cfg(feature = "instrument_visa")]
use std::collections::HashMap;
#[cfg(feature = "instrument_visa")]
use std::sync::Arc;
#[cfg(feature = "instrument_visa")]
use tokio::sync::Mutex;
#[cfg(feature = "instrument_visa")]
use visa_rs::prelude::*;

/// Default primary address used before `set_address` is called.
const DEFAULT_ADDRESS: u8 = 1;

#[cfg(feature = "instrument_visa")]
struct VisaSessions {
    rm: DefaultRM,
    open: HashMap<u8, Instrument>,
}

/// NI GPIB board transport
pub struct NiGpibTransport {
    name: String,
    board: u8,
    address: u8,
    terminator: Terminator,
    timeouts: TimeoutOptions,
    end_of_instruction: bool,
    #[cfg(feature = "instrument_visa")]
    sessions: Option<Arc<Mutex<VisaSessions>>>,
}

impl NiGpibTransport {
    /// Interface `name` on the board in `settings`.
    pub fn new(name: impl Into<String>, settings: NiGpibSettings) -> Self {
        Self {
            name: name.into(),
            board: settings.address,
            address: DEFAULT_ADDRESS,
            terminator: Terminator::Lf,
            timeouts: TimeoutOptions::default(),
            end_of_instruction: true,
            #[cfg(feature = "instrument_visa")]
            sessions: None,
        }
    }

    /// VISA resource string of the device at `address`
    pub fn resource_string(&self, address: u8) -> String {
        format!("GPIB{}::{}::INSTR", self.board, address)
    }

    /// Run blocking VISA I/O against the session of the current address.
    #[cfg(feature = "instrument_visa")]
    async fn with_session<T, F>(&self, operation: &'static str, f: F) -> Result<T, TransportError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Instrument) -> std::io::Result<T> + Send + 'static,
    {
        let sessions = self.sessions.clone().ok_or(TransportError::NotConnected)?;
        let address = self.address;
        let resource = self.resource_string(address);
        let timeout = match operation {
            "write" => self.timeouts.write_timeout,
            _ => self.timeouts.read_timeout,
        };

        tokio::task::spawn_blocking(move || {
            let mut guard = sessions.blocking_lock();
            let VisaSessions { rm, open } = &mut *guard;
            if !open.contains_key(&address) {
                let id = std::ffi::CString::new(resource.clone())
                    .map_err(|e| TransportError::connect(resource.clone(), e))?;
                let instrument = rm
                    .open(&id.into(), AccessMode::NO_LOCK, timeout)
                    .map_err(|e| TransportError::connect(resource.clone(), e))?;
                open.insert(address, instrument);
            }
            let instrument = open.get_mut(&address).ok_or(TransportError::NotConnected)?;
            f(instrument).map_err(|e| {
                if e.kind() == std::io::ErrorKind::TimedOut {
                    TransportError::Timeout {
                        operation,
                        after: timeout,
                    }
                } else {
                    TransportError::Io(e)
                }
            })
        })
        .await
        .map_err(|e| TransportError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?
    }

    #[cfg(not(feature = "instrument_visa"))]
    async fn with_session<T, F>(&self, _operation: &'static str, _f: F) -> Result<T, TransportError>
    where
        T: Send + 'static,
        F: FnOnce(&mut ()) -> std::io::Result<T> + Send + 'static,
    {
        Err(TransportError::NotConnected)
    }
}

#[cfg(feature = "instrument_visa")]
fn visa_io(err: visa_rs::Error) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::Other, err)
}

#[async_trait]
impl Transport for NiGpibTransport {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> InterfaceKind {
        InterfaceKind::NationalInstrumentsGpib
    }

    fn resource_key(&self) -> String {
        format!("gpib:{}", self.board)
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

    #[cfg(feature = "instrument_visa")]
    async fn connect(&mut self) -> Result<(), TransportError> {
        if self.sessions.is_some() {
            return Ok(());
        }
        let rm = tokio::task::spawn_blocking(DefaultRM::new)
            .await
            .map_err(|e| TransportError::connect(format!("GPIB{}", self.board), e))?
            .map_err(|e| TransportError::connect(format!("GPIB{}", self.board), e))?;
        self.sessions = Some(Arc::new(Mutex::new(VisaSessions {
            rm,
            open: HashMap::new(),
        })));
        debug!(interface = %self.name, "VISA resource manager opened for GPIB{}", self.board);
        Ok(())
    }

    #[cfg(not(feature = "instrument_visa"))]
    async fn connect(&mut self) -> Result<(), TransportError> {
        Err(TransportError::FeatureNotEnabled("instrument_visa"))
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        #[cfg(feature = "instrument_visa")]
        if self.sessions.take().is_some() {
            debug!(interface = %self.name, "VISA sessions closed");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        #[cfg(feature = "instrument_visa")]
        {
            self.sessions.is_some()
        }
        #[cfg(not(feature = "instrument_visa"))]
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

    #[cfg(feature = "instrument_visa")]
    async fn write_bytes(&mut self, data: &[u8]) -> Result<(), TransportError> {
        use std::io::Write;
        let data = data.to_vec();
        debug!(interface = %self.name, address = self.address, "-> {}", String::from_utf8_lossy(&data).trim_end());
        self.with_session("write", move |instrument| instrument.write_all(&data))
            .await
    }

    #[cfg(not(feature = "instrument_visa"))]
    async fn write_bytes(&mut self, _data: &[u8]) -> Result<(), TransportError> {
        Err(TransportError::FeatureNotEnabled("instrument_visa"))
    }

    #[cfg(feature = "instrument_visa")]
    async fn read(&mut self, mode: ReadMode) -> Result<Vec<u8>, TransportError> {
        use std::io::Read;
        let terminator = self.terminator;
        let frame = self
            .with_session("read", move |instrument| match mode {
                ReadMode::Length(len) => {
                    let mut buf = vec![0u8; len];
                    instrument.read_exact(&mut buf)?;
                    Ok(buf)
                }
                ReadMode::Terminated => {
                    // A VISA read completes at END or the termination character
                    let mut buf = vec![0u8; 4096];
                    let n = instrument.read(&mut buf)?;
                    buf.truncate(n);
                    Ok(terminator.strip(&buf).to_vec())
                }
            })
            .await?;
        debug!(interface = %self.name, address = self.address, "<- {}", String::from_utf8_lossy(&frame));
        Ok(frame)
    }

    #[cfg(not(feature = "instrument_visa"))]
    async fn read(&mut self, _mode: ReadMode) -> Result<Vec<u8>, TransportError> {
        Err(TransportError::FeatureNotEnabled("instrument_visa"))
    }
}

#[async_trait]
impl GpibTransport for NiGpibTransport {
    fn as_transport(&mut self) -> &mut dyn Transport {
        self
    }

    fn as_transport_ref(&self) -> &dyn Transport {
        self
    }

    async fn set_address(&mut self, address: u8) -> Result<(), TransportError> {
        self.address = address;
        Ok(())
    }

    #[cfg(feature = "instrument_visa")]
    async fn selected_device_clear(&mut self, address: Option<u8>) -> Result<(), TransportError> {
        if let Some(address) = address {
            self.address = address;
        }
        self.with_session("clear", |instrument| instrument.clear().map_err(visa_io))
            .await
    }

    #[cfg(not(feature = "instrument_visa"))]
    async fn selected_device_clear(&mut self, _address: Option<u8>) -> Result<(), TransportError> {
        self.with_session("clear", |_| Ok(())).await
    }

    async fn end_of_instruction(&mut self) -> Result<bool, TransportError> {
        Ok(self.end_of_instruction)
    }

    async fn set_end_of_instruction(&mut self, enabled: bool) -> Result<(), TransportError> {
        self.end_of_instruction = enabled;
        Ok(())
    }

    #[cfg(feature = "instrument_visa")]
    async fn serial_poll(
        &mut self,
        primary: u8,
        _secondary: Option<u8>,
    ) -> Result<StatusByte, TransportError> {
        self.address = primary;
        let stb = self
            .with_session("serial poll", |instrument| instrument.read_stb().map_err(visa_io))
            .await?;
        Ok(StatusByte::from_bits_retain((stb & 0xff) as u8))
    }

    #[cfg(not(feature = "instrument_visa"))]
    async fn serial_poll(
        &mut self,
        _primary: u8,
        _secondary: Option<u8>,
    ) -> Result<StatusByte, TransportError> {
        self.with_session("serial poll", |_| Ok(StatusByte::empty())).await
    }

    async fn read_status_byte(&mut self) -> Result<StatusByte, TransportError> {
        let address = self.address;
        self.serial_poll(address, None).await
    }

    /// `*TRG` to each address in turn.
    async fn trigger(&mut self, addresses: &[u8]) -> Result<(), TransportError> {
        let previous = self.address;
        for &address in addresses {
            self.address = address;
            self.write_string("*TRG").await?;
        }
        self.address = previous;
        Ok(())
    }
}
