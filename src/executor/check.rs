//! Instrument error checks run after a sequence.
//!
//! `gpib4882` serial polls the device for a service request and reads the
//! standard event status register. `scpi` drains the `SYST:ERR?` queue.

use super::SequenceExecutor;
use crate::error::{AppResult, CalError};
use crate::transport::{EventStatus, ReadMode, StatusByte, TransportError};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Entries read from an error queue before giving up on it emptying.
pub const MAX_QUEUED_ERRORS: usize = 32;

/// How an error check asks the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCheckKind {
    /// Drain the `SYST:ERR?` queue.
    #[default]
    Scpi,
    /// Serial poll for SRQ, then read `*ESR?`.
    Gpib4882,
}

/// What one error check found. An empty `errors` list means the device is clean.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorCheckReport {
    /// Device that was checked.
    pub unit_id: String,
    /// How it was checked.
    pub kind: ErrorCheckKind,
    /// Errors found, oldest first.
    pub errors: Vec<String>,
}

impl ErrorCheckReport {
    /// Whether the device reported nothing.
    pub fn passed(&self) -> bool {
        self.errors.is_empty()
    }
}

impl SequenceExecutor {
    /// Ask `unit_id` for pending errors.
    pub async fn check_errors(&self, unit_id: &str, kind: ErrorCheckKind) -> AppResult<ErrorCheckReport> {
        let device = self
            .devices
            .get(unit_id)
            .ok_or_else(|| CalError::UnknownUnit(unit_id.to_string()))?;
        if !self.interfaces.contains(&device.interface) {
            return Err(CalError::UnknownInterface(device.interface.clone()));
        }

        let mut handle = self.interfaces.lease(&device.interface).await?;
        let mut errors = Vec::new();
        match kind {
            ErrorCheckKind::Gpib4882 => {
                let gpib = handle
                    .gpib_mut()
                    .ok_or(TransportError::Unsupported("serial_poll"))?;
                let address = device.gpib_address.ok_or(TransportError::NotConfigured)?;
                let status = gpib.serial_poll(address, None).await?;
                if status.contains(StatusByte::REQUESTING_SERVICE) {
                    errors.push("SRQ".to_string());
                }
                gpib.set_address(address).await?;
                let esr = gpib.read_event_status_register().await?;
                errors.extend(event_status_errors(esr));
            }
            ErrorCheckKind::Scpi => {
                if let (Some(address), Some(gpib)) = (device.gpib_address, handle.gpib_mut()) {
                    gpib.set_address(address).await?;
                }
                let transport = handle.transport_mut();
                for _ in 0..MAX_QUEUED_ERRORS {
                    transport.write_string("SYST:ERR?").await?;
                    let raw = transport.read(ReadMode::Terminated).await?;
                    let entry = String::from_utf8_lossy(&raw).trim().to_string();
                    if queue_entry_code(&entry)? == 0 {
                        break;
                    }
                    errors.push(entry);
                }
            }
        }

        if errors.is_empty() {
            debug!(unit = %unit_id, "No instrument errors");
        } else {
            warn!(unit = %unit_id, errors = ?errors, "Instrument reported errors");
        }
        Ok(ErrorCheckReport {
            unit_id: unit_id.to_string(),
            kind,
            errors,
        })
    }
}

fn event_status_errors(esr: EventStatus) -> impl Iterator<Item = String> {
    [
        (EventStatus::QUERY_ERROR, "Query error"),
        (EventStatus::DEVICE_SPECIFIC_ERROR, "Device specific error"),
        (EventStatus::EXECUTION_ERROR, "Execution error"),
        (EventStatus::COMMAND_ERROR, "Command error"),
    ]
    .into_iter()
    .filter(move |(flag, _)| esr.contains(*flag))
    .map(|(_, text)| text.to_string())
}

/// `-113,"Undefined header"` -> `-113`
fn queue_entry_code(entry: &str) -> Result<i32, TransportError> {
    entry
        .split(',')
        .next()
        .map(|code| code.trim().trim_start_matches('+'))
        .and_then(|code| code.parse().ok())
        .ok_or_else(|| TransportError::MalformedResponse(format!("'{}' is not an error queue entry", entry)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceBinding;
    use crate::transport::{EmulatedTransport, InterfaceHandle, InterfaceManager, Responder};
    use std::sync::Arc;

    fn executor(interface: &str, handle: InterfaceHandle) -> SequenceExecutor {
        let manager = InterfaceManager::new();
        manager.register(handle).unwrap();
        manager.enable_all();
        SequenceExecutor::new(
            Arc::new(manager),
            vec![DeviceBinding {
                unit_id: "DMM1".into(),
                interface: interface.into(),
                gpib_address: Some(22),
            }],
        )
    }

    #[tokio::test]
    async fn test_gpib_check_reports_srq_and_event_errors() {
        let emulated = EmulatedTransport::new("bench");
        emulated.set_status_byte(StatusByte::REQUESTING_SERVICE | StatusByte::EVENT_SUMMARY);
        emulated.set_event_status(EventStatus::COMMAND_ERROR | EventStatus::OPERATION_COMPLETE);
        let executor = executor("bench", InterfaceHandle::Gpib(Box::new(emulated.clone())));

        let report = executor
            .check_errors("DMM1", ErrorCheckKind::Gpib4882)
            .await
            .unwrap();
        assert_eq!(report.errors, vec!["SRQ", "Command error"]);
        assert!(!report.passed());
        assert!(emulated.call_log().contains(&"serial poll: 22 None".to_string()));
    }

    #[tokio::test]
    async fn test_gpib_check_on_clean_device() {
        let emulated = EmulatedTransport::new("bench");
        let executor = executor("bench", InterfaceHandle::Gpib(Box::new(emulated.clone())));
        let report = executor
            .check_errors("DMM1", ErrorCheckKind::Gpib4882)
            .await
            .unwrap();
        assert!(report.passed());
    }

    #[tokio::test]
    async fn test_gpib_check_needs_gpib_interface() {
        let emulated = EmulatedTransport::new("port");
        let executor = executor("port", InterfaceHandle::Stream(Box::new(emulated.clone())));
        let err = executor
            .check_errors("DMM1", ErrorCheckKind::Gpib4882)
            .await
            .unwrap_err();
        assert!(matches!(err, CalError::Transport(TransportError::Unsupported(_))));
    }

    #[tokio::test]
    async fn test_scpi_check_empty_queue() {
        let emulated = EmulatedTransport::with_responder("bench", Responder::Fixed("+0,\"No error\"".into()));
        let executor = executor("bench", InterfaceHandle::Gpib(Box::new(emulated.clone())));
        let report = executor.check_errors("DMM1", ErrorCheckKind::Scpi).await.unwrap();
        assert!(report.passed());
        assert_eq!(
            emulated.call_log().iter().filter(|c| *c == "write: SYST:ERR?").count(),
            1
        );
    }

    #[tokio::test]
    async fn test_scpi_check_stops_at_queue_limit() {
        let emulated = EmulatedTransport::with_responder(
            "bench",
            Responder::Fixed("-113,\"Undefined header\"".into()),
        );
        let executor = executor("bench", InterfaceHandle::Gpib(Box::new(emulated.clone())));
        let report = executor.check_errors("DMM1", ErrorCheckKind::Scpi).await.unwrap();
        assert_eq!(report.errors.len(), MAX_QUEUED_ERRORS);
        assert_eq!(report.errors[0], "-113,\"Undefined header\"");
    }

    #[test]
    fn test_queue_entry_code() {
        assert_eq!(queue_entry_code("+0,\"No error\"").unwrap(), 0);
        assert_eq!(queue_entry_code("-222,\"Data out of range\"").unwrap(), -222);
        assert!(queue_entry_code("garbage").is_err());
    }

    #[tokio::test]
    async fn test_unknown_unit() {
        let emulated = EmulatedTransport::new("bench");
        let executor = executor("bench", InterfaceHandle::Gpib(Box::new(emulated.clone())));
        let err = executor.check_errors("SRC9", ErrorCheckKind::Scpi).await.unwrap_err();
        assert!(matches!(err, CalError::UnknownUnit(_)));
    }
}
