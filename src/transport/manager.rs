//! Registry of communication interfaces with exclusive physical-resource ownership
//!
//! Each interface lives behind an `Arc<tokio::sync::Mutex<..>>`, so callers
//! sharing an interface are serialized. Two interfaces that point at the same
//! physical link (same serial port, same TCP endpoint, same GPIB board) may
//! both be registered, but only one of them can be connected at a time.
//!
//! Interfaces start disabled. An action run enables them on `start` and
//! disables them on `stop`; disabling also disconnects and releases the
//! physical resource.

use super::{
    EmulatedTransport, InterfaceConfig, InterfaceHandle, InterfaceKind, NiGpibTransport,
    PrologixTransport, Responder, SerialTransport, TimeoutOptions, TransportError,
};
use parking_lot::Mutex as SyncMutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

/// An interface shared between the manager and running sequences.
pub type SharedInterface = Arc<Mutex<InterfaceHandle>>;

struct Entry {
    name: String,
    kind: InterfaceKind,
    resource_key: String,
    enabled: Arc<AtomicBool>,
    handle: SharedInterface,
}

/// Named registry of communication interfaces
#[derive(Default)]
pub struct InterfaceManager {
    /// Keyed by upper-cased interface name
    entries: SyncMutex<HashMap<String, Arc<Entry>>>,
    /// Physical resource key -> name of the interface holding it
    claims: Arc<SyncMutex<HashMap<String, String>>>,
}

impl InterfaceManager {
    /// Manager with no interfaces.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build every interface named in `configs`.
    ///
    /// `defaults` applies to interfaces whose record carries no timeouts.
    pub fn from_configs(
        configs: &[InterfaceConfig],
        defaults: TimeoutOptions,
    ) -> Result<Self, TransportError> {
        let manager = Self::new();
        for config in configs {
            let handle = build_interface(config, defaults)?;
            manager.register(handle)?;
        }
        Ok(manager)
    }

    /// Add an interface. Names are unique, case-insensitively.
    pub fn register(&self, handle: InterfaceHandle) -> Result<SharedInterface, TransportError> {
        let transport = handle.transport();
        let name = transport.name().to_string();
        let kind = transport.kind();
        let resource_key = transport.resource_key();

        let mut entries = self.entries.lock();
        let key = name.to_uppercase();
        if entries.contains_key(&key) {
            return Err(TransportError::ResourceInUse {
                resource: name,
                owner: "an interface with the same name".to_string(),
            });
        }

        let shared = Arc::new(Mutex::new(handle));
        entries.insert(
            key,
            Arc::new(Entry {
                name: name.clone(),
                kind,
                resource_key,
                enabled: Arc::new(AtomicBool::new(false)),
                handle: shared.clone(),
            }),
        );
        debug!(interface = %name, %kind, "Registered communication interface");
        Ok(shared)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.lock().values().map(|e| e.name.clone()).collect();
        names.sort();
        names
    }

    /// Whether `name` is registered, ignoring case.
    pub fn contains(&self, name: &str) -> bool {
        self.entries.lock().contains_key(&name.to_uppercase())
    }

    /// Type of interface `name`.
    pub fn kind(&self, name: &str) -> Option<InterfaceKind> {
        self.entry(name).map(|e| e.kind)
    }

    /// The shared interface, whatever its enabled state.
    pub fn get(&self, name: &str) -> Option<SharedInterface> {
        self.entry(name).map(|e| e.handle.clone())
    }

    /// Whether `name` is registered and enabled.
    pub fn is_enabled(&self, name: &str) -> bool {
        self.entry(name)
            .is_some_and(|e| e.enabled.load(Ordering::SeqCst))
    }

    fn entry(&self, name: &str) -> Option<Arc<Entry>> {
        self.entries.lock().get(&name.to_uppercase()).cloned()
    }

    fn all(&self) -> Vec<Arc<Entry>> {
        self.entries.lock().values().cloned().collect()
    }

    /// Allow I/O on every interface.
    pub fn enable_all(&self) {
        for entry in self.all() {
            entry.enabled.store(true, Ordering::SeqCst);
        }
        info!("All communication interfaces enabled");
    }

    /// Block I/O on every interface, disconnecting the connected ones.
    pub async fn disable_all(&self) {
        for entry in self.all() {
            entry.enabled.store(false, Ordering::SeqCst);
            let mut handle = entry.handle.lock().await;
            let transport = handle.transport_mut();
            if transport.is_connected() {
                if let Err(e) = transport.disconnect().await {
                    warn!(interface = %entry.name, error = %e, "Disconnect failed while disabling");
                }
            }
            self.release(&entry);
        }
        info!("All communication interfaces disabled");
    }

    /// Exclusive access to an enabled interface, connecting it on first use.
    ///
    /// Waits while another sequence holds the interface.
    pub async fn lease(&self, name: &str) -> Result<OwnedMutexGuard<InterfaceHandle>, TransportError> {
        let entry = self
            .entry(name)
            .ok_or_else(|| TransportError::Disabled(name.to_string()))?;
        if !entry.enabled.load(Ordering::SeqCst) {
            return Err(TransportError::Disabled(entry.name.clone()));
        }

        let mut handle = entry.handle.clone().lock_owned().await;
        // Could have been disabled while we waited
        if !entry.enabled.load(Ordering::SeqCst) {
            return Err(TransportError::Disabled(entry.name.clone()));
        }

        if !handle.transport().is_connected() {
            self.claim(&entry)?;
            if let Err(e) = handle.transport_mut().connect().await {
                self.release(&entry);
                return Err(e);
            }
        }
        Ok(handle)
    }

    fn claim(&self, entry: &Entry) -> Result<(), TransportError> {
        let mut claims = self.claims.lock();
        match claims.get(&entry.resource_key) {
            Some(owner) if owner != &entry.name => Err(TransportError::ResourceInUse {
                resource: entry.resource_key.clone(),
                owner: owner.clone(),
            }),
            _ => {
                claims.insert(entry.resource_key.clone(), entry.name.clone());
                Ok(())
            }
        }
    }

    fn release(&self, entry: &Entry) {
        let mut claims = self.claims.lock();
        if claims.get(&entry.resource_key) == Some(&entry.name) {
            claims.remove(&entry.resource_key);
        }
    }
}

/// Build one interface from its configuration record.
pub fn build_interface(
    config: &InterfaceConfig,
    defaults: TimeoutOptions,
) -> Result<InterfaceHandle, TransportError> {
    let missing = |block: &str| {
        TransportError::connect(
            config.name.clone(),
            format!("{} interface needs a '{}' block", config.kind, block),
        )
    };

    let mut handle = match config.kind {
        InterfaceKind::Emulated => {
            let settings = config.emulated.clone().unwrap_or_default();
            let responder = match settings.fixed_response {
                Some(text) => Responder::Fixed(text),
                None if settings.echo => Responder::Echo,
                None => Responder::Random,
            };
            let transport = EmulatedTransport::with_responder(&config.name, responder)
                .with_terminator(config.terminator.unwrap_or_default());
            InterfaceHandle::Gpib(Box::new(transport))
        }
        InterfaceKind::PrologixGpibTcp => {
            let tcp = config.tcp.clone().ok_or_else(|| missing("tcp"))?;
            let transport = PrologixTransport::tcp(&config.name, tcp)
                .with_terminator(config.terminator.unwrap_or_default());
            InterfaceHandle::Gpib(Box::new(transport))
        }
        InterfaceKind::PrologixGpibUsb => {
            let serial = config.serial.clone().ok_or_else(|| missing("serial"))?;
            let transport = PrologixTransport::usb(&config.name, serial)
                .with_terminator(config.terminator.unwrap_or_default());
            InterfaceHandle::Gpib(Box::new(transport))
        }
        InterfaceKind::SerialPort => {
            let serial = config.serial.clone().ok_or_else(|| missing("serial"))?;
            let mut transport = SerialTransport::new(&config.name, serial);
            if let Some(terminator) = config.terminator {
                transport = transport.with_terminator(terminator);
            }
            InterfaceHandle::Stream(Box::new(transport))
        }
        InterfaceKind::NationalInstrumentsGpib => {
            let settings = config
                .national_instruments_gpib
                .clone()
                .ok_or_else(|| missing("nationalInstrumentsGpib"))?;
            InterfaceHandle::Gpib(Box::new(NiGpibTransport::new(&config.name, settings)))
        }
    };

    handle
        .transport_mut()
        .configure(config.timeouts.unwrap_or(defaults))?;
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Transport;

    fn emulated(name: &str) -> InterfaceHandle {
        InterfaceHandle::Gpib(Box::new(EmulatedTransport::with_responder(name, Responder::Echo)))
    }

    #[tokio::test]
    async fn test_lease_requires_enable() {
        let manager = InterfaceManager::new();
        manager.register(emulated("emu")).unwrap();

        assert!(matches!(
            manager.lease("emu").await,
            Err(TransportError::Disabled(_))
        ));

        manager.enable_all();
        let mut handle = manager.lease("EMU").await.unwrap();
        assert!(handle.transport().is_connected());
        let reply = handle.transport_mut().query_string("*IDN?").await.unwrap();
        assert_eq!(reply, "*IDN?");
    }

    #[tokio::test]
    async fn test_disable_all_disconnects() {
        let manager = InterfaceManager::new();
        let shared = manager.register(emulated("emu")).unwrap();
        manager.enable_all();
        drop(manager.lease("emu").await.unwrap());

        manager.disable_all().await;
        assert!(!manager.is_enabled("emu"));
        assert!(!shared.lock().await.transport().is_connected());
    }

    #[tokio::test]
    async fn test_duplicate_names_rejected() {
        let manager = InterfaceManager::new();
        manager.register(emulated("emu")).unwrap();
        assert!(manager.register(emulated("EMU")).is_err());
    }

    #[tokio::test]
    async fn test_physical_resource_is_exclusive() {
        let settings = crate::transport::SerialSettings {
            port: "/dev/ttyUSB7".to_string(),
            baud_rate: 9600,
        };
        let manager = InterfaceManager::new();
        manager
            .register(InterfaceHandle::Stream(Box::new(SerialTransport::new(
                "raw",
                settings.clone(),
            ))))
            .unwrap();
        manager
            .register(InterfaceHandle::Gpib(Box::new(PrologixTransport::usb(
                "prologix", settings,
            ))))
            .unwrap();

        // Pretend "raw" holds the port
        let raw = manager.entry("raw").unwrap();
        manager.claim(&raw).unwrap();

        manager.enable_all();
        assert!(matches!(
            manager.lease("prologix").await,
            Err(TransportError::ResourceInUse { ref owner, .. }) if owner == "raw"
        ));
    }

    #[test]
    fn test_build_from_configs() {
        let mut emulated = InterfaceConfig::emulated("offline");
        emulated.emulated = Some(crate::transport::EmulatedSettings {
            echo: false,
            fixed_response: Some("42".into()),
        });
        let manager =
            InterfaceManager::from_configs(&[emulated], TimeoutOptions::default()).unwrap();
        assert_eq!(manager.names(), vec!["offline"]);
        assert_eq!(manager.kind("offline"), Some(InterfaceKind::Emulated));
    }

    #[test]
    fn test_build_requires_settings_block() {
        let mut record = InterfaceConfig::emulated("bench");
        record.kind = InterfaceKind::PrologixGpibTcp;
        assert!(build_interface(&record, TimeoutOptions::default()).is_err());
    }
}
