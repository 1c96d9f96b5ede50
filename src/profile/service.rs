//! HID-Host profile service: the per-profile connection registry.
//!
//! Single authoritative owner of all device machines. Every mutating
//! operation is posted as a [`ServiceEvent`] into one unbounded queue drained
//! by exactly one worker task, so at most one machine dispatch or admission
//! decision is in flight per service instance no matter how many threads call
//! the public API. Synchronous queries take the same lock the worker holds
//! while applying an event and therefore always observe the last fully
//! processed state, never a half-applied one.
//!
//! Registry entries are an explicit tri-state: absent from the map, `Active`
//! (owns the live machine), or `Removing` (removal posted, teardown not yet
//! finalized). A connect that lands on a `Removing` entry is re-posted until
//! the removal completes instead of reviving the dying machine.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::domain::models::{
    ConnectionStatus, DeviceAddress, DeviceEvent, EventSender, GetReportParams, HidReport,
    ProfileError, ServiceEvent,
};
use crate::domain::settings::Settings;
use crate::infrastructure::discovery::DiscoveryClient;
use crate::infrastructure::kernel::KernelTransportFactory;
use crate::infrastructure::transport::ChannelBridge;
use crate::profile::machine::DeviceMachine;

/// Callback for confirmed connection-state changes. Invoked once per change,
/// outside the registry lock.
pub trait ConnectionObserver: Send + Sync {
    fn on_connection_state_changed(&self, address: &DeviceAddress, state: ConnectionStatus);
}

/// Tri-state registry entry; "absent" is simply not in the map.
enum DeviceEntry {
    Active(DeviceMachine),
    Removing,
}

struct Registry {
    devices: HashMap<DeviceAddress, DeviceEntry>,
    observers: Vec<Arc<dyn ConnectionObserver>>,
    enabled: bool,
    shutting_down: bool,
}

impl Registry {
    fn new() -> Self {
        Self {
            devices: HashMap::new(),
            observers: Vec::new(),
            enabled: false,
            shutting_down: false,
        }
    }

    fn status_of(&self, address: &DeviceAddress) -> Option<ConnectionStatus> {
        match self.devices.get(address) {
            Some(DeviceEntry::Active(machine)) => Some(machine.status()),
            Some(DeviceEntry::Removing) => Some(ConnectionStatus::Disconnected),
            None => None,
        }
    }

    /// Devices currently counted against the connection cap.
    fn connected_family_count(&self) -> usize {
        self.devices
            .values()
            .filter(|entry| match entry {
                DeviceEntry::Active(machine) => machine.status().is_connected_family(),
                DeviceEntry::Removing => false,
            })
            .count()
    }
}

/// Collaborators handed to every device machine.
#[derive(Clone)]
struct Collaborators {
    discovery: Arc<dyn DiscoveryClient>,
    bridge: Arc<dyn ChannelBridge>,
    kernel_factory: Arc<dyn KernelTransportFactory>,
}

/// The profile's public face. Cheap to share behind an `Arc`.
pub struct HidHostService {
    registry: Arc<Mutex<Registry>>,
    events: EventSender,
    disabled_notify: Arc<Notify>,
    max_connections: usize,
}

impl HidHostService {
    /// Create the service and spawn its worker. The caller owns the channel
    /// and hands the sender to every collaborator; must be called within a
    /// tokio runtime.
    pub fn new(
        settings: &Settings,
        events: EventSender,
        queue: mpsc::UnboundedReceiver<ServiceEvent>,
        discovery: Arc<dyn DiscoveryClient>,
        bridge: Arc<dyn ChannelBridge>,
        kernel_factory: Arc<dyn KernelTransportFactory>,
    ) -> Self {
        let (service, worker) =
            Self::with_worker(settings, events, queue, discovery, bridge, kernel_factory);
        tokio::spawn(worker.run());
        service
    }

    fn with_worker(
        settings: &Settings,
        events: EventSender,
        queue: mpsc::UnboundedReceiver<ServiceEvent>,
        discovery: Arc<dyn DiscoveryClient>,
        bridge: Arc<dyn ChannelBridge>,
        kernel_factory: Arc<dyn KernelTransportFactory>,
    ) -> (Self, Worker) {
        let registry = Arc::new(Mutex::new(Registry::new()));
        let disabled_notify = Arc::new(Notify::new());
        let service = Self {
            registry: Arc::clone(&registry),
            events: events.clone(),
            disabled_notify: Arc::clone(&disabled_notify),
            max_connections: settings.max_connections,
        };
        let worker = Worker {
            registry,
            queue,
            events,
            deps: Collaborators {
                discovery,
                bridge,
                kernel_factory,
            },
            disabled_notify,
            max_connections: settings.max_connections,
        };
        (service, worker)
    }

    /// Start the profile. Re-invoking while enabled reports success without
    /// side effects.
    pub fn enable(&self) -> Result<(), ProfileError> {
        {
            let registry = self.registry.lock().unwrap();
            if registry.enabled && !registry.shutting_down {
                return Ok(());
            }
        }
        let _ = self.events.send(ServiceEvent::Enable);
        Ok(())
    }

    /// Shut the profile down: closes every non-disconnected device and
    /// completes once the last one reports removal (synchronously when there
    /// are none). Idempotent.
    pub fn disable(&self) -> Result<(), ProfileError> {
        {
            let registry = self.registry.lock().unwrap();
            if !registry.enabled {
                return Ok(());
            }
        }
        let _ = self.events.send(ServiceEvent::Disable);
        Ok(())
    }

    pub fn is_enabled(&self) -> bool {
        self.registry.lock().unwrap().enabled
    }

    /// Resolve once a `disable` has fully completed.
    pub async fn wait_disabled(&self) {
        loop {
            let notified = self.disabled_notify.notified();
            if !self.registry.lock().unwrap().enabled {
                return;
            }
            notified.await;
        }
    }

    /// Request an outbound connection. Rejected synchronously (nothing
    /// posted, nothing mutated) when the device is already
    /// Connecting/Connected or the connection cap is reached.
    pub fn connect(&self, address: &DeviceAddress) -> Result<(), ProfileError> {
        {
            let registry = self.registry.lock().unwrap();
            if !registry.enabled || registry.shutting_down {
                return Err(ProfileError::InvalidDeviceState);
            }
            if registry
                .status_of(address)
                .is_some_and(ConnectionStatus::is_connected_family)
            {
                return Err(ProfileError::AdmissionRejected(
                    "device already connecting or connected",
                ));
            }
            if registry.connected_family_count() >= self.max_connections {
                return Err(ProfileError::AdmissionRejected(
                    "maximum connection count reached",
                ));
            }
        }
        let _ = self
            .events
            .send(ServiceEvent::ConnectDevice(address.clone()));
        Ok(())
    }

    /// Request teardown. Rejected when the device is unknown or already
    /// disconnected.
    pub fn disconnect(&self, address: &DeviceAddress) -> Result<(), ProfileError> {
        {
            let registry = self.registry.lock().unwrap();
            if !registry.enabled {
                return Err(ProfileError::InvalidDeviceState);
            }
            match registry.status_of(address) {
                None | Some(ConnectionStatus::Disconnected) => {
                    return Err(ProfileError::InvalidDeviceState)
                }
                Some(_) => {}
            }
        }
        let _ = self
            .events
            .send(ServiceEvent::Device(address.clone(), DeviceEvent::Close));
        Ok(())
    }

    /// Push an interrupt-channel report to the device.
    pub fn send_data(&self, address: &DeviceAddress, report: HidReport) -> Result<(), ProfileError> {
        self.post_connected(address, DeviceEvent::SendData(report))
    }

    /// Open a get-report control transaction.
    pub fn get_report(
        &self,
        address: &DeviceAddress,
        params: GetReportParams,
    ) -> Result<(), ProfileError> {
        self.post_connected(address, DeviceEvent::GetReport(params))
    }

    /// Open a set-report control transaction.
    pub fn set_report(
        &self,
        address: &DeviceAddress,
        report: HidReport,
    ) -> Result<(), ProfileError> {
        self.post_connected(address, DeviceEvent::SetReport(report))
    }

    /// Send the virtual-cable-unplug control frame and tear the device down.
    pub fn virtual_cable_unplug(&self, address: &DeviceAddress) -> Result<(), ProfileError> {
        {
            let registry = self.registry.lock().unwrap();
            if !registry
                .status_of(address)
                .is_some_and(ConnectionStatus::is_connected_family)
            {
                return Err(ProfileError::InvalidDeviceState);
            }
        }
        let _ = self.events.send(ServiceEvent::Device(
            address.clone(),
            DeviceEvent::VirtualCableUnplug,
        ));
        Ok(())
    }

    fn post_connected(
        &self,
        address: &DeviceAddress,
        event: DeviceEvent,
    ) -> Result<(), ProfileError> {
        {
            let registry = self.registry.lock().unwrap();
            if registry.status_of(address) != Some(ConnectionStatus::Connected) {
                return Err(ProfileError::InvalidDeviceState);
            }
        }
        let _ = self
            .events
            .send(ServiceEvent::Device(address.clone(), event));
        Ok(())
    }

    pub fn get_device_state(
        &self,
        address: &DeviceAddress,
    ) -> Result<ConnectionStatus, ProfileError> {
        self.registry
            .lock()
            .unwrap()
            .status_of(address)
            .ok_or(ProfileError::InvalidDeviceState)
    }

    pub fn get_devices_by_states(&self, states: &[ConnectionStatus]) -> Vec<DeviceAddress> {
        let registry = self.registry.lock().unwrap();
        registry
            .devices
            .iter()
            .filter_map(|(address, entry)| {
                // Same view as get_device_state: a removing entry reads as
                // Disconnected.
                let status = match entry {
                    DeviceEntry::Active(machine) => machine.status(),
                    DeviceEntry::Removing => ConnectionStatus::Disconnected,
                };
                states.contains(&status).then(|| address.clone())
            })
            .collect()
    }

    pub fn get_connect_devices(&self) -> Vec<DeviceAddress> {
        self.get_devices_by_states(&[ConnectionStatus::Connected])
    }

    /// Count of devices currently Connecting or Connected.
    pub fn get_connections_device_num(&self) -> usize {
        self.registry.lock().unwrap().connected_family_count()
    }

    /// Aggregate profile state across all devices.
    pub fn get_connect_state(&self) -> ConnectionStatus {
        let registry = self.registry.lock().unwrap();
        let statuses: Vec<ConnectionStatus> = registry
            .devices
            .values()
            .filter_map(|entry| match entry {
                DeviceEntry::Active(machine) => Some(machine.status()),
                DeviceEntry::Removing => None,
            })
            .collect();
        for wanted in [
            ConnectionStatus::Connected,
            ConnectionStatus::Connecting,
            ConnectionStatus::Disconnecting,
        ] {
            if statuses.contains(&wanted) {
                return wanted;
            }
        }
        ConnectionStatus::Disconnected
    }

    pub fn get_max_connect_num(&self) -> usize {
        self.max_connections
    }

    pub fn register_observer(&self, observer: Arc<dyn ConnectionObserver>) {
        self.registry.lock().unwrap().observers.push(observer);
    }

    pub fn deregister_observer(&self, observer: &Arc<dyn ConnectionObserver>) {
        self.registry
            .lock()
            .unwrap()
            .observers
            .retain(|o| !Arc::ptr_eq(o, observer));
    }
}

/// The single logical writer: drains the queue and applies each event under
/// the registry lock, then notifies observers outside it.
struct Worker {
    registry: Arc<Mutex<Registry>>,
    queue: mpsc::UnboundedReceiver<ServiceEvent>,
    events: EventSender,
    deps: Collaborators,
    disabled_notify: Arc<Notify>,
    max_connections: usize,
}

impl Worker {
    async fn run(mut self) {
        while let Some(event) = self.queue.recv().await {
            self.step(event);
        }
        debug!("profile worker stopped");
    }

    fn step(&mut self, event: ServiceEvent) {
        let mut notifications = Vec::new();
        let observers = {
            let mut registry = self.registry.lock().unwrap();
            self.apply(&mut registry, event, &mut notifications);
            if notifications.is_empty() {
                Vec::new()
            } else {
                registry.observers.clone()
            }
        };
        for (address, status) in &notifications {
            for observer in &observers {
                observer.on_connection_state_changed(address, *status);
            }
        }
    }

    fn apply(
        &self,
        registry: &mut Registry,
        event: ServiceEvent,
        notifications: &mut Vec<(DeviceAddress, ConnectionStatus)>,
    ) {
        match event {
            ServiceEvent::Enable => {
                if registry.shutting_down {
                    // An in-flight disable must run to completion; come back
                    // to this enable once it has.
                    debug!("enable deferred until the shutdown completes");
                    let _ = self.events.send(ServiceEvent::Enable);
                    return;
                }
                if !registry.enabled {
                    info!("hid host profile enabled");
                }
                registry.enabled = true;
            }
            ServiceEvent::Disable => {
                if !registry.enabled {
                    self.disabled_notify.notify_waiters();
                    return;
                }
                registry.shutting_down = true;
                let open: Vec<DeviceAddress> = registry
                    .devices
                    .iter()
                    .filter_map(|(address, entry)| match entry {
                        DeviceEntry::Active(machine)
                            if machine.status() != ConnectionStatus::Disconnected =>
                        {
                            Some(address.clone())
                        }
                        _ => None,
                    })
                    .collect();
                info!(open_devices = open.len(), "hid host profile shutting down");
                for address in open {
                    let _ = self
                        .events
                        .send(ServiceEvent::Device(address, DeviceEvent::Close));
                }
                self.maybe_finish_disable(registry);
            }
            ServiceEvent::ConnectDevice(address) => {
                if !registry.enabled || registry.shutting_down {
                    debug!(device = %address, "connect dropped, profile not accepting connections");
                    return;
                }
                match registry.devices.get(&address) {
                    Some(DeviceEntry::Removing) => {
                        // Old machine still tearing down; try again after it
                        // is gone.
                        debug!(device = %address, "machine still removing, re-posting connect");
                        let _ = self.events.send(ServiceEvent::ConnectDevice(address));
                        return;
                    }
                    Some(DeviceEntry::Active(machine))
                        if machine.status().is_connected_family() =>
                    {
                        debug!(device = %address, "connect dropped, already connecting or connected");
                        return;
                    }
                    _ => {}
                }
                // Admission is re-checked here: several accepted connects can
                // sit in the queue before the first one is applied.
                if registry.connected_family_count() >= self.max_connections {
                    warn!(device = %address, "connect dropped, connection cap reached");
                    notifications.push((address, ConnectionStatus::Disconnected));
                    return;
                }
                let entry = registry
                    .devices
                    .entry(address.clone())
                    .or_insert_with(|| {
                        debug!(device = %address, "creating device machine");
                        DeviceEntry::Active(DeviceMachine::new(
                            address.clone(),
                            self.events.clone(),
                            Arc::clone(&self.deps.discovery),
                            Arc::clone(&self.deps.bridge),
                            Arc::clone(&self.deps.kernel_factory),
                        ))
                    });
                if let DeviceEntry::Active(machine) = entry {
                    let before = machine.status();
                    machine.process(&DeviceEvent::Open);
                    let after = machine.status();
                    if before != after {
                        notifications.push((address, after));
                    }
                }
            }
            ServiceEvent::Device(address, device_event) => {
                match registry.devices.get_mut(&address) {
                    Some(DeviceEntry::Active(machine)) => {
                        let before = machine.status();
                        machine.process(&device_event);
                        let after = machine.status();
                        if before != after {
                            notifications.push((address, after));
                        }
                    }
                    Some(DeviceEntry::Removing) => {
                        debug!(device = %address, ?device_event, "event for removing machine dropped");
                    }
                    None => {
                        debug!(device = %address, ?device_event, "event for unknown device dropped");
                    }
                }
            }
            ServiceEvent::RemoveMachine(address) => match registry.devices.get(&address) {
                Some(DeviceEntry::Active(machine)) => {
                    if machine.status() != ConnectionStatus::Disconnected {
                        // Stale removal: the machine was re-activated by a
                        // connect queued behind the teardown. It must not be
                        // torn down again.
                        warn!(device = %address, status = ?machine.status(),
                            "removal for a re-activated machine ignored");
                        return;
                    }
                    registry
                        .devices
                        .insert(address.clone(), DeviceEntry::Removing);
                    let _ = self.events.send(ServiceEvent::FinalizeRemove(address));
                }
                Some(DeviceEntry::Removing) => {
                    debug!(device = %address, "removal already in progress");
                }
                None => {
                    debug!(device = %address, "removal for unknown device ignored");
                }
            },
            ServiceEvent::FinalizeRemove(address) => {
                if matches!(registry.devices.get(&address), Some(DeviceEntry::Removing)) {
                    registry.devices.remove(&address);
                    info!(device = %address, "device machine removed");
                }
                self.maybe_finish_disable(registry);
            }
        }
    }

    fn maybe_finish_disable(&self, registry: &mut Registry) {
        if !registry.shutting_down {
            return;
        }
        let live = registry.devices.values().any(|entry| match entry {
            DeviceEntry::Removing => true,
            DeviceEntry::Active(machine) => machine.status() != ConnectionStatus::Disconnected,
        });
        if !live {
            registry.devices.clear();
            registry.enabled = false;
            registry.shutting_down = false;
            info!("hid host profile disabled");
            self.disabled_notify.notify_waiters();
        }
    }
}
