use std::time::Duration;
use async_trait::async_trait;
use btleplug::api::{Central, Characteristic as BtleCharacteristic, Manager as _, Peripheral as _, ScanFilter, WriteType};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::future;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use log::{debug, info, warn};
use tokio::time::{sleep, Instant};
use uuid::Uuid;

use crate::config::types::{Config, PeripheralSelector};
use crate::device::constants::{IS_CONNECTED_DEADLINE, PERIPHERAL_ID_NAMESPACE, SCAN_POLL_DELAY};
use crate::device::types::{Characteristic, ConnectionState, DeviceHandle, Service};
use crate::error::TransportError;
use crate::transport::Transport;

enum LinkPhase {
    Start,
    Connecting,
    Connected,
    Done,
}

// btleplug has no notion of a characteristic without a value, an empty read is the closest thing
fn non_empty(value: Vec<u8>) -> Option<Vec<u8>> {
    if value.is_empty() { None } else { Some(value) }
}

// Notifications only carry the characteristic uuid, so one that is also used by another service
// cannot be told apart from it.
fn shared_with_other_service(service: Uuid, uuid: Uuid, known: impl IntoIterator<Item = (Uuid, Uuid)>) -> bool {
    known.into_iter().any(|(other_service, other_uuid)| other_uuid == uuid && other_service != service)
}

async fn start_scanning(manager: &Manager, services: &[Uuid]) -> Result<Vec<Adapter>, TransportError> {
    let adapters = manager.adapters().await?;

    let filter = ScanFilter {
        services: services.to_vec(),
    };

    for adapter in &adapters {
        info!("Scanning using adapter {}...", adapter.adapter_info().await.unwrap_or("UNKNOWN".to_string()));
        adapter.start_scan(filter.clone()).await?;
    }

    Ok(adapters)
}

async fn stop_scanning(adapters: &[Adapter]) {
    for adapter in adapters {
        if let Err(err) = adapter.stop_scan().await {
            warn!("Failed to stop scanning: {:?}", err);
        }
    }
}

async fn find_peripheral(adapters: &[Adapter], selector: &PeripheralSelector, services: &[Uuid]) -> Option<Peripheral> {
    for adapter in adapters {
        let peripherals = match adapter.peripherals().await {
            Ok(v) => v,
            Err(err) => {
                warn!("Failed to query BLE adapter for peripherals: {}", err);
                continue;
            },
        };

        for peripheral in peripherals {
            match peripheral.properties().await {
                Err(err) => {
                    warn!("Could not query peripheral for properties: {:?}", err);
                },
                Ok(None) => {
                    debug!("Peripheral has no properties");
                },
                Ok(Some(properties)) => {
                    // Some environments ignore the scan filter, so check the services again
                    let address = properties.address.to_string();
                    if selector.matches(properties.local_name.as_deref(), &address, &properties.services, services) {
                        info!(
                            "Using peripheral {} {:?} {} {:?}",
                            properties.address,
                            properties.address_type,
                            properties.local_name.unwrap_or(String::from("NONE")),
                            properties.services,
                        );
                        return Some(peripheral);
                    }
                },
            }
        }
    }

    None
}

/// [`Transport`] backed by `btleplug`, bound to one peripheral found by scanning.
pub struct BtleTransport {
    peripheral: Peripheral,
    connection_poll: Duration,
}

impl BtleTransport {
    /// Scan every adapter until a peripheral matching the configured selector shows up.
    pub async fn discover(config: &Config) -> Result<(Self, DeviceHandle), TransportError> {
        let services = config.peripheral.service_uuids()
            .map_err(|err| TransportError::Other(err.to_string()))?;
        let manager = Manager::new().await?;
        let adapters = start_scanning(&manager, &services).await?;
        let deadline = Instant::now() + config.scan_timeout();

        let peripheral = loop {
            if let Some(peripheral) = find_peripheral(&adapters, &config.peripheral, &services).await {
                break Some(peripheral);
            }
            if Instant::now() >= deadline {
                break None;
            }
            sleep(Duration::from_millis(SCAN_POLL_DELAY)).await;
        };

        stop_scanning(&adapters).await;

        let peripheral = peripheral.ok_or(TransportError::PeripheralNotFound)?;
        let transport = BtleTransport {
            peripheral,
            connection_poll: config.connection_poll(),
        };
        let device = transport.device();
        Ok((transport, device))
    }

    /// A handle whose identity stays the same for the platform's peripheral id.
    pub fn device(&self) -> DeviceHandle {
        let id = format!("{:?}", self.peripheral.id());
        DeviceHandle::new(Uuid::new_v5(&PERIPHERAL_ID_NAMESPACE, id.as_bytes()))
    }

    /// Disconnect and wait for it to finish, for use right before exiting.
    pub async fn shutdown(&self) -> Result<(), TransportError> {
        if self.peripheral.is_connected().await? {
            self.peripheral.disconnect().await?;
        }
        Ok(())
    }

    fn find_characteristic(&self, characteristic: &Characteristic) -> Result<BtleCharacteristic, TransportError> {
        self.peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == characteristic.uuid && c.service_uuid == characteristic.service_uuid)
            .ok_or_else(|| TransportError::Other(format!("Characteristic {} is no longer available", characteristic.uuid)))
    }
}

async fn still_connected(peripheral: &Peripheral) -> bool {
    tokio::select! {
        _ = sleep(Duration::from_millis(IS_CONNECTED_DEADLINE)) => {
            warn!("Checking for connection status took too long");
            false
        }
        result = peripheral.is_connected() => match result {
            Ok(connected) => connected,
            Err(err) => {
                warn!("Error checking for connection state: {:?}", err);
                false
            },
        }
    }
}

#[async_trait]
impl Transport for BtleTransport {
    fn connect(&self, device: &DeviceHandle) -> BoxStream<'static, Result<DeviceHandle, TransportError>> {
        let peripheral = self.peripheral.clone();
        let device = device.clone();
        let poll = self.connection_poll;

        stream::unfold(LinkPhase::Start, move |phase| {
            let peripheral = peripheral.clone();
            let device = device.clone();

            async move {
                match phase {
                    LinkPhase::Start => {
                        Some((Ok(device.with_state(ConnectionState::Connecting)), LinkPhase::Connecting))
                    },
                    LinkPhase::Connecting => match peripheral.connect().await {
                        Ok(()) => Some((Ok(device.with_state(ConnectionState::Connected)), LinkPhase::Connected)),
                        Err(err) => Some((Err(TransportError::from(err)), LinkPhase::Done)),
                    },
                    LinkPhase::Connected => {
                        loop {
                            sleep(poll).await;
                            if !still_connected(&peripheral).await {
                                break;
                            }
                        }
                        Some((Ok(device.with_state(ConnectionState::Disconnected)), LinkPhase::Done))
                    },
                    LinkPhase::Done => None,
                }
            }
        }).boxed()
    }

    async fn discover_services(&self, _device: &DeviceHandle, services: &[Uuid]) -> Result<Vec<Service>, TransportError> {
        self.peripheral.discover_services().await?;

        Ok(self.peripheral
            .services()
            .into_iter()
            .filter(|service| services.is_empty() || services.contains(&service.uuid))
            .map(|service| Service { uuid: service.uuid })
            .collect())
    }

    async fn discover_characteristics(
        &self,
        _device: &DeviceHandle,
        service: &Service,
        characteristics: &[Uuid],
    ) -> Result<Vec<Characteristic>, TransportError> {
        Ok(self.peripheral
            .services()
            .into_iter()
            .filter(|s| s.uuid == service.uuid)
            .flat_map(|s| s.characteristics.into_iter())
            .filter(|c| characteristics.is_empty() || characteristics.contains(&c.uuid))
            .map(|c| Characteristic::new(c.service_uuid, c.uuid, c.properties))
            .collect())
    }

    async fn read_value(&self, characteristic: &Characteristic) -> Result<Characteristic, TransportError> {
        let target = self.find_characteristic(characteristic)?;
        let value = self.peripheral.read(&target).await?;
        Ok(characteristic.with_value(non_empty(value)))
    }

    async fn write_value(
        &self,
        characteristic: &Characteristic,
        value: &[u8],
        write_type: WriteType,
    ) -> Result<Characteristic, TransportError> {
        let target = self.find_characteristic(characteristic)?;
        self.peripheral.write(&target, value, write_type).await?;
        Ok(characteristic.with_value(None))
    }

    async fn observe_notifications(
        &self,
        characteristic: &Characteristic,
    ) -> Result<BoxStream<'static, Result<Characteristic, TransportError>>, TransportError> {
        let target = self.find_characteristic(characteristic)?;

        let known = self.peripheral.characteristics().into_iter().map(|c| (c.service_uuid, c.uuid));
        if shared_with_other_service(target.service_uuid, target.uuid, known) {
            return Err(TransportError::AmbiguousNotifications { characteristic: target.uuid });
        }

        info!("Subscribing to characteristic {:?} {:?}", target.service_uuid, target.uuid);
        let notifications = self.peripheral.notifications().await?;
        self.peripheral.subscribe(&target).await?;

        let uuid = target.uuid;
        let characteristic = characteristic.clone();
        Ok(notifications
            .filter(move |notification| future::ready(notification.uuid == uuid))
            .map(move |notification| Ok(characteristic.with_value(non_empty(notification.value))))
            .boxed())
    }

    fn stop_notifications(&self, characteristic: &Characteristic) {
        let target = match self.find_characteristic(characteristic) {
            Ok(target) => target,
            Err(err) => {
                warn!("Not unsubscribing: {}", err);
                return;
            },
        };
        let peripheral = self.peripheral.clone();

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    info!("Unsubscribing from characteristic {:?} {:?}", target.service_uuid, target.uuid);
                    if let Err(err) = peripheral.unsubscribe(&target).await {
                        warn!("Failed to unsubscribe from characteristic {}: {:?}", target.uuid, err);
                    }
                });
            },
            Err(_) => warn!("No runtime available to unsubscribe from characteristic {}", target.uuid),
        }
    }

    fn cancel_connection(&self, device: &DeviceHandle) {
        let peripheral = self.peripheral.clone();
        let id = device.id;

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(err) = peripheral.disconnect().await {
                        warn!("Failed to disconnect from peripheral {}: {:?}", id, err);
                    }
                });
            },
            Err(_) => warn!("No runtime available to disconnect peripheral {}", id),
        }
    }
}
