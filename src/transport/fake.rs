//! A scripted in-memory [`Transport`] for exercising the driver without a radio.
//!
//! The peripheral exposes whatever characteristics it is built with, connects immediately unless
//! told to hold, and replays a fixed list of notifications per characteristic before going quiet.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use async_trait::async_trait;
use btleplug::api::{CharPropFlags, WriteType};
use futures::future;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use tokio::sync::{oneshot, watch};
use uuid::Uuid;

use crate::device::types::{Characteristic, ConnectionState, DeviceHandle, Service};
use crate::error::TransportError;
use crate::transport::Transport;

struct FakeCharacteristic {
    characteristic: Characteristic,
    notifications: Vec<Option<Vec<u8>>>,
}

#[derive(Default)]
struct Counters {
    connect: AtomicUsize,
    discover: AtomicUsize,
    read: AtomicUsize,
    write: AtomicUsize,
    observe: AtomicUsize,
    unsubscribe: AtomicUsize,
    cancel: AtomicUsize,
}

struct FakeInner {
    id: Uuid,
    characteristics: Mutex<Vec<FakeCharacteristic>>,
    connection_gate: watch::Sender<bool>,
    connection_failure: Mutex<Option<TransportError>>,
    link: Mutex<Option<oneshot::Sender<()>>>,
    hold_reads: AtomicBool,
    hold_writes: AtomicBool,
    written: Mutex<Vec<Vec<u8>>>,
    counters: Counters,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Clone)]
pub struct FakeTransport {
    inner: Arc<FakeInner>,
}

impl Default for FakeTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeTransport {
    pub fn new() -> Self {
        let (connection_gate, _) = watch::channel(true);

        FakeTransport {
            inner: Arc::new(FakeInner {
                id: Uuid::new_v4(),
                characteristics: Mutex::new(Vec::new()),
                connection_gate,
                connection_failure: Mutex::new(None),
                link: Mutex::new(None),
                hold_reads: AtomicBool::new(false),
                hold_writes: AtomicBool::new(false),
                written: Mutex::new(Vec::new()),
                counters: Counters::default(),
            }),
        }
    }

    pub fn with_characteristic(self, service: Uuid, uuid: Uuid, properties: CharPropFlags, value: Option<Vec<u8>>) -> Self {
        lock(&self.inner.characteristics).push(FakeCharacteristic {
            characteristic: Characteristic::new(service, uuid, properties).with_value(value),
            notifications: Vec::new(),
        });
        self
    }

    /// Values the characteristic pushes, in order, to every new subscriber.
    pub fn with_notifications(self, service: Uuid, uuid: Uuid, notifications: Vec<Option<Vec<u8>>>) -> Self {
        {
            let mut characteristics = lock(&self.inner.characteristics);
            match characteristics.iter_mut().find(|c| c.characteristic.service_uuid == service && c.characteristic.uuid == uuid) {
                Some(existing) => existing.notifications = notifications,
                None => characteristics.push(FakeCharacteristic {
                    characteristic: Characteristic::new(service, uuid, CharPropFlags::NOTIFY),
                    notifications,
                }),
            }
        }
        self
    }

    pub fn device(&self) -> DeviceHandle {
        DeviceHandle::new(self.inner.id)
    }

    /// Connection attempts stay in the connecting state until [`Self::release_connection`].
    pub fn hold_connection(&self) {
        self.inner.connection_gate.send_replace(false);
    }

    pub fn release_connection(&self) {
        self.inner.connection_gate.send_replace(true);
    }

    pub fn fail_connection(&self, error: TransportError) {
        *lock(&self.inner.connection_failure) = Some(error);
    }

    pub fn clear_connection_failure(&self) {
        *lock(&self.inner.connection_failure) = None;
    }

    /// Simulate the peripheral going out of range.
    pub fn drop_link(&self) {
        if let Some(link) = lock(&self.inner.link).take() {
            let _ = link.send(());
        }
    }

    pub fn hold_reads(&self, hold: bool) {
        self.inner.hold_reads.store(hold, Ordering::SeqCst);
    }

    pub fn hold_writes(&self, hold: bool) {
        self.inner.hold_writes.store(hold, Ordering::SeqCst);
    }

    pub fn written(&self) -> Vec<Vec<u8>> {
        lock(&self.inner.written).clone()
    }

    pub fn connect_calls(&self) -> usize {
        self.inner.counters.connect.load(Ordering::SeqCst)
    }

    pub fn discover_calls(&self) -> usize {
        self.inner.counters.discover.load(Ordering::SeqCst)
    }

    pub fn read_calls(&self) -> usize {
        self.inner.counters.read.load(Ordering::SeqCst)
    }

    pub fn write_calls(&self) -> usize {
        self.inner.counters.write.load(Ordering::SeqCst)
    }

    pub fn observe_calls(&self) -> usize {
        self.inner.counters.observe.load(Ordering::SeqCst)
    }

    pub fn unsubscribe_calls(&self) -> usize {
        self.inner.counters.unsubscribe.load(Ordering::SeqCst)
    }

    pub fn cancel_calls(&self) -> usize {
        self.inner.counters.cancel.load(Ordering::SeqCst)
    }

    /// Total number of calls made into the transport.
    pub fn transport_calls(&self) -> usize {
        self.connect_calls()
            + self.discover_calls()
            + self.read_calls()
            + self.write_calls()
            + self.observe_calls()
            + self.unsubscribe_calls()
            + self.cancel_calls()
    }

    fn find(&self, characteristic: &Characteristic) -> Result<Characteristic, TransportError> {
        lock(&self.inner.characteristics)
            .iter()
            .map(|c| &c.characteristic)
            .find(|c| c.service_uuid == characteristic.service_uuid && c.uuid == characteristic.uuid)
            .cloned()
            .ok_or_else(|| TransportError::Other(format!("unknown characteristic {}", characteristic.uuid)))
    }
}

#[async_trait]
impl Transport for FakeTransport {
    fn connect(&self, device: &DeviceHandle) -> BoxStream<'static, Result<DeviceHandle, TransportError>> {
        self.inner.counters.connect.fetch_add(1, Ordering::SeqCst);

        let failure = lock(&self.inner.connection_failure).clone();
        let mut gate = self.inner.connection_gate.subscribe();
        let (link_tx, link_rx) = oneshot::channel();
        *lock(&self.inner.link) = Some(link_tx);

        let connecting = device.with_state(ConnectionState::Connecting);
        let connected = device.with_state(ConnectionState::Connected);
        let disconnected = device.with_state(ConnectionState::Disconnected);

        let established = async move {
            let _ = gate.wait_for(|open| *open).await;
            match failure {
                Some(err) => Err(err),
                None => Ok(connected),
            }
        };
        let lost = async move {
            let _ = link_rx.await;
            Ok::<_, TransportError>(disconnected)
        };

        stream::once(future::ready(Ok::<_, TransportError>(connecting)))
            .chain(stream::once(established))
            .chain(stream::once(lost))
            .boxed()
    }

    async fn discover_services(&self, _device: &DeviceHandle, services: &[Uuid]) -> Result<Vec<Service>, TransportError> {
        self.inner.counters.discover.fetch_add(1, Ordering::SeqCst);

        let mut found: Vec<Service> = Vec::new();
        for c in lock(&self.inner.characteristics).iter() {
            let uuid = c.characteristic.service_uuid;
            if services.contains(&uuid) && !found.iter().any(|s| s.uuid == uuid) {
                found.push(Service { uuid });
            }
        }
        Ok(found)
    }

    async fn discover_characteristics(
        &self,
        _device: &DeviceHandle,
        service: &Service,
        characteristics: &[Uuid],
    ) -> Result<Vec<Characteristic>, TransportError> {
        self.inner.counters.discover.fetch_add(1, Ordering::SeqCst);

        Ok(lock(&self.inner.characteristics)
            .iter()
            .map(|c| &c.characteristic)
            .filter(|c| c.service_uuid == service.uuid && characteristics.contains(&c.uuid))
            .map(|c| c.with_value(None))
            .collect())
    }

    async fn read_value(&self, characteristic: &Characteristic) -> Result<Characteristic, TransportError> {
        self.inner.counters.read.fetch_add(1, Ordering::SeqCst);

        if self.inner.hold_reads.load(Ordering::SeqCst) {
            future::pending::<()>().await;
        }
        self.find(characteristic)
    }

    async fn write_value(
        &self,
        characteristic: &Characteristic,
        value: &[u8],
        _write_type: WriteType,
    ) -> Result<Characteristic, TransportError> {
        self.inner.counters.write.fetch_add(1, Ordering::SeqCst);

        if self.inner.hold_writes.load(Ordering::SeqCst) {
            future::pending::<()>().await;
        }
        let characteristic = self.find(characteristic)?;
        lock(&self.inner.written).push(value.to_vec());
        Ok(characteristic)
    }

    async fn observe_notifications(
        &self,
        characteristic: &Characteristic,
    ) -> Result<BoxStream<'static, Result<Characteristic, TransportError>>, TransportError> {
        self.inner.counters.observe.fetch_add(1, Ordering::SeqCst);

        let updates: Vec<Result<Characteristic, TransportError>> = lock(&self.inner.characteristics)
            .iter()
            .find(|c| c.characteristic.service_uuid == characteristic.service_uuid && c.characteristic.uuid == characteristic.uuid)
            .map(|c| c.notifications.iter().map(|value| Ok(c.characteristic.with_value(value.clone()))).collect())
            .unwrap_or_default();

        Ok(stream::iter(updates).chain(stream::pending()).boxed())
    }

    fn stop_notifications(&self, _characteristic: &Characteristic) {
        self.inner.counters.unsubscribe.fetch_add(1, Ordering::SeqCst);
    }

    fn cancel_connection(&self, _device: &DeviceHandle) {
        self.inner.counters.cancel.fetch_add(1, Ordering::SeqCst);
        lock(&self.inner.link).take();
    }
}
