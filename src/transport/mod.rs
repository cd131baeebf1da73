use async_trait::async_trait;
use btleplug::api::WriteType;
use futures::stream::BoxStream;
use uuid::Uuid;

use crate::device::types::{Characteristic, DeviceHandle, Service};
use crate::error::TransportError;

pub mod btle;
pub mod fake;

/// The GATT primitives the driver needs from a bluetooth stack.
///
/// Implementations are bound to a single peripheral; `device` arguments identify it but do not
/// retarget the transport.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Start a physical connection. The stream yields every state transition of the connection
    /// (connecting, connected, disconnected) and stays open for as long as the link is alive.
    /// Dropping the stream abandons the attempt.
    fn connect(&self, device: &DeviceHandle) -> BoxStream<'static, Result<DeviceHandle, TransportError>>;

    async fn discover_services(&self, device: &DeviceHandle, services: &[Uuid]) -> Result<Vec<Service>, TransportError>;

    async fn discover_characteristics(
        &self,
        device: &DeviceHandle,
        service: &Service,
        characteristics: &[Uuid],
    ) -> Result<Vec<Characteristic>, TransportError>;

    /// Returns the characteristic carrying the value that was read.
    async fn read_value(&self, characteristic: &Characteristic) -> Result<Characteristic, TransportError>;

    async fn write_value(
        &self,
        characteristic: &Characteristic,
        value: &[u8],
        write_type: WriteType,
    ) -> Result<Characteristic, TransportError>;

    /// Enable notifications and stream every value update of the characteristic.
    async fn observe_notifications(
        &self,
        characteristic: &Characteristic,
    ) -> Result<BoxStream<'static, Result<Characteristic, TransportError>>, TransportError>;

    /// Turn notifications of the characteristic off again. Called once the last subscriber is
    /// gone. Must not block; implementations spawn the work if needed.
    fn stop_notifications(&self, characteristic: &Characteristic);

    /// Request physical disconnection. Must not block; implementations spawn the work if needed.
    fn cancel_connection(&self, device: &DeviceHandle);
}
