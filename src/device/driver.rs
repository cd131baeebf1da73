use std::sync::Arc;
use futures::stream::BoxStream;
use log::info;
use tokio::sync::watch;

use crate::device::connection::{ConnectionManager, LinkState};
use crate::device::notifications::NotificationRegistry;
use crate::device::resolver::CharacteristicResolver;
use crate::device::types::DeviceHandle;
use crate::error::DriverError;
use crate::transport::Transport;

/// RPC transport over a single BLE peripheral.
///
/// Cloning is cheap and every clone drives the same connection. Reads, writes and subscriptions
/// live in `operations.rs`.
#[derive(Clone)]
pub struct BleRpcDriver {
    pub(crate) connection: ConnectionManager,
    pub(crate) resolver: CharacteristicResolver,
    pub(crate) notifications: NotificationRegistry,
}

impl BleRpcDriver {
    pub fn new<T: Transport>(transport: T, device: DeviceHandle) -> Self {
        Self::with_transport(Arc::new(transport), device)
    }

    pub fn with_transport(transport: Arc<dyn Transport>, device: DeviceHandle) -> Self {
        BleRpcDriver {
            connection: ConnectionManager::new(transport.clone(), device),
            resolver: CharacteristicResolver::new(transport),
            notifications: NotificationRegistry::default(),
        }
    }

    pub fn connection_state(&self) -> LinkState {
        self.connection.state()
    }

    pub fn connection_states(&self) -> watch::Receiver<LinkState> {
        self.connection.states()
    }

    /// Connected handles of the peripheral, starting a connection if none is running.
    ///
    /// Connecting spawns onto the current tokio runtime. Called outside of one, the stream yields
    /// [`crate::error::TransportError::NoRuntime`] instead.
    pub fn ensure_connected(&self) -> BoxStream<'static, Result<DeviceHandle, DriverError>> {
        self.connection.ensure_connected()
    }

    /// Abort everything that is in flight and drop the physical connection.
    ///
    /// Pending subscriptions complete, pending reads and writes fail with
    /// [`DriverError::Disconnected`]. Operations started afterwards connect again.
    pub fn disconnect(&self) {
        let device = self.connection.teardown();
        info!("Disconnecting from peripheral {}", device.id);
        self.connection.transport().cancel_connection(&device);
    }
}
