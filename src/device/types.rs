use btleplug::api::CharPropFlags;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// A reference to the remote peripheral together with the connection state it was last seen in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceHandle {
    pub id: Uuid,
    pub state: ConnectionState,
}

impl DeviceHandle {
    pub fn new(id: Uuid) -> Self {
        DeviceHandle { id, state: ConnectionState::Disconnected }
    }

    pub fn with_state(&self, state: ConnectionState) -> Self {
        DeviceHandle { id: self.id, state }
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn is_connecting(&self) -> bool {
        self.state == ConnectionState::Connecting
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Service {
    pub uuid: Uuid,
}

/// A characteristic discovered on the connected peripheral, optionally carrying the value that
/// the transport last read or received for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Characteristic {
    pub service_uuid: Uuid,
    pub uuid: Uuid,
    pub properties: CharPropFlags,
    pub value: Option<Vec<u8>>,
}

impl Characteristic {
    pub fn new(service_uuid: Uuid, uuid: Uuid, properties: CharPropFlags) -> Self {
        Characteristic { service_uuid, uuid, properties, value: None }
    }

    pub fn with_value(&self, value: Option<Vec<u8>>) -> Self {
        Characteristic { value, ..self.clone() }
    }

    // Transports that do not report properties leave this empty; treat that as "anything goes".
    pub fn supports(&self, required: CharPropFlags) -> bool {
        self.properties.is_empty() || self.properties.intersects(required)
    }
}
