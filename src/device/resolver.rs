use std::sync::Arc;
use btleplug::api::CharPropFlags;
use log::debug;
use uuid::Uuid;

use crate::device::connection::Session;
use crate::device::constants::parse_identifier;
use crate::device::types::Characteristic;
use crate::error::DriverError;
use crate::transport::Transport;

/// A service/characteristic pair an operation is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Target {
    pub service: Uuid,
    pub characteristic: Uuid,
}

impl Target {
    pub fn parse(service_id: &str, characteristic_id: &str) -> Result<Self, DriverError> {
        Ok(Target {
            service: parse_identifier(service_id)?,
            characteristic: parse_identifier(characteristic_id)?,
        })
    }

    fn not_found(&self) -> DriverError {
        DriverError::CharacteristicNotFound {
            service: self.service.to_string(),
            characteristic: self.characteristic.to_string(),
        }
    }
}

/// Locates characteristics on the currently connected peripheral. Nothing is cached: every call
/// runs discovery again.
#[derive(Clone)]
pub struct CharacteristicResolver {
    transport: Arc<dyn Transport>,
}

impl CharacteristicResolver {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        CharacteristicResolver { transport }
    }

    pub async fn resolve(&self, session: &mut Session, target: &Target) -> Result<Vec<Characteristic>, DriverError> {
        let device = session.connected_device().await?;

        debug!("Discovering service {} on peripheral {}", target.service, device.id);
        let services = self.transport.discover_services(&device, &[target.service]).await?;

        let mut found = Vec::new();
        // Some environments ignore the filter, so make sure to check the uuids again
        for service in services.iter().filter(|service| service.uuid == target.service) {
            let characteristics = self.transport
                .discover_characteristics(&device, service, &[target.characteristic])
                .await?;

            found.extend(characteristics.into_iter().filter(|characteristic| {
                characteristic.uuid == target.characteristic && characteristic.service_uuid == service.uuid
            }));
        }

        if found.is_empty() {
            return Err(target.not_found());
        }

        Ok(found)
    }

    /// Resolve the target and return the first match, provided it has one of the `required`
    /// properties.
    pub async fn resolve_for(
        &self,
        session: &mut Session,
        target: &Target,
        required: CharPropFlags,
        operation: &'static str,
    ) -> Result<Characteristic, DriverError> {
        let characteristic = self.resolve(session, target).await?
            .into_iter()
            .next()
            .ok_or_else(|| target.not_found())?;

        check_supports(&characteristic, required, operation)?;
        Ok(characteristic)
    }
}

pub fn check_supports(characteristic: &Characteristic, required: CharPropFlags, operation: &'static str) -> Result<(), DriverError> {
    if characteristic.supports(required) {
        Ok(())
    } else {
        Err(DriverError::UnsupportedOperation {
            operation,
            characteristic: characteristic.uuid.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;
    use tokio::time::timeout;

    use super::*;
    use crate::device::connection::ConnectionManager;
    use crate::device::constants::expand_short_uuid;
    use crate::transport::fake::FakeTransport;

    const DEADLINE: Duration = Duration::from_secs(2);

    #[test]
    fn parses_short_targets() {
        let target = Target::parse("180D", "2A37").unwrap();
        assert_eq!(target.service, expand_short_uuid(0x180D));
        assert_eq!(target.characteristic, expand_short_uuid(0x2A37));
    }

    #[tokio::test]
    async fn resolves_a_discovered_characteristic() {
        let service = expand_short_uuid(0x180D);
        let characteristic = expand_short_uuid(0x2A37);
        let fake = FakeTransport::new()
            .with_characteristic(service, characteristic, CharPropFlags::READ, Some(vec![1]));
        let transport: Arc<dyn Transport> = Arc::new(fake.clone());
        let connection = ConnectionManager::new(transport.clone(), fake.device());
        let resolver = CharacteristicResolver::new(transport);

        let mut session = connection.establish();
        let target = Target { service, characteristic };
        let found = timeout(DEADLINE, resolver.resolve(&mut session, &target)).await.unwrap().unwrap();

        assert_eq!(found.len(), 1);
        assert_eq!(found[0].uuid, characteristic);
        assert_eq!(found[0].service_uuid, service);
    }

    #[tokio::test]
    async fn missing_characteristic_is_reported() {
        let service = expand_short_uuid(0x180D);
        let fake = FakeTransport::new()
            .with_characteristic(service, expand_short_uuid(0x2A37), CharPropFlags::READ, None);
        let transport: Arc<dyn Transport> = Arc::new(fake.clone());
        let connection = ConnectionManager::new(transport.clone(), fake.device());
        let resolver = CharacteristicResolver::new(transport);

        let mut session = connection.establish();
        let target = Target { service, characteristic: expand_short_uuid(0x2A38) };
        match timeout(DEADLINE, resolver.resolve(&mut session, &target)).await.unwrap() {
            Err(DriverError::CharacteristicNotFound { characteristic, .. }) => {
                assert_eq!(characteristic, target.characteristic.to_string())
            },
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn properties_gate_operations() {
        let service = expand_short_uuid(0x180D);
        let notify_only = Characteristic::new(service, expand_short_uuid(0x2A37), CharPropFlags::NOTIFY);
        let unreported = Characteristic::new(service, expand_short_uuid(0x2A38), CharPropFlags::empty());

        assert!(check_supports(&notify_only, CharPropFlags::NOTIFY | CharPropFlags::INDICATE, "subscribe").is_ok());
        assert!(matches!(
            check_supports(&notify_only, CharPropFlags::READ, "read"),
            Err(DriverError::UnsupportedOperation { operation: "read", .. })
        ));
        assert!(check_supports(&unreported, CharPropFlags::WRITE, "write").is_ok());
    }
}
