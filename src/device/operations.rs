use btleplug::api::{CharPropFlags, WriteType};
use futures::future::{self, BoxFuture};
use futures::stream::{self, BoxStream, Stream};
use futures::{FutureExt, StreamExt, TryStreamExt};
use log::debug;

use crate::device::connection::Session;
use crate::device::driver::BleRpcDriver;
use crate::device::resolver::{check_supports, Target};
use crate::error::DriverError;

impl BleRpcDriver {
    /// Subscribe to value changes of a characteristic.
    ///
    /// `request` must be empty. The stream ends when the driver is disconnected and fails (then
    /// ends) if the peripheral sends an update without a value. Notifications are turned off
    /// once the last stream for the characteristic is dropped.
    pub fn subscribe(
        &self,
        request: &[u8],
        service_id: &str,
        characteristic_id: &str,
    ) -> BoxStream<'static, Result<Vec<u8>, DriverError>> {
        let target = match validate(request, service_id, characteristic_id) {
            Ok(target) => target,
            Err(err) => return stream::once(future::ready(Err(err))).boxed(),
        };
        let driver = self.clone();

        stream::once(async move {
            let session = driver.connection.establish();
            let cancel = session.cancel.subscriptions.clone();
            debug!("Subscribing to {}", target.characteristic);

            notifications(driver, session, target).take_until(cancel.cancelled_owned())
        })
        .flatten()
        .boxed()
    }

    /// Read the current value of a characteristic. `request` must be empty.
    pub fn read(
        &self,
        request: &[u8],
        service_id: &str,
        characteristic_id: &str,
    ) -> BoxFuture<'static, Result<Vec<u8>, DriverError>> {
        let target = match validate(request, service_id, characteristic_id) {
            Ok(target) => target,
            Err(err) => return future::ready(Err(err)).boxed(),
        };
        let driver = self.clone();

        async move {
            let mut session = driver.connection.establish();
            let cancel = session.cancel.read_write.clone();

            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(DriverError::Disconnected),
                result = driver.read_value(&mut session, &target) => result,
            }
        }
        .boxed()
    }

    /// Write `request` to a characteristic and wait for the acknowledgment. The response is
    /// always empty.
    pub fn write(
        &self,
        request: &[u8],
        service_id: &str,
        characteristic_id: &str,
    ) -> BoxFuture<'static, Result<Vec<u8>, DriverError>> {
        let target = match Target::parse(service_id, characteristic_id) {
            Ok(target) => target,
            Err(err) => return future::ready(Err(err)).boxed(),
        };
        let payload = request.to_vec();
        let driver = self.clone();

        async move {
            let mut session = driver.connection.establish();
            let cancel = session.cancel.read_write.clone();

            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(DriverError::Disconnected),
                result = driver.write_value(&mut session, &target, &payload) => result.map(|_| Vec::new()),
            }
        }
        .boxed()
    }

    async fn read_value(&self, session: &mut Session, target: &Target) -> Result<Vec<u8>, DriverError> {
        let characteristic = self.resolver
            .resolve_for(session, target, CharPropFlags::READ, "read")
            .await?;

        debug!("Reading {}", characteristic.uuid);
        let characteristic = self.connection.transport().read_value(&characteristic).await?;
        characteristic.value.ok_or(DriverError::EmptyResponse)
    }

    async fn write_value(&self, session: &mut Session, target: &Target, payload: &[u8]) -> Result<(), DriverError> {
        let characteristic = self.resolver
            .resolve_for(session, target, CharPropFlags::WRITE | CharPropFlags::WRITE_WITHOUT_RESPONSE, "write")
            .await?;

        debug!("Writing {} bytes to {}", payload.len(), characteristic.uuid);
        self.connection.transport()
            .write_value(&characteristic, payload, WriteType::WithResponse)
            .await?;
        Ok(())
    }
}

fn validate(request: &[u8], service_id: &str, characteristic_id: &str) -> Result<Target, DriverError> {
    if !request.is_empty() {
        return Err(DriverError::NonEmptyRequest);
    }
    Target::parse(service_id, characteristic_id)
}

fn notifications(
    driver: BleRpcDriver,
    mut session: Session,
    target: Target,
) -> impl Stream<Item = Result<Vec<u8>, DriverError>> {
    let setup = async move {
        let characteristics = driver.resolver.resolve(&mut session, &target).await?;
        for characteristic in &characteristics {
            check_supports(characteristic, CharPropFlags::NOTIFY | CharPropFlags::INDICATE, "subscribe")?;
        }

        let transport = driver.connection.transport().clone();
        let mut guard = driver.notifications.guard(transport.clone());
        let mut updates = Vec::with_capacity(characteristics.len());
        for characteristic in &characteristics {
            // counted before subscribing, so a subscription in progress keeps notifications on
            guard.add(characteristic);
            updates.push(transport.observe_notifications(characteristic).await?);
        }

        let values = stream::select_all(updates).map(|update| -> Result<Vec<u8>, DriverError> {
            update?.value.ok_or(DriverError::EmptyResponse)
        });
        Ok::<_, DriverError>(guard.attach(values.boxed()))
    };

    stop_after_error(stream::once(setup).try_flatten())
}

// A failure terminates the whole sequence rather than just the one item.
fn stop_after_error<S, T>(stream: S) -> impl Stream<Item = Result<T, DriverError>>
where
    S: Stream<Item = Result<T, DriverError>>,
{
    stream.scan(false, |failed, item| {
        if *failed {
            return future::ready(None);
        }
        *failed = item.is_err();
        future::ready(Some(item))
    })
}
