use std::future::Future;
use std::time::Duration;
use btleplug::api::CharPropFlags;
use futures::StreamExt;
use tokio::time::{sleep, timeout};

use blerpc_driver::device::constants::expand_short_uuid;
use blerpc_driver::device::driver::BleRpcDriver;
use blerpc_driver::device::types::ConnectionState;
use blerpc_driver::error::DriverError;
use blerpc_driver::transport::fake::FakeTransport;

const DEADLINE: Duration = Duration::from_secs(2);
const SERVICE: &str = "180D";
const MEASUREMENT: &str = "2A37";
const CONTROL: &str = "2A39";
const LOCATION: &str = "2A38";

fn peripheral() -> FakeTransport {
    let service = expand_short_uuid(0x180D);
    FakeTransport::new()
        .with_characteristic(service, expand_short_uuid(0x2A37), CharPropFlags::NOTIFY, None)
        .with_notifications(service, expand_short_uuid(0x2A37), vec![Some(b"first".to_vec()), Some(b"second".to_vec())])
        .with_characteristic(service, expand_short_uuid(0x2A38), CharPropFlags::READ, Some(b"chest".to_vec()))
        .with_characteristic(service, expand_short_uuid(0x2A39), CharPropFlags::WRITE, None)
}

fn driver(fake: &FakeTransport) -> BleRpcDriver {
    BleRpcDriver::new(fake.clone(), fake.device())
}

async fn wait_until<F: Fn() -> bool>(condition: F) {
    timeout(DEADLINE, async {
        while !condition() {
            sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("condition was not reached in time");
}

async fn within<T>(future: impl Future<Output = T>) -> T {
    timeout(DEADLINE, future).await.expect("operation did not finish in time")
}

#[tokio::test]
async fn read_returns_the_characteristic_value() {
    let fake = peripheral();
    let value = within(driver(&fake).read(&[], SERVICE, LOCATION)).await.unwrap();

    assert_eq!(value, b"chest".to_vec());
    assert_eq!(fake.connect_calls(), 1);
    assert_eq!(fake.read_calls(), 1);
}

#[tokio::test]
async fn non_empty_requests_never_reach_the_transport() {
    let fake = peripheral();
    let driver = driver(&fake);

    let read = within(driver.read(b"x", SERVICE, LOCATION)).await;
    assert!(matches!(read, Err(DriverError::NonEmptyRequest)));

    let mut updates = driver.subscribe(&[1, 2, 3], SERVICE, MEASUREMENT);
    assert!(matches!(within(updates.next()).await, Some(Err(DriverError::NonEmptyRequest))));
    assert!(within(updates.next()).await.is_none());

    assert_eq!(fake.transport_calls(), 0);
}

#[tokio::test]
async fn write_answers_with_an_empty_payload() {
    let fake = peripheral();
    let driver = driver(&fake);

    for payload in [Vec::new(), vec![0x01], vec![0xab; 512]] {
        let response = within(driver.write(&payload, SERVICE, CONTROL)).await.unwrap();
        assert!(response.is_empty());
    }

    assert_eq!(fake.written(), vec![Vec::new(), vec![0x01], vec![0xab; 512]]);
    assert_eq!(fake.connect_calls(), 1);
}

#[tokio::test]
async fn read_without_value_is_an_empty_response() {
    let service = expand_short_uuid(0x180D);
    let fake = FakeTransport::new()
        .with_characteristic(service, expand_short_uuid(0x2A38), CharPropFlags::READ, None);

    let read = within(driver(&fake).read(&[], SERVICE, LOCATION)).await;
    assert!(matches!(read, Err(DriverError::EmptyResponse)));
}

#[tokio::test]
async fn subscription_yields_updates_in_order_and_stays_open() {
    let fake = peripheral();
    let mut updates = driver(&fake).subscribe(&[], SERVICE, MEASUREMENT);

    assert_eq!(within(updates.next()).await.unwrap().unwrap(), b"first".to_vec());
    assert_eq!(within(updates.next()).await.unwrap().unwrap(), b"second".to_vec());
    assert!(timeout(Duration::from_millis(50), updates.next()).await.is_err());
}

#[tokio::test]
async fn update_without_value_ends_the_subscription() {
    let service = expand_short_uuid(0x180D);
    let measurement = expand_short_uuid(0x2A37);
    let fake = FakeTransport::new()
        .with_notifications(service, measurement, vec![Some(vec![1]), None, Some(vec![2])]);
    let mut updates = driver(&fake).subscribe(&[], SERVICE, MEASUREMENT);

    assert_eq!(within(updates.next()).await.unwrap().unwrap(), vec![1]);
    assert!(matches!(within(updates.next()).await, Some(Err(DriverError::EmptyResponse))));
    assert!(within(updates.next()).await.is_none());
    assert_eq!(fake.unsubscribe_calls(), 0);

    drop(updates);
    assert_eq!(fake.unsubscribe_calls(), 1);
}

#[tokio::test]
async fn disconnect_completes_every_subscription() {
    let fake = peripheral();
    let driver = driver(&fake);

    let first = tokio::spawn(driver.subscribe(&[], SERVICE, MEASUREMENT).collect::<Vec<_>>());
    let second = tokio::spawn(driver.subscribe(&[], SERVICE, MEASUREMENT).collect::<Vec<_>>());
    wait_until(|| fake.observe_calls() == 2).await;

    driver.disconnect();

    for subscription in [first, second] {
        let updates = within(subscription).await.unwrap();
        assert!(updates.iter().all(|update| update.is_ok()));
    }
    assert_eq!(fake.cancel_calls(), 1);
    assert_eq!(fake.unsubscribe_calls(), 1);
}

#[tokio::test]
async fn notifications_stay_on_until_the_last_subscription_is_dropped() {
    let fake = peripheral();
    let driver = driver(&fake);

    let mut first = driver.subscribe(&[], SERVICE, MEASUREMENT);
    let mut second = driver.subscribe(&[], SERVICE, MEASUREMENT).take(1);
    assert_eq!(within(first.next()).await.unwrap().unwrap(), b"first".to_vec());
    assert_eq!(within(second.next()).await.unwrap().unwrap(), b"first".to_vec());
    assert!(within(second.next()).await.is_none());

    drop(second);
    assert_eq!(fake.unsubscribe_calls(), 0);
    assert_eq!(within(first.next()).await.unwrap().unwrap(), b"second".to_vec());

    drop(first);
    assert_eq!(fake.unsubscribe_calls(), 1);
    assert_eq!(fake.observe_calls(), 2);
}

#[tokio::test]
async fn disconnect_fails_a_pending_read() {
    let fake = peripheral();
    fake.hold_reads(true);
    let driver = driver(&fake);

    let read = tokio::spawn(driver.read(&[], SERVICE, LOCATION));
    wait_until(|| fake.read_calls() == 1).await;

    driver.disconnect();
    assert!(matches!(within(read).await.unwrap(), Err(DriverError::Disconnected)));
}

#[tokio::test]
async fn disconnect_fails_a_pending_write() {
    let fake = peripheral();
    fake.hold_writes(true);
    let driver = driver(&fake);

    let write = tokio::spawn(driver.write(b"payload", SERVICE, CONTROL));
    wait_until(|| fake.write_calls() == 1).await;

    driver.disconnect();
    assert!(matches!(within(write).await.unwrap(), Err(DriverError::Disconnected)));
}

#[tokio::test]
async fn disconnect_while_connecting_fails_reads() {
    let fake = peripheral();
    fake.hold_connection();
    let driver = driver(&fake);

    let read = tokio::spawn(driver.read(&[], SERVICE, LOCATION));
    wait_until(|| fake.connect_calls() == 1).await;

    driver.disconnect();
    assert!(matches!(within(read).await.unwrap(), Err(DriverError::Disconnected)));
    assert_eq!(fake.read_calls(), 0);
}

#[tokio::test]
async fn operations_after_disconnect_reconnect() {
    let fake = peripheral();
    let driver = driver(&fake);

    within(driver.read(&[], SERVICE, LOCATION)).await.unwrap();
    driver.disconnect();
    assert_eq!(driver.connection_state().unwrap().state, ConnectionState::Disconnected);

    let value = within(driver.read(&[], SERVICE, LOCATION)).await.unwrap();
    assert_eq!(value, b"chest".to_vec());
    assert_eq!(fake.connect_calls(), 2);
}

#[tokio::test]
async fn concurrent_operations_share_one_connection() {
    let fake = peripheral();
    fake.hold_connection();
    let driver = driver(&fake);

    let read = tokio::spawn(driver.read(&[], SERVICE, LOCATION));
    let write = tokio::spawn(driver.write(&[7], SERVICE, CONTROL));
    let mut first = driver.ensure_connected();
    let mut second = driver.ensure_connected();
    wait_until(|| fake.connect_calls() == 1).await;

    fake.release_connection();
    assert_eq!(within(read).await.unwrap().unwrap(), b"chest".to_vec());
    assert!(within(write).await.unwrap().unwrap().is_empty());

    let first = within(first.next()).await.unwrap().unwrap();
    let second = within(second.next()).await.unwrap().unwrap();
    assert_eq!(first.id, second.id);
    assert_eq!(fake.connect_calls(), 1);
}

#[tokio::test]
async fn missing_characteristic_performs_no_action() {
    let fake = peripheral();
    let driver = driver(&fake);

    let read = within(driver.read(&[], SERVICE, "2A99")).await;
    assert!(matches!(read, Err(DriverError::CharacteristicNotFound { .. })));

    let write = within(driver.write(&[1], SERVICE, "2A99")).await;
    assert!(matches!(write, Err(DriverError::CharacteristicNotFound { .. })));

    let mut updates = driver.subscribe(&[], "180F", MEASUREMENT);
    assert!(matches!(within(updates.next()).await, Some(Err(DriverError::CharacteristicNotFound { .. }))));

    assert_eq!(fake.read_calls() + fake.write_calls() + fake.observe_calls(), 0);
    drop(updates);
    assert_eq!(fake.unsubscribe_calls(), 0);
}

#[tokio::test]
async fn operations_respect_characteristic_properties() {
    let fake = peripheral();
    let driver = driver(&fake);

    let read = within(driver.read(&[], SERVICE, CONTROL)).await;
    assert!(matches!(read, Err(DriverError::UnsupportedOperation { operation: "read", .. })));

    let write = within(driver.write(&[1], SERVICE, LOCATION)).await;
    assert!(matches!(write, Err(DriverError::UnsupportedOperation { operation: "write", .. })));

    assert_eq!(fake.read_calls() + fake.write_calls(), 0);
}

#[tokio::test]
async fn invalid_identifiers_are_rejected_up_front() {
    let fake = peripheral();
    let read = within(driver(&fake).read(&[], "heart rate", LOCATION)).await;

    assert!(matches!(read, Err(DriverError::InvalidIdentifier { .. })));
    assert_eq!(fake.transport_calls(), 0);
}

#[tokio::test]
async fn link_loss_fails_pending_reads_and_ends_subscriptions() {
    let fake = peripheral();
    fake.hold_reads(true);
    let driver = driver(&fake);

    let subscription = tokio::spawn(driver.subscribe(&[], SERVICE, MEASUREMENT).collect::<Vec<_>>());
    let read = tokio::spawn(driver.read(&[], SERVICE, LOCATION));
    wait_until(|| fake.read_calls() == 1 && fake.observe_calls() == 1).await;

    fake.drop_link();

    assert!(matches!(within(read).await.unwrap(), Err(DriverError::Disconnected)));
    let updates = within(subscription).await.unwrap();
    assert!(updates.iter().all(|update| update.is_ok()));
    assert_eq!(fake.cancel_calls(), 0);
    assert_eq!(fake.unsubscribe_calls(), 1);
}
