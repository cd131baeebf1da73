use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use futures::stream::{BoxStream, Stream};
use futures::StreamExt;
use log::debug;
use uuid::Uuid;

use crate::device::types::Characteristic;
use crate::transport::Transport;

type Subscribers = HashMap<(Uuid, Uuid), usize>;

fn lock(subscribers: &Mutex<Subscribers>) -> MutexGuard<'_, Subscribers> {
    subscribers.lock().unwrap_or_else(PoisonError::into_inner)
}

fn key(characteristic: &Characteristic) -> (Uuid, Uuid) {
    (characteristic.service_uuid, characteristic.uuid)
}

/// Live subscriptions per characteristic, shared by every clone of a driver. Notifications of a
/// characteristic are turned off once its last subscription is dropped.
#[derive(Clone, Default)]
pub(crate) struct NotificationRegistry {
    subscribers: Arc<Mutex<Subscribers>>,
}

impl NotificationRegistry {
    pub(crate) fn guard(&self, transport: Arc<dyn Transport>) -> NotificationGuard {
        NotificationGuard {
            registry: self.clone(),
            transport,
            characteristics: Vec::new(),
        }
    }

    #[cfg(test)]
    fn subscribers(&self, characteristic: &Characteristic) -> usize {
        lock(&self.subscribers).get(&key(characteristic)).copied().unwrap_or(0)
    }
}

/// The characteristics one subscription holds notifications open for.
pub(crate) struct NotificationGuard {
    registry: NotificationRegistry,
    transport: Arc<dyn Transport>,
    characteristics: Vec<Characteristic>,
}

impl NotificationGuard {
    pub(crate) fn add(&mut self, characteristic: &Characteristic) {
        *lock(&self.registry.subscribers).entry(key(characteristic)).or_insert(0) += 1;
        self.characteristics.push(characteristic.clone());
    }

    /// Keep notifications open for as long as `updates` is alive.
    pub(crate) fn attach<T: Send + 'static>(self, updates: BoxStream<'static, T>) -> BoxStream<'static, T> {
        Guarded { updates, _guard: self }.boxed()
    }
}

impl Drop for NotificationGuard {
    fn drop(&mut self) {
        let mut subscribers = lock(&self.registry.subscribers);

        for characteristic in self.characteristics.drain(..) {
            let key = key(&characteristic);
            let Some(count) = subscribers.get_mut(&key) else { continue };

            *count -= 1;
            if *count == 0 {
                subscribers.remove(&key);
                debug!("Last subscriber of {} is gone", characteristic.uuid);
                self.transport.stop_notifications(&characteristic);
            }
        }
    }
}

struct Guarded<T> {
    updates: BoxStream<'static, T>,
    _guard: NotificationGuard,
}

impl<T> Stream for Guarded<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.updates.poll_next_unpin(cx)
    }
}
