use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use log::{debug, info, warn};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::device::types::{ConnectionState, DeviceHandle};
use crate::error::{DriverError, TransportError};
use crate::transport::Transport;

/// The latest observed state of the link. A failed connection attempt is kept here so that every
/// current and future waiter sees the failure, until the next attempt replaces it.
pub type LinkState = Result<DeviceHandle, TransportError>;

/// The two cancellation channels of one connection session.
#[derive(Debug, Clone)]
pub struct SessionCancel {
    pub subscriptions: CancellationToken,
    pub read_write: CancellationToken,
}

impl SessionCancel {
    fn new() -> Self {
        SessionCancel {
            subscriptions: CancellationToken::new(),
            read_write: CancellationToken::new(),
        }
    }

    fn cancel_all(&self) {
        self.subscriptions.cancel();
        self.read_write.cancel();
    }
}

struct Attempt {
    retire: CancellationToken,
    handle: JoinHandle<()>,
}

impl Attempt {
    fn retire(self) {
        self.retire.cancel();
        self.handle.abort();
    }
}

struct ConnectionInner {
    // last handle reported for the peripheral, kept even while `states` holds a failure
    device: DeviceHandle,
    attempt: Option<Attempt>,
    cancel: SessionCancel,
}

struct Shared {
    transport: Arc<dyn Transport>,
    states: watch::Sender<LinkState>,
    inner: Mutex<ConnectionInner>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(attempt) = inner.attempt.take() {
            attempt.retire();
        }
    }
}

fn lock(inner: &Mutex<ConnectionInner>) -> MutexGuard<'_, ConnectionInner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Owns the single logical connection to one peripheral.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

/// What an operation captures when it asks for a connection: a view on the connection state and
/// the cancellation channels of the session that was current at that moment.
pub struct Session {
    states: watch::Receiver<LinkState>,
    pub cancel: SessionCancel,
}

impl Session {
    /// Wait until the peripheral is connected.
    pub async fn connected_device(&mut self) -> Result<DeviceHandle, DriverError> {
        wait_connected(&mut self.states).await
    }

    /// Every connected handle observed from now on. Ends after yielding a connection failure.
    pub fn connected_devices(self) -> BoxStream<'static, Result<DeviceHandle, DriverError>> {
        stream::unfold(Some((self.states, true)), |state| async move {
            let (mut states, first) = state?;
            if !first && states.changed().await.is_err() {
                return None;
            }

            let result = wait_connected(&mut states).await;
            let next = if result.is_ok() { Some((states, false)) } else { None };
            Some((result, next))
        }).boxed()
    }
}

async fn wait_connected(states: &mut watch::Receiver<LinkState>) -> Result<DeviceHandle, DriverError> {
    let state = states
        .wait_for(|state| match state {
            Ok(device) => device.is_connected(),
            Err(_) => true,
        })
        .await
        .map_err(|_| DriverError::Disconnected)?;

    match &*state {
        Ok(device) => Ok(device.clone()),
        Err(err) => Err(err.clone().into()),
    }
}

impl ConnectionManager {
    pub fn new(transport: Arc<dyn Transport>, device: DeviceHandle) -> Self {
        let (states, _) = watch::channel(Ok(device.clone()));
        let inner = ConnectionInner {
            device,
            attempt: None,
            cancel: SessionCancel::new(),
        };

        ConnectionManager {
            shared: Arc::new(Shared { transport, states, inner: Mutex::new(inner) }),
        }
    }

    pub fn state(&self) -> LinkState {
        self.shared.states.borrow().clone()
    }

    pub fn states(&self) -> watch::Receiver<LinkState> {
        self.shared.states.subscribe()
    }

    /// Connected handles of the peripheral, starting a connection attempt if none is running.
    pub fn ensure_connected(&self) -> BoxStream<'static, Result<DeviceHandle, DriverError>> {
        self.establish().connected_devices()
    }

    /// Start a connection attempt unless one is already connecting or connected, and capture the
    /// session the caller belongs to.
    pub fn establish(&self) -> Session {
        let mut inner = lock(&self.shared.inner);

        let busy = match &*self.shared.states.borrow() {
            Ok(device) => device.is_connecting() || device.is_connected(),
            Err(_) => false,
        };

        if !busy {
            if let Some(attempt) = inner.attempt.take() {
                debug!("Retiring previous connection attempt");
                attempt.retire();
            }
            self.start_attempt(&mut inner);
        }

        Session {
            states: self.shared.states.subscribe(),
            cancel: inner.cancel.clone(),
        }
    }

    fn start_attempt(&self, inner: &mut ConnectionInner) {
        let device = inner.device.with_state(ConnectionState::Connecting);
        info!("Connecting to peripheral {}...", device.id);

        // Cancellation from the previous session must not reach operations of this one.
        inner.cancel = SessionCancel::new();
        inner.device = device.clone();
        self.shared.states.send_replace(Ok(device.clone()));

        let Ok(runtime) = Handle::try_current() else {
            warn!("No runtime available to connect to peripheral {}", device.id);
            inner.device = device.with_state(ConnectionState::Disconnected);
            self.shared.states.send_replace(Err(TransportError::NoRuntime));
            return;
        };

        let retire = CancellationToken::new();
        let connection = self.shared.transport.connect(&device);
        let handle = runtime.spawn(forward_states(
            Arc::downgrade(&self.shared),
            retire.clone(),
            inner.cancel.clone(),
            connection,
        ));

        inner.attempt = Some(Attempt { retire, handle });
    }

    /// Retire the running attempt, signal both cancellation channels and publish the peripheral
    /// as disconnected. Returns the handle the physical disconnect should be requested for.
    pub(crate) fn teardown(&self) -> DeviceHandle {
        let mut inner = lock(&self.shared.inner);

        if let Some(attempt) = inner.attempt.take() {
            debug!("Retiring connection attempt");
            attempt.retire();
        }

        inner.cancel.subscriptions.cancel();
        inner.cancel.read_write.cancel();

        let device = inner.device.with_state(ConnectionState::Disconnected);
        inner.device = device.clone();
        self.shared.states.send_replace(Ok(device.clone()));
        device
    }

    pub(crate) fn transport(&self) -> &Arc<dyn Transport> {
        &self.shared.transport
    }
}

async fn forward_states(
    shared: Weak<Shared>,
    retire: CancellationToken,
    cancel: SessionCancel,
    mut connection: BoxStream<'static, Result<DeviceHandle, TransportError>>,
) {
    let mut was_connected = false;

    loop {
        let item = tokio::select! {
            biased;
            _ = retire.cancelled() => return,
            item = connection.next() => item,
        };

        let Some(strong) = shared.upgrade() else { return };
        let mut inner = lock(&strong.inner);

        // retiring happens under this lock, so a retired attempt never publishes
        if retire.is_cancelled() {
            return;
        }

        match item {
            Some(Ok(device)) => {
                debug!("Peripheral {} is now {:?}", device.id, device.state);

                if device.is_connected() {
                    if !was_connected {
                        info!("Connected to peripheral {}", device.id);
                    }
                    was_connected = true;
                } else if was_connected && device.state == ConnectionState::Disconnected {
                    warn!("Connection to peripheral {} lost", device.id);
                    was_connected = false;
                    cancel.cancel_all();
                }

                inner.device = device.clone();
                strong.states.send_replace(Ok(device));
            },
            Some(Err(err)) => {
                warn!("Connecting to peripheral {} failed: {}", inner.device.id, err);
                if was_connected {
                    cancel.cancel_all();
                }
                inner.device = inner.device.with_state(ConnectionState::Disconnected);
                strong.states.send_replace(Err(err));
                return;
            },
            None => {
                let device = inner.device.with_state(ConnectionState::Disconnected);
                inner.device = device.clone();

                if was_connected {
                    warn!("Connection to peripheral {} closed", device.id);
                    cancel.cancel_all();
                    strong.states.send_replace(Ok(device));
                } else {
                    warn!("Connection attempt for peripheral {} ended before connecting", device.id);
                    strong.states.send_replace(Err(TransportError::NotConnected));
                }
                return;
            },
        }
    }
}
