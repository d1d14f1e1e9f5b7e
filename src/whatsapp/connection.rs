//! Connection lifecycle for the single WhatsApp transport session.
//!
//! State machine:
//!
//! ```text
//! Disconnected -> Connecting -> Connected
//! Connected -> ReconnectScheduled -> Connecting      (recoverable close)
//! Connecting -> ReconnectScheduled                  (watchdog timeout)
//! any -> LoggedOut                                  (session invalidated)
//! ```
//!
//! All state lives behind one sync [`Mutex`] with await-free critical
//! sections. Timers are spawned tasks whose handles sit in that state; every
//! timer re-checks its own id and the `stopping` flag under the lock before
//! acting, so a timer that wakes after [`ConnectionManager::stop`] is a no-op.

use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::events::{CloseReason, TransportEvent};
use super::jid::Jid;
use super::transport::{Socket, Transport};
use crate::channel::{ChannelError, InboundMessage, MessageSender};
use crate::config::ConnectionConfig;

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No session and nothing scheduled.
    Disconnected,
    /// Handshake in progress.
    Connecting,
    /// Session open.
    Connected,
    /// A reconnect timer is pending.
    ReconnectScheduled,
    /// Credentials invalidated; waits for an operator to re-link.
    ///
    /// Terminal for automatic recovery: no timer leaves this state. After
    /// `hearth link` the running process must call `connect()` again, which
    /// in practice means restarting `hearth start`.
    LoggedOut,
}

/// Callback run every time the connection opens.
pub type OpenHook = Arc<dyn Fn() + Send + Sync>;

/// Watchdog and reconnect timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionSettings {
    /// Maximum time spent in `Connecting` before the socket is torn down.
    pub connecting_timeout: Duration,
    /// Delay before reconnecting after a recoverable close.
    pub reconnect_delay: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self::from(&ConnectionConfig::default())
    }
}

impl From<&ConnectionConfig> for ConnectionSettings {
    fn from(config: &ConnectionConfig) -> Self {
        Self {
            connecting_timeout: config.connecting_timeout(),
            reconnect_delay: config.reconnect_delay(),
        }
    }
}

struct Timer {
    id: u64,
    handle: JoinHandle<()>,
}

impl Timer {
    fn cancel(self) {
        self.handle.abort();
    }
}

struct Inner {
    state: ConnectionState,
    stopping: bool,
    /// Bumped by every `stop()`; a handshake that straddles a stop is discarded.
    stop_epoch: u64,
    /// Bumped by every handshake; events from older sockets are ignored.
    generation: u64,
    next_timer_id: u64,
    socket: Option<Arc<dyn Socket>>,
    pump: Option<JoinHandle<()>>,
    watchdog: Option<Timer>,
    reconnect: Option<Timer>,
    last_qr: Option<String>,
}

impl Inner {
    fn timer_id(&mut self) -> u64 {
        self.next_timer_id = self.next_timer_id.wrapping_add(1);
        self.next_timer_id
    }

    fn cancel_timers(&mut self) {
        if let Some(timer) = self.watchdog.take() {
            timer.cancel();
        }
        if let Some(timer) = self.reconnect.take() {
            timer.cancel();
        }
    }
}

struct Shared {
    transport: Arc<dyn Transport>,
    settings: ConnectionSettings,
    inbound_tx: mpsc::Sender<InboundMessage>,
    on_open: Mutex<Option<OpenHook>>,
    inner: Mutex<Inner>,
    /// Serializes handshakes.
    connect_lock: tokio::sync::Mutex<()>,
    /// Serializes sends over the single session.
    send_lock: tokio::sync::Mutex<()>,
}

/// Owns the transport session and its reconnect policy.
///
/// Cheap to clone; all clones share one state machine.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("state", &self.state())
            .field("settings", &self.shared.settings)
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    /// Create a manager. Inbound chat messages are forwarded to `inbound_tx`.
    pub fn new(
        transport: Arc<dyn Transport>,
        settings: ConnectionSettings,
        inbound_tx: mpsc::Sender<InboundMessage>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                transport,
                settings,
                inbound_tx,
                on_open: Mutex::new(None),
                inner: Mutex::new(Inner {
                    state: ConnectionState::Disconnected,
                    stopping: false,
                    stop_epoch: 0,
                    generation: 0,
                    next_timer_id: 0,
                    socket: None,
                    pump: None,
                    watchdog: None,
                    reconnect: None,
                    last_qr: None,
                }),
                connect_lock: tokio::sync::Mutex::new(()),
                send_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    fn from_weak(weak: &Weak<Shared>) -> Option<Self> {
        weak.upgrade().map(|shared| Self { shared })
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.shared.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Install the hook run on every transition to `Connected`.
    pub fn set_on_open(&self, hook: OpenHook) {
        *self.shared.on_open.lock().unwrap_or_else(|e| e.into_inner()) = Some(hook);
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.inner().state
    }

    /// Whether the session is open.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Whether `stop()` is in effect.
    pub fn is_stopping(&self) -> bool {
        self.inner().stopping
    }

    /// The open socket, if connected.
    pub fn socket(&self) -> Option<Arc<dyn Socket>> {
        let inner = self.inner();
        match inner.state {
            ConnectionState::Connected => inner.socket.clone(),
            _ => None,
        }
    }

    /// Last QR payload announced while unlinked.
    pub fn last_qr(&self) -> Option<String> {
        self.inner().last_qr.clone()
    }

    /// Clear the `stopping` flag without connecting.
    pub fn resume(&self) {
        self.inner().stopping = false;
    }

    /// Connect, or return the open socket when already connected.
    ///
    /// Clears a previous `stop()`. A failed handshake schedules a reconnect
    /// before the error is returned.
    ///
    /// # Errors
    ///
    /// Returns the handshake error, or [`ChannelError::NotConnected`] when
    /// `stop()` raced the handshake.
    pub async fn connect(&self) -> Result<Arc<dyn Socket>, ChannelError> {
        self.resume();
        self.establish().await
    }

    async fn establish(&self) -> Result<Arc<dyn Socket>, ChannelError> {
        let _handshake = self.shared.connect_lock.lock().await;

        let (generation, epoch) = {
            let mut inner = self.inner();
            if inner.state == ConnectionState::Connected {
                if let Some(ref socket) = inner.socket {
                    return Ok(Arc::clone(socket));
                }
            }
            if inner.stopping {
                return Err(ChannelError::NotConnected);
            }
            // A pending timer belongs to the session being replaced.
            inner.cancel_timers();
            if let Some(old) = inner.socket.take() {
                old.close();
            }
            if let Some(pump) = inner.pump.take() {
                pump.abort();
            }
            inner.generation = inner.generation.wrapping_add(1);
            inner.state = ConnectionState::Connecting;
            (inner.generation, inner.stop_epoch)
        };

        debug!(generation, "starting transport handshake");
        let session = match self.shared.transport.connect().await {
            Ok(session) => session,
            Err(e) => {
                warn!(error = %e, "transport handshake failed");
                {
                    let mut inner = self.inner();
                    if inner.generation == generation && inner.state == ConnectionState::Connecting
                    {
                        inner.state = ConnectionState::Disconnected;
                    }
                }
                self.schedule_reconnect(self.shared.settings.reconnect_delay, "connect failed");
                return Err(e);
            }
        };

        let mut inner = self.inner();
        if inner.stop_epoch != epoch || inner.generation != generation {
            debug!(generation, "discarding handshake that raced stop()");
            session.socket.close();
            return Err(ChannelError::NotConnected);
        }
        inner.socket = Some(Arc::clone(&session.socket));
        inner.pump = Some(tokio::spawn(pump_events(
            Arc::downgrade(&self.shared),
            generation,
            session.events,
        )));
        Ok(session.socket)
    }

    /// Stop: cancel both timers, close the socket, and refuse further
    /// automatic reconnects until `connect()` or `resume()`. Idempotent.
    pub fn stop(&self) {
        let mut inner = self.inner();
        inner.stopping = true;
        inner.stop_epoch = inner.stop_epoch.wrapping_add(1);
        inner.cancel_timers();
        if let Some(socket) = inner.socket.take() {
            socket.close();
        }
        if let Some(pump) = inner.pump.take() {
            pump.abort();
        }
        if inner.state != ConnectionState::LoggedOut {
            inner.state = ConnectionState::Disconnected;
        }
        info!("whatsapp connection stopped");
    }

    /// Schedule one reconnect after `delay`.
    ///
    /// No-op while a reconnect is already pending, while stopping, or after
    /// a logout.
    pub fn schedule_reconnect(&self, delay: Duration, reason: &str) {
        let mut inner = self.inner();
        if inner.stopping
            || matches!(
                inner.state,
                ConnectionState::ReconnectScheduled | ConnectionState::LoggedOut
            )
        {
            debug!(reason, state = ?inner.state, stopping = inner.stopping, "reconnect not scheduled");
            return;
        }

        inner.cancel_timers();
        inner.state = ConnectionState::ReconnectScheduled;
        let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        info!(delay_ms, reason, "reconnect scheduled");

        let id = inner.timer_id();
        let weak = Arc::downgrade(&self.shared);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(manager) = Self::from_weak(&weak) {
                manager.fire_reconnect(id).await;
            }
        });
        inner.reconnect = Some(Timer { id, handle });
    }

    async fn fire_reconnect(&self, id: u64) {
        {
            let mut inner = self.inner();
            if inner.reconnect.as_ref().map(|t| t.id) != Some(id) {
                return;
            }
            // Detach rather than abort: this task is the timer.
            inner.reconnect = None;
            if inner.stopping {
                return;
            }
            inner.state = ConnectionState::Disconnected;
        }
        if let Err(e) = self.establish().await {
            debug!(error = %e, "reconnect attempt failed");
        }
    }

    fn arm_watchdog(&self, inner: &mut Inner) {
        if inner.watchdog.is_some() {
            return;
        }
        let id = inner.timer_id();
        let weak = Arc::downgrade(&self.shared);
        let timeout = self.shared.settings.connecting_timeout;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(manager) = Self::from_weak(&weak) {
                manager.fire_watchdog(id);
            }
        });
        inner.watchdog = Some(Timer { id, handle });
    }

    fn fire_watchdog(&self, id: u64) {
        let socket = {
            let mut inner = self.inner();
            if inner.watchdog.as_ref().map(|t| t.id) != Some(id) {
                return;
            }
            inner.watchdog = None;
            if inner.stopping {
                return;
            }
            inner.socket.take()
        };

        let timeout_ms =
            u64::try_from(self.shared.settings.connecting_timeout.as_millis()).unwrap_or(u64::MAX);
        warn!(timeout_ms, "connection stuck in connecting state");
        self.schedule_reconnect(Duration::ZERO, "connecting timeout");
        if let Some(socket) = socket {
            socket.close();
        }
    }

    async fn dispatch(&self, generation: u64, event: TransportEvent) {
        match event {
            TransportEvent::Message(msg) => {
                if self.inner().generation != generation {
                    return;
                }
                if self.shared.inbound_tx.send(msg).await.is_err() {
                    debug!("inbound receiver dropped");
                }
            }
            TransportEvent::Connecting => self.on_connecting(generation),
            TransportEvent::Open => self.on_open(generation),
            TransportEvent::Close(reason) => self.on_close(generation, reason),
            TransportEvent::Qr(code) => {
                let mut inner = self.inner();
                if inner.generation == generation {
                    info!("device not linked; run `hearth link` to scan the QR code");
                    inner.last_qr = Some(code);
                }
            }
        }
    }

    fn on_connecting(&self, generation: u64) {
        let mut inner = self.inner();
        if inner.generation != generation || inner.stopping {
            return;
        }
        if inner.state != ConnectionState::ReconnectScheduled {
            inner.state = ConnectionState::Connecting;
        }
        self.arm_watchdog(&mut inner);
    }

    fn on_open(&self, generation: u64) {
        {
            let mut inner = self.inner();
            if inner.generation != generation || inner.stopping {
                return;
            }
            inner.cancel_timers();
            inner.state = ConnectionState::Connected;
            inner.last_qr = None;
        }
        info!("whatsapp connection open");

        let hook = self
            .shared
            .on_open
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(hook) = hook {
            hook();
        }
    }

    fn on_close(&self, generation: u64, reason: CloseReason) {
        {
            let mut inner = self.inner();
            if inner.generation != generation {
                return;
            }
            if let Some(timer) = inner.watchdog.take() {
                timer.cancel();
            }

            if reason.is_logged_out() {
                error!("whatsapp session logged out; re-link with `hearth link`, then restart");
                inner.state = ConnectionState::LoggedOut;
                if let Some(timer) = inner.reconnect.take() {
                    timer.cancel();
                }
                if let Some(socket) = inner.socket.take() {
                    socket.close();
                }
                return;
            }

            if matches!(
                inner.state,
                ConnectionState::Connected | ConnectionState::Connecting
            ) {
                inner.state = ConnectionState::Disconnected;
            }
        }

        warn!(?reason, "whatsapp connection closed");
        self.schedule_reconnect(self.shared.settings.reconnect_delay, "connection close");
    }

    /// Send `text` to `recipient` (JID or phone number) over the open session.
    ///
    /// Sends are serialized so two callers never interleave on one session.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::InvalidRecipient`] for malformed or non-direct
    /// recipients, [`ChannelError::NotConnected`] when no session is open, or
    /// the transport's error.
    pub async fn send_text(&self, recipient: &str, text: &str) -> Result<(), ChannelError> {
        let jid = Jid::parse_direct(recipient)?;
        let _serial = self.shared.send_lock.lock().await;
        let socket = self.socket().ok_or(ChannelError::NotConnected)?;
        socket.send_text(&jid, text).await
    }

    /// Show a typing indicator to `recipient`. Best effort.
    pub async fn send_typing(&self, recipient: &str) {
        let Ok(jid) = Jid::parse_direct(recipient) else {
            return;
        };
        if let Some(socket) = self.socket() {
            socket.send_typing(&jid).await;
        }
    }
}

#[async_trait]
impl MessageSender for ConnectionManager {
    async fn send_message(&self, user_id: &str, text: &str) -> Result<(), ChannelError> {
        self.send_text(user_id, text).await
    }

    fn is_ready(&self) -> bool {
        self.is_connected()
    }
}

/// Drain one socket's events into the manager. A closed stream counts as a
/// close so the reconnect policy still applies.
async fn pump_events(
    weak: Weak<Shared>,
    generation: u64,
    mut events: mpsc::Receiver<TransportEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(manager) = ConnectionManager::from_weak(&weak) else {
            return;
        };
        manager.dispatch(generation, event).await;
    }
    if let Some(manager) = ConnectionManager::from_weak(&weak) {
        let reason = CloseReason::StreamErrored("event stream ended".to_owned());
        manager.dispatch(generation, TransportEvent::Close(reason)).await;
    }
}
