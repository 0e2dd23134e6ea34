//! The per-client session: one active server, at most one active channel.
//!
//! Store notifications for every subscription the session holds arrive on a
//! single queue, tagged with their subscription id. An event is dispatched
//! only if its id belongs to a tracker the session still holds, so anything
//! queued before a leave or switch is silently discarded.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, json};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::engine::channels::{self, ChannelRegistry};
use crate::engine::events::{ChannelInfo, SessionEvent};
use crate::engine::identity::{IdentityProvider, ProfileStore};
use crate::engine::messages::{self, DEFAULT_WINDOW_SIZE, MessageStream};
use crate::engine::presence::PresenceTracker;
use crate::engine::validation::{MAX_MESSAGE_LENGTH, validate_server_id};
use crate::engine::{now_ms, paths};
use crate::error::{PreconditionError, SessionError, SessionResult};
use crate::store::{EventReceiver, EventSender, StoreConnection, StoreEvent, StoreEventKind};

/// Tunables shared by every session on a hub.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub window_size: usize,
    pub max_message_length: usize,
    pub heartbeat_interval: Duration,
    pub presence_ttl: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            window_size: DEFAULT_WINDOW_SIZE,
            max_message_length: MAX_MESSAGE_LENGTH,
            heartbeat_interval: Duration::from_secs(10),
            presence_ttl: Duration::from_secs(30),
        }
    }
}

struct ActiveServer {
    server_id: String,
    registry: ChannelRegistry,
    presence: PresenceTracker,
    channel: Option<ActiveChannel>,
}

struct ActiveChannel {
    channel_id: String,
    stream: MessageStream,
}

pub struct SessionManager {
    conn: Arc<StoreConnection>,
    identity: IdentityProvider,
    settings: SessionSettings,
    store_tx: EventSender,
    store_rx: EventReceiver,
    events: mpsc::UnboundedSender<SessionEvent>,
    active: Option<ActiveServer>,
}

impl SessionManager {
    /// Resolve the identity and start a session with nothing joined.
    /// The returned receiver yields [`SessionEvent::Ready`] first.
    pub fn new(
        conn: Arc<StoreConnection>,
        profiles: Box<dyn ProfileStore>,
        settings: SessionSettings,
    ) -> SessionResult<(Self, mpsc::UnboundedReceiver<SessionEvent>)> {
        let identity = IdentityProvider::load(profiles)?;
        let (store_tx, store_rx) = mpsc::unbounded_channel();
        let (events, events_rx) = mpsc::unbounded_channel();

        let session = Self {
            conn,
            identity,
            settings,
            store_tx,
            store_rx,
            events,
            active: None,
        };
        info!(uid = %session.identity.uid(), connection = %session.conn.id(), "session started");
        session.emit(SessionEvent::Ready {
            uid: session.identity.uid().to_string(),
            username: session.identity.display_name().to_string(),
            saved_servers: session.identity.saved_servers().to_vec(),
        });
        Ok((session, events_rx))
    }

    fn emit(&self, event: SessionEvent) {
        // Observer gone means nobody is listening; the session keeps working
        let _ = self.events.send(event);
    }

    fn emit_error(&self, err: &SessionError) {
        warn!(code = err.error_code(), "session error: {err}");
        self.emit(SessionEvent::error(err));
    }

    // ── Accessors ───────────────────────────────────────────────────

    pub fn uid(&self) -> &str {
        self.identity.uid()
    }

    pub fn display_name(&self) -> &str {
        self.identity.display_name()
    }

    pub fn saved_servers(&self) -> &[String] {
        self.identity.saved_servers()
    }

    pub fn active_server(&self) -> Option<&str> {
        self.active.as_ref().map(|a| a.server_id.as_str())
    }

    pub fn active_channel(&self) -> Option<&str> {
        self.active
            .as_ref()
            .and_then(|a| a.channel.as_ref())
            .map(|c| c.channel_id.as_str())
    }

    /// Channels last reported for the active server.
    pub fn channels(&self) -> &[ChannelInfo] {
        self.active
            .as_ref()
            .map(|a| a.registry.channels())
            .unwrap_or_default()
    }

    pub fn connection(&self) -> &Arc<StoreConnection> {
        &self.conn
    }

    // ── Operations ──────────────────────────────────────────────────

    /// Make `server_id` the active server. Joining the active server is a no-op.
    pub fn join_server(&mut self, server_id: &str) -> SessionResult<()> {
        let server_id = validate_server_id(server_id)?;
        if self.active_server() == Some(server_id.as_str()) {
            return Ok(());
        }
        self.leave_server()?;

        let registry = ChannelRegistry::attach(&self.conn, &server_id, self.store_tx.clone())?;
        let mut presence = PresenceTracker::subscribe(
            &self.conn,
            &server_id,
            self.identity.uid(),
            self.settings.presence_ttl,
            self.store_tx.clone(),
        )?;
        presence.announce(
            &self.conn,
            self.identity.display_name(),
            self.settings.heartbeat_interval,
        )?;

        self.active = Some(ActiveServer {
            server_id: server_id.clone(),
            registry,
            presence,
            channel: None,
        });

        if let Err(e) = self.identity.remember_server(&server_id) {
            warn!(%server_id, "failed to save server to profile: {e}");
        }
        info!(%server_id, uid = %self.identity.uid(), "joined server");
        self.emit(SessionEvent::ServerJoined { server_id });
        Ok(())
    }

    /// Release everything tied to the active server. No-op when none is active.
    pub fn leave_server(&mut self) -> SessionResult<()> {
        let Some(ActiveServer {
            server_id,
            registry,
            mut presence,
            channel,
        }) = self.active.take()
        else {
            return Ok(());
        };

        if let Some(channel) = channel {
            channel.stream.unsubscribe();
        }
        let renounced = presence.renounce(&self.conn);
        presence.unsubscribe();
        registry.detach();

        info!(%server_id, uid = %self.identity.uid(), "left server");
        self.emit(SessionEvent::ServerLeft { server_id });
        renounced?;
        Ok(())
    }

    /// Point the message feed at `channel_id` on the active server.
    pub fn switch_channel(&mut self, channel_id: &str) -> SessionResult<()> {
        let active = self
            .active
            .as_mut()
            .ok_or(PreconditionError::NoActiveServer)?;
        if active
            .channel
            .as_ref()
            .is_some_and(|c| c.channel_id == channel_id)
        {
            return Ok(());
        }
        if !active.registry.contains(channel_id) {
            return Err(PreconditionError::UnknownChannel(channel_id.to_string()).into());
        }

        if let Some(previous) = active.channel.take() {
            previous.stream.unsubscribe();
        }
        let stream = MessageStream::subscribe(
            &self.conn,
            &active.server_id,
            channel_id,
            self.settings.window_size,
            self.store_tx.clone(),
        )?;
        active.channel = Some(ActiveChannel {
            channel_id: channel_id.to_string(),
            stream,
        });

        let server_id = active.server_id.clone();
        debug!(%server_id, %channel_id, "switched channel");
        self.emit(SessionEvent::ChannelSwitched {
            server_id,
            channel_id: channel_id.to_string(),
        });
        Ok(())
    }

    /// Stamp `servers/{id}` with a creation time and join it.
    /// Existing channels of that server are kept.
    pub fn create_server(&mut self, server_id: &str) -> SessionResult<()> {
        let server_id = validate_server_id(server_id)?;
        let mut fields = Map::new();
        fields.insert("created".to_string(), json!(now_ms()));
        self.conn.update(&paths::server(&server_id), fields)?;
        info!(%server_id, "server created");
        self.join_server(&server_id)
    }

    /// Create a channel on the active server without switching to it. Returns its id.
    pub fn create_channel(&mut self, name: &str) -> SessionResult<String> {
        let active = self
            .active
            .as_ref()
            .ok_or(PreconditionError::NoActiveServer)?;
        let (channel_id, _) = channels::create_channel(&self.conn, &active.server_id, name)?;
        Ok(channel_id)
    }

    /// Post to the active channel. Returns the message's push key.
    pub fn post_message(&mut self, text: &str) -> SessionResult<String> {
        let active = self
            .active
            .as_ref()
            .ok_or(PreconditionError::NoActiveServer)?;
        let channel = active
            .channel
            .as_ref()
            .ok_or(PreconditionError::NoActiveChannel)?;
        messages::publish(
            &self.conn,
            &active.server_id,
            &channel.channel_id,
            self.identity.display_name(),
            text,
            self.settings.max_message_length,
        )
    }

    /// Change and persist the display name, re-announcing presence if joined.
    pub fn set_display_name(&mut self, name: &str) -> SessionResult<String> {
        let name = self.identity.set_display_name(name)?;
        if let Some(active) = self.active.as_mut() {
            active
                .presence
                .announce(&self.conn, &name, self.settings.heartbeat_interval)?;
        }
        info!(uid = %self.identity.uid(), username = %name, "display name changed");
        self.emit(SessionEvent::NameChanged {
            username: name.clone(),
        });
        Ok(name)
    }

    /// Leave the active server. The connection itself stays open.
    pub fn shutdown(&mut self) -> SessionResult<()> {
        debug!(uid = %self.identity.uid(), "session shutting down");
        self.leave_server()
    }

    // ── Store events ────────────────────────────────────────────────

    /// Wait for the next store notification.
    pub async fn next_store_event(&mut self) -> Option<StoreEvent> {
        self.store_rx.recv().await
    }

    /// Handle every notification already queued, including ones produced while
    /// handling. Returns how many were handled.
    pub fn process_pending(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.store_rx.try_recv() {
            self.handle_store_event(event);
            handled += 1;
        }
        handled
    }

    /// Dispatch one store notification to the tracker that owns it.
    pub fn handle_store_event(&mut self, event: StoreEvent) {
        let StoreEvent { subscription, kind } = event;
        let Some(active) = self.active.as_ref() else {
            trace!(%subscription, "dropping event, no active server");
            return;
        };

        if subscription == active.registry.subscription_id() {
            if let StoreEventKind::Value(snapshot) = kind {
                self.on_channels(snapshot);
            }
        } else if subscription == active.presence.subscription_id() {
            if let StoreEventKind::Value(snapshot) = kind {
                let users = active.presence.observe(snapshot.as_ref());
                self.emit(SessionEvent::PresenceChanged {
                    server_id: active.server_id.clone(),
                    users,
                });
            }
        } else if let Some(channel) = active
            .channel
            .as_ref()
            .filter(|c| c.stream.subscription_id() == subscription)
        {
            if let StoreEventKind::ChildAdded { key, value } = kind
                && let Some(message) = channel.stream.observe(&key, &value)
            {
                self.emit(SessionEvent::MessageAppended {
                    server_id: active.server_id.clone(),
                    channel_id: channel.channel_id.clone(),
                    message,
                });
            }
        } else {
            trace!(%subscription, "dropping event from released subscription");
        }
    }

    fn on_channels(&mut self, snapshot: Option<serde_json::Value>) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        let channels = match active.registry.observe(&self.conn, snapshot.as_ref()) {
            Ok(Some(channels)) => channels,
            Ok(None) => return,
            Err(e) => {
                self.emit_error(&e);
                return;
            }
        };

        // Channels are never deleted, but keep the invariant if one vanishes
        let vanished = active
            .channel
            .as_ref()
            .is_some_and(|c| !active.registry.contains(&c.channel_id));
        if vanished && let Some(stale) = active.channel.take() {
            stale.stream.unsubscribe();
        }

        let server_id = active.server_id.clone();
        let active_channel = active.channel.as_ref().map(|c| c.channel_id.clone());
        let first = channels.first().map(|c| c.id.clone());
        self.emit(SessionEvent::ChannelsChanged {
            server_id,
            channels,
            active_channel: active_channel.clone(),
        });

        if active_channel.is_none()
            && let Some(first) = first
            && let Err(e) = self.switch_channel(&first)
        {
            self.emit_error(&e);
        }
    }
}
