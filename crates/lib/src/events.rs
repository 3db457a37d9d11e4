//! Dispatch event routing.
//!
//! The session hands every DISPATCH to an [`EventRouter`]; the router looks the
//! event name up in a fixed [`EventKind`] table and calls the handlers
//! registered for that kind, then the catch-all handlers. Handlers run on the
//! receive loop and must not block; long work belongs on a spawned task or
//! behind a channel (see [`ChannelHandler`]).

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Known dispatch event names. Anything else maps to [`EventKind::Other`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Ready,
    Resumed,
    GuildCreate,
    GuildUpdate,
    GuildDelete,
    GuildMemberAdd,
    GuildMemberUpdate,
    GuildMemberRemove,
    ChannelCreate,
    ChannelUpdate,
    ChannelDelete,
    MessageCreate,
    MessageUpdate,
    MessageDelete,
    MessageReactionAdd,
    MessageReactionRemove,
    TypingStart,
    PresenceUpdate,
    InteractionCreate,
    UserUpdate,
    Other,
}

impl EventKind {
    pub fn from_name(name: &str) -> Self {
        match name {
            "READY" => Self::Ready,
            "RESUMED" => Self::Resumed,
            "GUILD_CREATE" => Self::GuildCreate,
            "GUILD_UPDATE" => Self::GuildUpdate,
            "GUILD_DELETE" => Self::GuildDelete,
            "GUILD_MEMBER_ADD" => Self::GuildMemberAdd,
            "GUILD_MEMBER_UPDATE" => Self::GuildMemberUpdate,
            "GUILD_MEMBER_REMOVE" => Self::GuildMemberRemove,
            "CHANNEL_CREATE" => Self::ChannelCreate,
            "CHANNEL_UPDATE" => Self::ChannelUpdate,
            "CHANNEL_DELETE" => Self::ChannelDelete,
            "MESSAGE_CREATE" => Self::MessageCreate,
            "MESSAGE_UPDATE" => Self::MessageUpdate,
            "MESSAGE_DELETE" => Self::MessageDelete,
            "MESSAGE_REACTION_ADD" => Self::MessageReactionAdd,
            "MESSAGE_REACTION_REMOVE" => Self::MessageReactionRemove,
            "TYPING_START" => Self::TypingStart,
            "PRESENCE_UPDATE" => Self::PresenceUpdate,
            "INTERACTION_CREATE" => Self::InteractionCreate,
            "USER_UPDATE" => Self::UserUpdate,
            _ => Self::Other,
        }
    }
}

/// One decoded dispatch, owned (for handlers that forward events elsewhere).
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchEvent {
    pub kind: EventKind,
    pub name: String,
    pub payload: Value,
}

/// Receives dispatch events. Called once per DISPATCH, in receipt order.
pub trait EventHandler: Send + Sync {
    fn on_event(&self, name: &str, payload: &Value);
}

impl<F> EventHandler for F
where
    F: Fn(&str, &Value) + Send + Sync,
{
    fn on_event(&self, name: &str, payload: &Value) {
        self(name, payload)
    }
}

/// Forwards each dispatch, owned, into an unbounded channel.
pub struct ChannelHandler(pub mpsc::UnboundedSender<DispatchEvent>);

impl EventHandler for ChannelHandler {
    fn on_event(&self, name: &str, payload: &Value) {
        let event = DispatchEvent {
            kind: EventKind::from_name(name),
            name: name.to_string(),
            payload: payload.clone(),
        };
        if self.0.send(event).is_err() {
            log::debug!("event receiver dropped, discarding {}", name);
        }
    }
}

/// Handler table keyed by [`EventKind`]. Built once, then shared read-only with the session.
#[derive(Default, Clone)]
pub struct EventRouter {
    table: HashMap<EventKind, Vec<Arc<dyn EventHandler>>>,
    any: Vec<Arc<dyn EventHandler>>,
}

impl EventRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for one event kind.
    pub fn on(mut self, kind: EventKind, handler: impl EventHandler + 'static) -> Self {
        self.table.entry(kind).or_default().push(Arc::new(handler));
        self
    }

    /// Register a handler that sees every dispatch.
    pub fn on_any(mut self, handler: impl EventHandler + 'static) -> Self {
        self.any.push(Arc::new(handler));
        self
    }

    /// Route one dispatch. Returns the number of handlers invoked.
    pub fn dispatch(&self, name: &str, payload: &Value) -> usize {
        let kind = EventKind::from_name(name);
        let mut called = 0;
        if let Some(handlers) = self.table.get(&kind) {
            for h in handlers {
                h.on_event(name, payload);
                called += 1;
            }
        }
        for h in &self.any {
            h.on_event(name, payload);
            called += 1;
        }
        if called == 0 {
            log::debug!("no handler for dispatch {}", name);
        }
        called
    }
}
