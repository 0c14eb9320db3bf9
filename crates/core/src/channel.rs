//! Intra-process pub/sub with public, private and presence channels.
//!
//! The manager owns channel membership; delivery goes through an injected
//! [`SocketSender`], so transports (and tests) decide what "send to socket"
//! means. WebSocket is the usual consumer: its `subscribe` / `unsubscribe` /
//! `publish` control messages land here.
//!
//! Channel visibility follows the name prefix: `private-*` and `presence-*`
//! require the configured authorizer to approve the socket; presence
//! channels additionally track a member-info map and broadcast
//! `member_added` / `member_removed` events as sockets come and go.
//!
//! Mutations are serialised behind one lock; broadcasts snapshot the
//! subscriber set and deliver after the lock is released, so a concurrent
//! unsubscribe never observes a half-torn delivery.

use std::collections::HashMap;
use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use indexmap::{IndexMap, IndexSet};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::Context;
use crate::error::{ErrorKind, RpcError};

/// Identifies one connected socket within a transport.
pub type SocketId = String;

/// Visibility flavour, derived from the channel name prefix.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ChannelKind {
    /// Anyone may subscribe.
    Public,
    /// Subscription requires authorisation.
    Private,
    /// Authorised, plus member tracking and join/leave broadcasts.
    Presence,
}

impl ChannelKind {
    /// Classify a channel name.
    #[must_use]
    pub fn of(name: &str) -> Self {
        if name.starts_with("presence-") {
            Self::Presence
        } else if name.starts_with("private-") {
            Self::Private
        } else {
            Self::Public
        }
    }

    /// Whether subscription needs the authorizer's approval.
    #[must_use]
    pub fn requires_authorization(&self) -> bool {
        !matches!(self, Self::Public)
    }
}

/// Presence info for one member of a presence channel.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct MemberInfo {
    /// The member's socket id.
    pub id: SocketId,
    /// Application-level user id, when the authorizer knows one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Free-form member info built by the `presence_data` callback.
    pub info: Value,
}

/// The `{type, channel, event, data}` message delivered to subscribers.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ChannelMessage {
    /// Always `"event"`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Originating channel.
    pub channel: String,
    /// Event name (`member_added`, `member_removed`, or application events).
    pub event: String,
    /// Event payload.
    pub data: Value,
}

impl ChannelMessage {
    /// Build an event message.
    pub fn event(channel: impl Into<String>, event: impl Into<String>, data: Value) -> Self {
        Self {
            kind: "event".to_owned(),
            channel: channel.into(),
            event: event.into(),
            data,
        }
    }
}

/// Delivers messages to sockets; injected by the owning transport.
pub trait SocketSender: Send + Sync + 'static {
    /// Deliver one message. Best-effort: failures are the sender's problem.
    fn send(&self, socket_id: &str, message: ChannelMessage);
}

impl<F> SocketSender for F
where
    F: Fn(&str, ChannelMessage) + Send + Sync + 'static,
{
    fn send(&self, socket_id: &str, message: ChannelMessage) {
        (self)(socket_id, message);
    }
}

type AuthorizeFn =
    Arc<dyn Fn(SocketId, String, Context) -> BoxFuture<'static, bool> + Send + Sync>;
type PresenceDataFn =
    Arc<dyn Fn(SocketId, String, Context) -> BoxFuture<'static, Value> + Send + Sync>;

/// Result of a subscribe call.
#[derive(Clone, Debug, Default)]
pub struct SubscribeResult {
    /// Whether the socket is now subscribed (idempotent re-subscribes
    /// succeed without side effects).
    pub newly_subscribed: bool,
    /// Current member list, presence channels only.
    pub members: Option<Vec<MemberInfo>>,
}

struct ChannelEntry {
    kind: ChannelKind,
    subscribers: IndexSet<SocketId>,
    members: IndexMap<SocketId, MemberInfo>,
}

impl ChannelEntry {
    fn new(kind: ChannelKind) -> Self {
        Self {
            kind,
            subscribers: IndexSet::new(),
            members: IndexMap::new(),
        }
    }
}

/// Subscribe/unsubscribe/broadcast with presence semantics.
pub struct ChannelManager {
    sender: Arc<dyn SocketSender>,
    authorize: Option<AuthorizeFn>,
    presence_data: Option<PresenceDataFn>,
    channels: Mutex<HashMap<String, ChannelEntry>>,
}

impl ChannelManager {
    /// Create a manager delivering through `sender`.
    pub fn new(sender: impl SocketSender) -> Self {
        Self {
            sender: Arc::new(sender),
            authorize: None,
            presence_data: None,
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Authorisation callback for `private-` and `presence-` channels.
    ///
    /// Without one, every private/presence subscribe is denied.
    #[must_use]
    pub fn authorize<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(SocketId, String, Context) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = bool> + Send + 'static,
    {
        self.authorize = Some(Arc::new(move |socket, channel, ctx| {
            Box::pin(f(socket, channel, ctx))
        }));
        self
    }

    /// Member-info builder for presence channels.
    #[must_use]
    pub fn presence_data<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(SocketId, String, Context) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Value> + Send + 'static,
    {
        self.presence_data = Some(Arc::new(move |socket, channel, ctx| {
            Box::pin(f(socket, channel, ctx))
        }));
        self
    }

    /// Subscribe a socket to a channel.
    ///
    /// Private and presence channels demand the authorizer's approval;
    /// otherwise `PERMISSION_DENIED`. Presence channels return the current
    /// member list and announce `member_added` to the other subscribers.
    /// Re-subscribing an already-subscribed socket is idempotent: the
    /// subscriber set is unchanged and nothing is broadcast.
    pub async fn subscribe(
        &self,
        socket_id: &str,
        channel: &str,
        ctx: &Context,
    ) -> Result<SubscribeResult, RpcError> {
        let kind = ChannelKind::of(channel);
        if kind.requires_authorization() {
            let authorized = match &self.authorize {
                Some(authorize) => {
                    authorize(socket_id.to_owned(), channel.to_owned(), ctx.clone()).await
                }
                None => false,
            };
            if !authorized {
                return Err(RpcError::new(
                    ErrorKind::PermissionDenied,
                    format!("subscription to `{channel}` denied"),
                ));
            }
        }

        // Build member info before taking the lock; the callback is async.
        let member = if kind == ChannelKind::Presence {
            let info = match &self.presence_data {
                Some(presence) => {
                    presence(socket_id.to_owned(), channel.to_owned(), ctx.clone()).await
                }
                None => Value::Null,
            };
            Some(MemberInfo {
                id: socket_id.to_owned(),
                user_id: ctx.auth().and_then(|a| a.principal),
                info,
            })
        } else {
            None
        };

        let (result, announcements) = {
            let mut channels = self.channels.lock();
            let entry = channels
                .entry(channel.to_owned())
                .or_insert_with(|| ChannelEntry::new(kind));
            if entry.subscribers.contains(socket_id) {
                let members = (kind == ChannelKind::Presence)
                    .then(|| entry.members.values().cloned().collect());
                return Ok(SubscribeResult {
                    newly_subscribed: false,
                    members,
                });
            }
            let others: Vec<SocketId> = entry.subscribers.iter().cloned().collect();
            entry.subscribers.insert(socket_id.to_owned());
            let mut members = None;
            let mut announcements = Vec::new();
            if let Some(member) = member {
                entry.members.insert(socket_id.to_owned(), member.clone());
                members = Some(entry.members.values().cloned().collect::<Vec<_>>());
                let message = ChannelMessage::event(
                    channel,
                    "member_added",
                    serde_json::to_value(&member).unwrap_or(Value::Null),
                );
                announcements.extend(others.into_iter().map(|s| (s, message.clone())));
            }
            (
                SubscribeResult {
                    newly_subscribed: true,
                    members,
                },
                announcements,
            )
        };
        for (socket, message) in announcements {
            self.sender.send(&socket, message);
        }
        Ok(result)
    }

    /// Unsubscribe a socket from a channel.
    ///
    /// Returns whether the socket was subscribed. Presence channels announce
    /// `member_removed` to the remaining subscribers. The channel record is
    /// dropped once its subscriber set empties.
    pub fn unsubscribe(&self, socket_id: &str, channel: &str) -> bool {
        let announcements = {
            let mut channels = self.channels.lock();
            let Some(entry) = channels.get_mut(channel) else {
                return false;
            };
            if !entry.subscribers.shift_remove(socket_id) {
                return false;
            }
            let member = entry.members.shift_remove(socket_id);
            let remaining: Vec<SocketId> = entry.subscribers.iter().cloned().collect();
            if entry.subscribers.is_empty() {
                channels.remove(channel);
            }
            match member {
                Some(member) => {
                    let message = ChannelMessage::event(
                        channel,
                        "member_removed",
                        serde_json::to_value(&member).unwrap_or(Value::Null),
                    );
                    remaining.into_iter().map(|s| (s, message.clone())).collect()
                }
                None => Vec::new(),
            }
        };
        for (socket, message) in announcements {
            self.sender.send(&socket, message);
        }
        true
    }

    /// Drop every subscription a socket holds; called on disconnect.
    pub fn unsubscribe_all(&self, socket_id: &str) {
        let subscribed: Vec<String> = {
            let channels = self.channels.lock();
            channels
                .iter()
                .filter(|(_, entry)| entry.subscribers.contains(socket_id))
                .map(|(name, _)| name.clone())
                .collect()
        };
        for channel in subscribed {
            self.unsubscribe(socket_id, &channel);
        }
    }

    /// Deliver an event to every subscriber, optionally excluding the sender.
    pub fn broadcast(&self, channel: &str, event: &str, data: Value, except: Option<&str>) {
        let targets: Vec<SocketId> = {
            let channels = self.channels.lock();
            let Some(entry) = channels.get(channel) else {
                return;
            };
            entry
                .subscribers
                .iter()
                .filter(|s| except.is_none_or(|e| e != s.as_str()))
                .cloned()
                .collect()
        };
        let message = ChannelMessage::event(channel, event, data);
        for socket in targets {
            self.sender.send(&socket, message.clone());
        }
    }

    /// Deliver an event to one socket, only if it is in the channel.
    ///
    /// Returns whether the message was delivered.
    pub fn send_to_socket(&self, socket_id: &str, channel: &str, event: &str, data: Value) -> bool {
        let subscribed = {
            let channels = self.channels.lock();
            channels
                .get(channel)
                .is_some_and(|entry| entry.subscribers.contains(socket_id))
        };
        if subscribed {
            self.sender
                .send(socket_id, ChannelMessage::event(channel, event, data));
        }
        subscribed
    }

    /// Force-unsubscribe a socket; same side effects as [`unsubscribe`].
    ///
    /// [`unsubscribe`]: Self::unsubscribe
    pub fn kick(&self, channel: &str, socket_id: &str) -> bool {
        self.unsubscribe(socket_id, channel)
    }

    /// Subscriber count of a channel (0 when the channel does not exist).
    #[must_use]
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .lock()
            .get(channel)
            .map_or(0, |entry| entry.subscribers.len())
    }

    /// Names of the channels a socket is subscribed to.
    #[must_use]
    pub fn channels_of(&self, socket_id: &str) -> Vec<String> {
        let channels = self.channels.lock();
        channels
            .iter()
            .filter(|(_, entry)| entry.subscribers.contains(socket_id))
            .map(|(name, _)| name.clone())
            .collect()
    }
}

impl Debug for ChannelManager {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelManager")
            .field("channels", &self.channels.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Default)]
    struct Recorder {
        sent: Arc<Mutex<Vec<(SocketId, ChannelMessage)>>>,
    }

    impl SocketSender for Recorder {
        fn send(&self, socket_id: &str, message: ChannelMessage) {
            self.sent.lock().push((socket_id.to_owned(), message));
        }
    }

    impl Recorder {
        fn events_for(&self, socket: &str) -> Vec<(String, String)> {
            self.sent
                .lock()
                .iter()
                .filter(|(s, _)| s == socket)
                .map(|(_, m)| (m.event.clone(), m.channel.clone()))
                .collect()
        }
    }

    fn presence_manager(recorder: Recorder) -> ChannelManager {
        ChannelManager::new(recorder)
            .authorize(|_socket, _channel, _ctx| async move { true })
            .presence_data(|socket, _channel, _ctx| async move {
                serde_json::json!({ "name": socket })
            })
    }

    #[test]
    fn test_channel_kind_prefixes() {
        assert_eq!(ChannelKind::of("lobby"), ChannelKind::Public);
        assert_eq!(ChannelKind::of("private-admin"), ChannelKind::Private);
        assert_eq!(ChannelKind::of("presence-lobby"), ChannelKind::Presence);
    }

    #[tokio::test]
    async fn test_public_subscribe_and_broadcast() {
        let recorder = Recorder::default();
        let manager = ChannelManager::new(recorder.clone());
        let ctx = Context::background();
        manager.subscribe("a", "lobby", &ctx).await.unwrap();
        manager.subscribe("b", "lobby", &ctx).await.unwrap();

        manager.broadcast("lobby", "ping", serde_json::json!(1), Some("a"));
        assert!(recorder.events_for("a").is_empty());
        assert_eq!(recorder.events_for("b"), vec![("ping".to_owned(), "lobby".to_owned())]);
    }

    #[tokio::test]
    async fn test_private_requires_authorizer() {
        let manager = ChannelManager::new(Recorder::default());
        let err = manager
            .subscribe("a", "private-admin", &Context::background())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::PermissionDenied);
    }

    #[tokio::test]
    async fn test_authorizer_denial() {
        let manager = ChannelManager::new(Recorder::default())
            .authorize(|_socket, _channel, _ctx| async move { false });
        let err = manager
            .subscribe("a", "presence-room", &Context::background())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::PermissionDenied);
    }

    #[tokio::test]
    async fn test_presence_member_added_and_list() {
        let recorder = Recorder::default();
        let manager = presence_manager(recorder.clone());
        let ctx = Context::background();

        let first = manager.subscribe("a", "presence-lobby", &ctx).await.unwrap();
        assert_eq!(first.members.as_ref().unwrap().len(), 1);

        let second = manager.subscribe("b", "presence-lobby", &ctx).await.unwrap();
        let members = second.members.unwrap();
        assert_eq!(members.len(), 2);
        assert_eq!(members[0].id, "a");
        assert_eq!(members[1].id, "b");

        // Exactly one member_added, delivered to a only.
        assert_eq!(
            recorder.events_for("a"),
            vec![("member_added".to_owned(), "presence-lobby".to_owned())]
        );
        assert!(recorder.events_for("b").is_empty());
    }

    #[tokio::test]
    async fn test_resubscribe_is_idempotent() {
        let recorder = Recorder::default();
        let manager = presence_manager(recorder.clone());
        let ctx = Context::background();

        manager.subscribe("a", "presence-lobby", &ctx).await.unwrap();
        manager.subscribe("b", "presence-lobby", &ctx).await.unwrap();
        let before = recorder.sent.lock().len();

        let again = manager.subscribe("b", "presence-lobby", &ctx).await.unwrap();
        assert!(!again.newly_subscribed);
        assert_eq!(again.members.unwrap().len(), 2);
        assert_eq!(manager.subscriber_count("presence-lobby"), 2);
        // Zero presence broadcasts on the second call.
        assert_eq!(recorder.sent.lock().len(), before);
    }

    #[tokio::test]
    async fn test_unsubscribe_announces_member_removed() {
        let recorder = Recorder::default();
        let manager = presence_manager(recorder.clone());
        let ctx = Context::background();
        manager.subscribe("a", "presence-lobby", &ctx).await.unwrap();
        manager.subscribe("b", "presence-lobby", &ctx).await.unwrap();

        assert!(manager.unsubscribe("a", "presence-lobby"));
        let events = recorder.events_for("b");
        assert_eq!(events, vec![("member_removed".to_owned(), "presence-lobby".to_owned())]);
    }

    #[tokio::test]
    async fn test_empty_channel_is_dropped() {
        let manager = ChannelManager::new(Recorder::default());
        let ctx = Context::background();
        manager.subscribe("a", "lobby", &ctx).await.unwrap();
        assert_eq!(manager.subscriber_count("lobby"), 1);
        manager.unsubscribe("a", "lobby");
        assert_eq!(manager.subscriber_count("lobby"), 0);
        assert!(manager.channels_of("a").is_empty());
    }

    #[tokio::test]
    async fn test_unsubscribe_all() {
        let recorder = Recorder::default();
        let manager = presence_manager(recorder.clone());
        let ctx = Context::background();
        manager.subscribe("a", "presence-lobby", &ctx).await.unwrap();
        manager.subscribe("a", "news", &ctx).await.unwrap();
        manager.subscribe("b", "presence-lobby", &ctx).await.unwrap();

        manager.unsubscribe_all("a");
        assert_eq!(manager.subscriber_count("presence-lobby"), 1);
        assert_eq!(manager.subscriber_count("news"), 0);
        assert_eq!(
            recorder.events_for("b").last().unwrap().0,
            "member_removed"
        );
    }

    #[tokio::test]
    async fn test_send_to_socket_requires_membership() {
        let recorder = Recorder::default();
        let manager = ChannelManager::new(recorder.clone());
        let ctx = Context::background();
        manager.subscribe("a", "lobby", &ctx).await.unwrap();

        assert!(manager.send_to_socket("a", "lobby", "direct", serde_json::json!(1)));
        assert!(!manager.send_to_socket("stranger", "lobby", "direct", serde_json::json!(1)));
        assert_eq!(recorder.events_for("a").len(), 1);
        assert!(recorder.events_for("stranger").is_empty());
    }

    #[tokio::test]
    async fn test_kick_matches_unsubscribe() {
        let recorder = Recorder::default();
        let manager = presence_manager(recorder.clone());
        let ctx = Context::background();
        manager.subscribe("a", "presence-lobby", &ctx).await.unwrap();
        manager.subscribe("b", "presence-lobby", &ctx).await.unwrap();

        assert!(manager.kick("presence-lobby", "b"));
        assert!(!manager.kick("presence-lobby", "b"));
        assert_eq!(
            recorder.events_for("a").last().unwrap().0,
            "member_removed"
        );
    }
}
