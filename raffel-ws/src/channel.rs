//! The channel engine: registered channel patterns, subscription state,
//! authorization, presence membership, and publish/subscribe fan-out.
//!
//! Channels are per-process. Fan-out copies a subscriber snapshot under the
//! per-channel lock, then pushes to each subscriber's mailbox outside it,
//! so one slow connection never holds the channel up.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, RwLock};

use dashmap::DashMap;
use serde_json::Value;

use raffel_core::error::Error;
use raffel_core::validate::Validator;

use crate::frames::ServerFrame;
use crate::mailbox::Mailbox;

/// Channel access class. The reserved name prefixes `private-` and
/// `presence-` must agree with the class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Public,
    Private,
    Presence,
}

/// What an authorize predicate sees.
#[derive(Debug, Clone)]
pub struct ChannelCtx {
    pub channel: String,
    /// Bindings for `{param}` segments of the matched pattern.
    pub params: HashMap<String, String>,
    pub connection_id: String,
    /// The `auth` payload from the subscribe frame, verbatim.
    pub auth: Option<Value>,
}

/// What a can-publish predicate sees.
#[derive(Debug, Clone)]
pub struct PublishCtx {
    pub channel: String,
    pub params: HashMap<String, String>,
    /// Absent for server-side publishes.
    pub connection_id: Option<String>,
    pub event: String,
    pub data: Value,
}

pub type AuthorizeFn =
    Arc<dyn Fn(ChannelCtx) -> Pin<Box<dyn Future<Output = bool> + Send>> + Send + Sync>;
pub type CanPublishFn =
    Arc<dyn Fn(PublishCtx) -> Pin<Box<dyn Future<Output = bool> + Send>> + Send + Sync>;

/// A registered channel pattern.
///
/// Patterns are dot-segmented; a segment is a literal, `{param}` (binds),
/// or `*` (matches anything). The reserved prefix lives in the first
/// literal segment: `presence-room.{id}` is a presence pattern.
#[derive(Clone)]
pub struct ChannelDef {
    pub pattern: String,
    pub kind: ChannelKind,
    pub authorize: Option<AuthorizeFn>,
    pub can_publish: Option<CanPublishFn>,
    /// Event name → input schema. Empty map = any event allowed.
    pub events: HashMap<String, Value>,
}

impl ChannelDef {
    pub fn public(pattern: impl Into<String>) -> Self {
        Self::new(pattern, ChannelKind::Public)
    }

    pub fn private(pattern: impl Into<String>) -> Self {
        Self::new(pattern, ChannelKind::Private)
    }

    pub fn presence(pattern: impl Into<String>) -> Self {
        Self::new(pattern, ChannelKind::Presence)
    }

    fn new(pattern: impl Into<String>, kind: ChannelKind) -> Self {
        Self {
            pattern: pattern.into(),
            kind,
            authorize: None,
            can_publish: None,
            events: HashMap::new(),
        }
    }

    /// Async authorize predicate for private/presence subscriptions.
    pub fn authorize<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(ChannelCtx) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        self.authorize = Some(Arc::new(move |ctx| Box::pin(f(ctx))));
        self
    }

    /// Async publish predicate. Without one, publishing defaults to allowed
    /// on public channels and denied on private/presence.
    pub fn can_publish<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(PublishCtx) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        self.can_publish = Some(Arc::new(move |ctx| Box::pin(f(ctx))));
        self
    }

    /// Declare a typed event with an input schema.
    pub fn event(mut self, name: impl Into<String>, schema: Value) -> Self {
        self.events.insert(name.into(), schema);
        self
    }

    fn matches(&self, name: &str) -> Option<HashMap<String, String>> {
        let pattern_segments: Vec<&str> = self.pattern.split('.').collect();
        let name_segments: Vec<&str> = name.split('.').collect();
        if pattern_segments.len() != name_segments.len() {
            return None;
        }
        let mut params = HashMap::new();
        for (pattern_segment, name_segment) in pattern_segments.iter().zip(&name_segments) {
            match *pattern_segment {
                "*" => {}
                p if p.starts_with('{') && p.ends_with('}') => {
                    params.insert(
                        p[1..p.len() - 1].to_string(),
                        (*name_segment).to_string(),
                    );
                }
                p if p == *name_segment => {}
                _ => return None,
            }
        }
        Some(params)
    }
}

fn kind_for_prefix(name: &str) -> ChannelKind {
    if name.starts_with("private-") {
        ChannelKind::Private
    } else if name.starts_with("presence-") {
        ChannelKind::Presence
    } else {
        ChannelKind::Public
    }
}

/// A connected subscriber: connection id plus its outbound mailbox.
#[derive(Clone)]
pub struct Peer {
    pub id: String,
    pub mailbox: Mailbox,
}

impl Peer {
    pub fn new(mailbox_capacity: usize) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            mailbox: Mailbox::new(mailbox_capacity),
        }
    }
}

struct MemberEntry {
    info: Value,
    conn_id: String,
}

/// Live per-channel state, guarded by per-channel locks.
struct Live {
    name: String,
    subscribers: Mutex<Vec<Peer>>,
    /// Insertion-ordered member list (presence channels).
    members: Mutex<Vec<MemberEntry>>,
}

impl Live {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            subscribers: Mutex::new(Vec::new()),
            members: Mutex::new(Vec::new()),
        }
    }

    fn subscriber_snapshot(&self) -> Vec<Peer> {
        self.subscribers
            .lock()
            .expect("channel lock poisoned")
            .clone()
    }
}

/// Subscription, presence, and fan-out state for one process.
pub struct ChannelEngine {
    defs: RwLock<Vec<ChannelDef>>,
    live: DashMap<String, Arc<Live>>,
    /// Reverse index: connection id → channels it is subscribed to.
    memberships: DashMap<String, HashSet<String>>,
    validator: Option<Arc<dyn Validator>>,
    echo_publisher: bool,
}

impl ChannelEngine {
    pub fn new() -> Self {
        Self {
            defs: RwLock::new(Vec::new()),
            live: DashMap::new(),
            memberships: DashMap::new(),
            validator: None,
            echo_publisher: false,
        }
    }

    /// Validate published event payloads against declared event schemas.
    pub fn with_validator(mut self, validator: Arc<dyn Validator>) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Deliver publications back to the publishing connection too.
    pub fn with_echo_publisher(mut self, echo: bool) -> Self {
        self.echo_publisher = echo;
        self
    }

    /// Register a channel pattern. The reserved prefixes must match the
    /// declared kind.
    pub fn define(&self, def: ChannelDef) -> Result<(), Error> {
        let first_segment = def.pattern.split('.').next().unwrap_or("");
        let prefix_kind = kind_for_prefix(first_segment);
        if prefix_kind != def.kind {
            return Err(Error::invalid_argument(format!(
                "channel pattern {:?} has a {} prefix but was declared {:?}",
                def.pattern,
                match prefix_kind {
                    ChannelKind::Private => "private-",
                    ChannelKind::Presence => "presence-",
                    ChannelKind::Public => "public",
                },
                def.kind
            )));
        }
        let mut defs = self.defs.write().expect("channel defs lock poisoned");
        if defs.iter().any(|existing| existing.pattern == def.pattern) {
            return Err(Error::already_exists(format!(
                "channel pattern {:?} is already registered",
                def.pattern
            )));
        }
        defs.push(def);
        Ok(())
    }

    fn match_def(&self, name: &str) -> Option<(ChannelDef, HashMap<String, String>)> {
        let defs = self.defs.read().expect("channel defs lock poisoned");
        defs.iter()
            .find_map(|def| def.matches(name).map(|params| (def.clone(), params)))
    }

    /// Subscribe `peer` to `channel`. On success the acknowledgement (with
    /// the member snapshot on presence channels) is enqueued to the
    /// subscriber before `member_added` fans out to the other members.
    pub async fn subscribe(
        &self,
        peer: &Peer,
        channel: &str,
        id: Option<Value>,
        auth: Option<Value>,
        member: Option<Value>,
    ) -> Result<(), Error> {
        let (def, params) = self
            .match_def(channel)
            .ok_or_else(|| Error::not_found(format!("unknown channel {channel:?}")))?;

        if def.kind != ChannelKind::Public {
            let ctx = ChannelCtx {
                channel: channel.to_string(),
                params,
                connection_id: peer.id.clone(),
                auth: auth.clone(),
            };
            let allowed = match &def.authorize {
                Some(authorize) => authorize(ctx).await,
                // A private/presence channel without a predicate admits nobody.
                None => false,
            };
            if !allowed {
                return Err(Error::permission_denied(format!(
                    "not authorized for channel {channel:?}"
                )));
            }
        }

        let member_info = if def.kind == ChannelKind::Presence {
            let mut info = member
                .or_else(|| auth.as_ref().and_then(|a| a.get("member").cloned()))
                .ok_or_else(|| {
                    Error::invalid_argument("presence channels require member info at subscribe")
                })?;
            if info.get("id").and_then(Value::as_str).is_none() {
                let generated = uuid::Uuid::new_v4().to_string();
                match info.as_object_mut() {
                    Some(object) => {
                        object.insert("id".to_string(), Value::String(generated));
                    }
                    None => {
                        info = serde_json::json!({ "id": generated, "info": info });
                    }
                }
            }
            Some(info)
        } else {
            None
        };

        let live = self
            .live
            .entry(channel.to_string())
            .or_insert_with(|| Arc::new(Live::new(channel)))
            .clone();

        {
            let mut subscribers = live.subscribers.lock().expect("channel lock poisoned");
            if subscribers.iter().any(|existing| existing.id == peer.id) {
                return Err(Error::already_exists(format!(
                    "already subscribed to {channel:?}"
                )));
            }
            subscribers.push(peer.clone());
        }
        self.memberships
            .entry(peer.id.clone())
            .or_default()
            .insert(channel.to_string());

        let snapshot = match &member_info {
            Some(info) => {
                let mut members = live.members.lock().expect("channel lock poisoned");
                members.push(MemberEntry {
                    info: info.clone(),
                    conn_id: peer.id.clone(),
                });
                Some(members.iter().map(|entry| entry.info.clone()).collect())
            }
            None => None,
        };

        // Acknowledge the subscriber first, then announce it to the room.
        peer.mailbox.push(
            ServerFrame::Subscribed {
                channel: channel.to_string(),
                id,
                members: snapshot,
            }
            .to_json(),
        );
        if let Some(info) = member_info {
            let frame = ServerFrame::MemberAdded {
                channel: channel.to_string(),
                member: info,
            }
            .to_json();
            for subscriber in live.subscriber_snapshot() {
                if subscriber.id != peer.id {
                    subscriber.mailbox.push(frame.clone());
                }
            }
        }
        Ok(())
    }

    /// Unsubscribe `peer` from `channel`.
    pub fn unsubscribe(&self, peer: &Peer, channel: &str, id: Option<Value>) -> Result<(), Error> {
        let live = self
            .live
            .get(channel)
            .map(|entry| entry.clone())
            .ok_or_else(|| Error::not_found(format!("not subscribed to {channel:?}")))?;

        let was_subscribed = {
            let mut subscribers = live.subscribers.lock().expect("channel lock poisoned");
            let before = subscribers.len();
            subscribers.retain(|existing| existing.id != peer.id);
            subscribers.len() != before
        };
        if !was_subscribed {
            return Err(Error::not_found(format!("not subscribed to {channel:?}")));
        }
        if let Some(mut entry) = self.memberships.get_mut(&peer.id) {
            entry.remove(channel);
        }

        let removed_member = {
            let mut members = live.members.lock().expect("channel lock poisoned");
            members
                .iter()
                .position(|entry| entry.conn_id == peer.id)
                .map(|position| members.remove(position).info)
        };

        peer.mailbox.push(
            ServerFrame::Unsubscribed {
                channel: channel.to_string(),
                id,
            }
            .to_json(),
        );
        if let Some(info) = removed_member {
            let frame = ServerFrame::MemberRemoved {
                channel: channel.to_string(),
                member: info,
            }
            .to_json();
            for subscriber in live.subscriber_snapshot() {
                subscriber.mailbox.push(frame.clone());
            }
        }
        Ok(())
    }

    /// Publish to a channel. `publisher` is the originating connection, or
    /// `None` for server-side pushes (which bypass `can_publish`).
    pub async fn publish(
        &self,
        publisher: Option<&Peer>,
        channel: &str,
        event: &str,
        data: Value,
    ) -> Result<(), Error> {
        let (def, params) = self
            .match_def(channel)
            .ok_or_else(|| Error::not_found(format!("unknown channel {channel:?}")))?;

        // Typed events validate their payload; a non-empty event map also
        // pins the set of allowed event names.
        if !def.events.is_empty() {
            let schema = def.events.get(event).ok_or_else(|| {
                Error::invalid_argument(format!("unknown event {event:?} on {channel:?}"))
            })?;
            if let Some(validator) = &self.validator {
                validator
                    .validate(schema, data.clone())
                    .map_err(|diagnostic| {
                        Error::validation("event payload failed validation")
                            .with_details(diagnostic.into_details())
                    })?;
            }
        }

        if let Some(publisher) = publisher {
            let ctx = PublishCtx {
                channel: channel.to_string(),
                params,
                connection_id: Some(publisher.id.clone()),
                event: event.to_string(),
                data: data.clone(),
            };
            let allowed = match &def.can_publish {
                Some(can_publish) => can_publish(ctx).await,
                None => def.kind == ChannelKind::Public,
            };
            if !allowed {
                return Err(Error::permission_denied(format!(
                    "publishing to {channel:?} is not allowed"
                )));
            }
        }

        let Some(live) = self.live.get(channel).map(|entry| entry.clone()) else {
            return Ok(()); // no subscribers yet
        };
        let frame = ServerFrame::Event {
            channel: channel.to_string(),
            event: event.to_string(),
            data,
        }
        .to_json();
        let skip_id = match (publisher, self.echo_publisher) {
            (Some(peer), false) => Some(peer.id.as_str()),
            _ => None,
        };
        for subscriber in live.subscriber_snapshot() {
            if Some(subscriber.id.as_str()) != skip_id {
                subscriber.mailbox.push(frame.clone());
            }
        }
        Ok(())
    }

    /// Tear down everything `peer_id` subscribed to. The connection is
    /// removed from every subscriber set before any `member_removed`
    /// broadcast goes out.
    pub fn disconnect(&self, peer_id: &str) {
        let channels = self
            .memberships
            .remove(peer_id)
            .map(|(_, set)| set)
            .unwrap_or_default();

        let mut removals: Vec<(Arc<Live>, Value)> = Vec::new();
        for channel in channels {
            let Some(live) = self.live.get(&channel).map(|entry| entry.clone()) else {
                continue;
            };
            live.subscribers
                .lock()
                .expect("channel lock poisoned")
                .retain(|existing| existing.id != peer_id);
            let removed = {
                let mut members = live.members.lock().expect("channel lock poisoned");
                members
                    .iter()
                    .position(|entry| entry.conn_id == peer_id)
                    .map(|position| members.remove(position).info)
            };
            if let Some(info) = removed {
                removals.push((live, info));
            }
        }

        // Membership fully torn down; now tell the rooms.
        for (live, info) in removals {
            let frame = ServerFrame::MemberRemoved {
                channel: live.name.clone(),
                member: info,
            }
            .to_json();
            for subscriber in live.subscriber_snapshot() {
                subscriber.mailbox.push(frame.clone());
            }
        }
    }

    /// Current subscriber count, mostly for tests and introspection.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.live
            .get(channel)
            .map(|live| live.subscribers.lock().expect("channel lock poisoned").len())
            .unwrap_or(0)
    }

    /// Current presence members of a channel, in join order.
    pub fn members(&self, channel: &str) -> Vec<Value> {
        self.live
            .get(channel)
            .map(|live| {
                live.members
                    .lock()
                    .expect("channel lock poisoned")
                    .iter()
                    .map(|entry| entry.info.clone())
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl Default for ChannelEngine {
    fn default() -> Self {
        Self::new()
    }
}
