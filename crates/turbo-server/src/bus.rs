//! Subscription registry: subscriber sets hung off Path Tree nodes.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use turbo_core::path::{self, canonicalize};
use turbo_core::{EventClass, PathTree, SessionId};

use crate::session::{DeliveryError, Session};

type SubscriberSet = HashMap<SessionId, Weak<Session>>;

/// Per-node subscriber sets, one slot per event class, allocated lazily.
#[derive(Default)]
pub struct Topic {
    sets: [Option<SubscriberSet>; EventClass::COUNT],
}

impl Topic {
    fn set(&self, class: EventClass) -> Option<&SubscriberSet> {
        self.sets[class.index()].as_ref()
    }

    fn is_idle(&self) -> bool {
        self.sets.iter().all(|s| s.as_ref().map_or(true, |s| s.is_empty()))
    }

    fn count(&self) -> usize {
        self.sets.iter().flatten().map(|s| s.len()).sum()
    }
}

/// Outcome of one publish call.
#[derive(Debug, Default)]
pub struct Published {
    pub delivered: usize,
    /// Sessions whose outbox was full. The caller tears them down.
    pub overflowed: Vec<Arc<Session>>,
}

/// One node visited by a remove cascade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CascadeStep {
    pub path: String,
    /// Direct path parent, when it is materialized as the node's tree parent.
    pub parent: Option<String>,
}

#[derive(Default)]
pub struct MessageBus {
    tree: RwLock<PathTree<Topic>>,
}

impl MessageBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `session` to the `(class, path)` set. Returns false when the
    /// session is already being torn down.
    pub fn subscribe(&self, class: EventClass, path: &str, session: &Arc<Session>) -> bool {
        let path = canonicalize(path);
        let mut tree = self.tree.write();
        if !session.add_subscription(&path, class) {
            return false;
        }
        let id = tree.put(&path);
        if let Some(node) = tree.node_mut(id) {
            node.data.sets[class.index()]
                .get_or_insert_with(HashMap::new)
                .insert(session.id(), Arc::downgrade(session));
        }
        true
    }

    pub fn unsubscribe(&self, class: EventClass, path: &str, session: &Session) {
        let path = canonicalize(path);
        self.detach(class, &path, session.id());
        session.remove_subscription(&path, class);
    }

    /// Drop every membership the session holds. Returns how many were removed.
    pub fn unsubscribe_all(&self, session: &Session) -> usize {
        let memberships = session.take_subscriptions();
        for (path, class) in &memberships {
            self.detach(*class, path, session.id());
        }
        memberships.len()
    }

    fn detach(&self, class: EventClass, path: &str, id: SessionId) {
        let mut tree = self.tree.write();
        let Some(node_id) = tree.get(path) else {
            return;
        };
        if let Some(node) = tree.node_mut(node_id) {
            let slot = &mut node.data.sets[class.index()];
            if let Some(set) = slot {
                set.remove(&id);
                if set.is_empty() {
                    *slot = None;
                }
            }
        }
    }

    /// Queue `frame` for every subscriber of `(class, path)`. Full outboxes
    /// are reported back, never waited on.
    pub fn publish(&self, class: EventClass, path: &str, frame: &str) -> Published {
        let targets: Vec<Arc<Session>> = {
            let tree = self.tree.read();
            let Some(set) = tree
                .get(path)
                .and_then(|id| tree.node(id))
                .and_then(|node| node.data.set(class))
            else {
                return Published::default();
            };
            set.values().filter_map(Weak::upgrade).collect()
        };

        let mut published = Published::default();
        for session in targets {
            match session.deliver(frame.to_string()) {
                Ok(()) => published.delivered += 1,
                Err(DeliveryError::Full) => published.overflowed.push(session),
                Err(DeliveryError::Closed) => {}
            }
        }
        published
    }

    pub fn has_subscribers(&self, class: EventClass, path: &str) -> bool {
        self.subscriber_count(class, path) > 0
    }

    pub fn subscriber_count(&self, class: EventClass, path: &str) -> usize {
        let tree = self.tree.read();
        tree.get(path)
            .and_then(|id| tree.node(id))
            .and_then(|node| node.data.set(class))
            .map_or(0, |set| set.len())
    }

    /// Total memberships across all nodes.
    pub fn subscription_count(&self) -> usize {
        self.tree.read().iter().map(|(_, node)| node.data.count()).sum()
    }

    /// Ensure a node exists for `path`.
    pub fn touch(&self, path: &str) {
        self.tree.write().put(path);
    }

    pub fn contains(&self, path: &str) -> bool {
        self.tree.read().get(path).is_some()
    }

    pub fn node_count(&self) -> usize {
        self.tree.read().len()
    }

    /// The subtree under `path`, descendants before ancestors. `None` when
    /// the path is not materialized.
    pub fn cascade_plan(&self, path: &str) -> Option<Vec<CascadeStep>> {
        let tree = self.tree.read();
        let id = tree.get(path)?;
        let mut steps = Vec::new();
        tree.cascade(id, |node_id, node| {
            let parent = if tree.has_immediate_parent(node_id) {
                path::parent_of(node.path()).map(str::to_string)
            } else {
                None
            };
            steps.push(CascadeStep {
                path: node.path().to_string(),
                parent,
            });
        });
        Some(steps)
    }

    /// Drop the node at `path` if nobody listens there any more. Its
    /// children move up to its parent.
    pub fn prune(&self, path: &str) -> bool {
        let mut tree = self.tree.write();
        let Some(id) = tree.get(path) else {
            return false;
        };
        if !tree.node(id).is_some_and(|node| node.data.is_idle()) {
            return false;
        }
        tree.remove(id).is_some()
    }
}
