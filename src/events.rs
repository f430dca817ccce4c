//! Synchronous pub/sub used to propagate tree and source changes.
//!
//! Events fire immediately after the in-memory mutation that caused them,
//! before the persistence adapter has acknowledged anything. Downstream
//! reactors (the transform resolver, host listeners) therefore observe
//! optimistic state.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use crate::foundation::ids::{NodeId, ProjectId, SourceId};

/// Notifications emitted by the engine core.
#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    /// A node was inserted (or a root established).
    NodeInserted {
        /// Owning project.
        project_id: ProjectId,
        /// The new node.
        node_id: NodeId,
        /// Parent, absent for root insertion.
        parent_id: Option<NodeId>,
    },
    /// A node's props changed.
    NodeChanged {
        /// Owning project.
        project_id: ProjectId,
        /// The changed node.
        node_id: NodeId,
    },
    /// A node was detached and tombstoned.
    NodeRemoved {
        /// Owning project.
        project_id: ProjectId,
        /// The removed node.
        node_id: NodeId,
    },
    /// A specific source's props changed.
    SourceChanged {
        /// Source type.
        source_type: String,
        /// The changed source.
        source_id: SourceId,
    },
    /// A source type's candidate list changed (add/remove/activity).
    AvailableSourcesChanged {
        /// Source type.
        source_type: String,
    },
}

/// Event discriminant, used for kind-filtered subscriptions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// [`Event::NodeInserted`]
    NodeInserted,
    /// [`Event::NodeChanged`]
    NodeChanged,
    /// [`Event::NodeRemoved`]
    NodeRemoved,
    /// [`Event::SourceChanged`]
    SourceChanged,
    /// [`Event::AvailableSourcesChanged`]
    AvailableSourcesChanged,
}

impl Event {
    /// Discriminant of this event.
    pub fn kind(&self) -> EventKind {
        match self {
            Self::NodeInserted { .. } => EventKind::NodeInserted,
            Self::NodeChanged { .. } => EventKind::NodeChanged,
            Self::NodeRemoved { .. } => EventKind::NodeRemoved,
            Self::SourceChanged { .. } => EventKind::SourceChanged,
            Self::AvailableSourcesChanged { .. } => EventKind::AvailableSourcesChanged,
        }
    }

    /// The node this event concerns, when applicable.
    pub fn node_id(&self) -> Option<&NodeId> {
        match self {
            Self::NodeInserted { node_id, .. }
            | Self::NodeChanged { node_id, .. }
            | Self::NodeRemoved { node_id, .. } => Some(node_id),
            _ => None,
        }
    }
}

type Handler = Rc<RefCell<dyn FnMut(&Event)>>;

struct Entry {
    id: u64,
    kind: Option<EventKind>,
    node: Option<NodeId>,
    handler: Handler,
}

/// Synchronous event bus with optional kind and node-id filtering.
#[derive(Default)]
pub struct EventBus {
    subs: Rc<RefCell<Vec<Entry>>>,
    next_id: Cell<u64>,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subs.borrow().len())
            .finish()
    }
}

impl EventBus {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn add(
        &self,
        kind: Option<EventKind>,
        node: Option<NodeId>,
        handler: impl FnMut(&Event) + 'static,
    ) -> Subscription {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        self.subs.borrow_mut().push(Entry {
            id,
            kind,
            node,
            handler: Rc::new(RefCell::new(handler)),
        });
        Subscription {
            id,
            subs: Rc::downgrade(&self.subs),
        }
    }

    /// Subscribe to every event, optionally filtered to one node id.
    pub fn subscribe(
        &self,
        handler: impl FnMut(&Event) + 'static,
        node: Option<NodeId>,
    ) -> Subscription {
        self.add(None, node, handler)
    }

    /// Subscribe to one event kind, optionally filtered to one node id.
    pub fn on(
        &self,
        kind: EventKind,
        handler: impl FnMut(&Event) + 'static,
        node: Option<NodeId>,
    ) -> Subscription {
        self.add(Some(kind), node, handler)
    }

    /// Deliver an event to every matching subscriber, synchronously.
    ///
    /// Handlers run against a snapshot of the subscriber list, so a handler
    /// may subscribe or cancel re-entrantly without poisoning the emit. A
    /// handler that is still running (a reactor mutated the engine and the
    /// mutation emitted again) is skipped for the inner delivery instead of
    /// being re-entered.
    pub(crate) fn emit(&self, event: &Event) {
        let snapshot: Vec<Handler> = self
            .subs
            .borrow()
            .iter()
            .filter(|e| e.kind.is_none_or(|k| k == event.kind()))
            .filter(|e| match (&e.node, event.node_id()) {
                (Some(want), Some(got)) => want == got,
                (Some(_), None) => false,
                (None, _) => true,
            })
            .map(|e| Rc::clone(&e.handler))
            .collect();
        for handler in snapshot {
            match handler.try_borrow_mut() {
                Ok(mut handler) => handler(event),
                Err(_) => {
                    tracing::trace!(kind = ?event.kind(), "re-entrant handler skipped");
                }
            }
        }
    }
}

/// Handle returned by [`EventBus::subscribe`]/[`EventBus::on`]; cancel to
/// stop delivery. Dropping the handle without cancelling leaves the
/// subscription live.
#[derive(Debug, Clone)]
pub struct Subscription {
    id: u64,
    subs: Weak<RefCell<Vec<Entry>>>,
}

impl fmt::Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("node", &self.node)
            .finish()
    }
}

impl Subscription {
    /// Remove this subscription from the bus.
    pub fn cancel(&self) {
        if let Some(subs) = self.subs.upgrade() {
            subs.borrow_mut().retain(|e| e.id != self.id);
        }
    }
}
