//! In-memory table of the operations multiplexed over a single connection.

use std::collections::HashMap;

use futures::channel::mpsc;
use indexmap::IndexMap;

use crate::{
    client_message::{ClientMessage, Extension, StartPayload},
    response::Response,
};

/// Value delivered to the subscribers of an operation.
#[derive(Clone, Debug, PartialEq)]
pub enum Payload {
    /// A response was received for the operation.
    Data(Response),

    /// No more responses will be delivered for the operation.
    Terminated,
}

/// [`Payload`] tagged with the topic of the operation it was delivered for.
#[derive(Clone, Debug, PartialEq)]
pub struct Publication {
    /// Topic of the operation, in the `<service name>_<operation id>` form.
    pub topic: String,

    /// The delivered payload.
    pub payload: Payload,
}

/// Receiving side of the subscribers: the handler an operation forwards its payloads to.
pub type Publisher = mpsc::UnboundedSender<Publication>;

/// Identifier of a local subscriber of an operation.
pub type SubscriberId = u64;

/// Outcome of registering a subscriber.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Registration {
    /// Identifier of the operation the subscriber is attached to.
    pub operation_id: String,

    /// Identifier of the subscriber within the operation.
    pub subscriber_id: SubscriberId,

    /// Topic the operation's payloads are published on.
    pub topic: String,

    /// Indicates whether an already registered operation was reused.
    pub reused: bool,
}

/// Outcome of releasing a subscriber.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Release {
    /// The operation lost its last subscriber (or was forced) and has been removed. The server
    /// must be told to stop it, if it was ever started.
    Stop {
        /// Indicates whether the server knows about the operation.
        started: bool,
    },

    /// The operation is still referenced by this many subscribers.
    Retained(usize),

    /// No such operation or subscriber.
    Unknown,
}

struct Operation {
    options: StartPayload,
    extensions: Option<Vec<Extension>>,
    topic: String,
    started: bool,
    subscribers: Vec<(SubscriberId, Publisher)>,
}

impl Operation {
    fn publish(&mut self, payload: &Payload) {
        let publication = Publication {
            topic: self.topic.clone(),
            payload: payload.clone(),
        };
        // A closed receiver only means its `Subscription` is being dropped and its unsubscribe
        // request is on the way.
        for (_, publisher) in &self.subscribers {
            _ = publisher.unbounded_send(publication.clone());
        }
    }
}

/// Registry of the operations of one connection, in registration order.
pub(crate) struct Registry {
    service_name: String,
    last_operation_id: u64,
    last_subscriber_id: SubscriberId,
    operations: IndexMap<String, Operation>,
    keys: HashMap<String, String>,
}

impl Registry {
    pub(crate) fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            last_operation_id: 0,
            last_subscriber_id: 0,
            operations: IndexMap::new(),
            keys: HashMap::new(),
        }
    }

    /// Attaches the `publisher` to the operation described by `options`, registering a new
    /// operation unless an identical one is already registered.
    pub(crate) fn register(
        &mut self,
        options: StartPayload,
        extensions: Option<Vec<Extension>>,
        publisher: Publisher,
    ) -> Registration {
        self.last_subscriber_id += 1;
        let subscriber_id = self.last_subscriber_id;

        let key = options.dedup_key();
        if let Some(op) = self.keys.get(&key).and_then(|id| self.operations.get_mut(id)) {
            op.subscribers.push((subscriber_id, publisher));
            return Registration {
                operation_id: self.keys[&key].clone(),
                subscriber_id,
                topic: op.topic.clone(),
                reused: true,
            };
        }

        self.last_operation_id += 1;
        let operation_id = self.last_operation_id.to_string();
        let topic = format!("{}_{operation_id}", self.service_name);
        self.operations.insert(
            operation_id.clone(),
            Operation {
                options,
                extensions,
                topic: topic.clone(),
                started: false,
                subscribers: vec![(subscriber_id, publisher)],
            },
        );
        self.keys.insert(key, operation_id.clone());

        Registration {
            operation_id,
            subscriber_id,
            topic,
            reused: false,
        }
    }

    pub(crate) fn contains(&self, id: &str) -> bool {
        self.operations.contains_key(id)
    }

    pub(crate) fn is_started(&self, id: &str) -> bool {
        self.operations.get(id).is_some_and(|op| op.started)
    }

    /// Marks the operation as started, returning its "start" message, unless it's already started
    /// or unknown.
    pub(crate) fn mark_started(&mut self, id: &str) -> Option<ClientMessage> {
        let op = self.operations.get_mut(id).filter(|op| !op.started)?;
        op.started = true;
        Some(ClientMessage::Start {
            id: id.into(),
            payload: op.options.clone(),
            extensions: op.extensions.clone(),
        })
    }

    /// Returns the ids of the operations the server doesn't know about yet.
    pub(crate) fn unstarted(&self) -> Vec<String> {
        self.operations
            .iter()
            .filter(|(_, op)| !op.started)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Forgets that any operation has been started. Used when the connection is lost, as the
    /// server-side state is lost along with it.
    pub(crate) fn reset(&mut self) {
        for op in self.operations.values_mut() {
            op.started = false;
        }
    }

    /// Delivers the `payload` to every subscriber of the operation.
    pub(crate) fn publish(&mut self, id: &str, payload: Payload) -> bool {
        match self.operations.get_mut(id) {
            Some(op) => {
                op.publish(&payload);
                true
            }
            None => false,
        }
    }

    /// Removes the operation along with its dedup key.
    pub(crate) fn remove(&mut self, id: &str) -> bool {
        let Some(op) = self.operations.shift_remove(id) else {
            return false;
        };
        self.keys.remove(&op.options.dedup_key());
        true
    }

    /// Detaches a subscriber from the operation, deciding whether the operation must be stopped.
    ///
    /// Once stopped, the operation is removed and its remaining subscribers are terminated.
    pub(crate) fn release(
        &mut self,
        id: &str,
        subscriber_id: SubscriberId,
        force: bool,
    ) -> Release {
        let Some(op) = self.operations.get_mut(id) else {
            return Release::Unknown;
        };
        let Some(pos) = op.subscribers.iter().position(|(s, _)| *s == subscriber_id) else {
            if !force {
                return Release::Unknown;
            }
            return self.stop(id);
        };
        op.subscribers.remove(pos);

        if op.subscribers.is_empty() || force {
            self.stop(id)
        } else {
            Release::Retained(op.subscribers.len())
        }
    }

    /// Forcibly stops the operation, ignoring its subscribers count.
    pub(crate) fn force_release(&mut self, id: &str) -> Release {
        if self.contains(id) {
            self.stop(id)
        } else {
            Release::Unknown
        }
    }

    fn stop(&mut self, id: &str) -> Release {
        let started = self.is_started(id);
        self.publish(id, Payload::Terminated);
        self.remove(id);
        Release::Stop { started }
    }

    /// Number of subscribers currently referencing the operation.
    pub(crate) fn ref_count(&self, id: &str) -> usize {
        self.operations.get(id).map_or(0, |op| op.subscribers.len())
    }

    pub(crate) fn ids(&self) -> Vec<String> {
        self.operations.keys().cloned().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.operations.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Terminates every subscriber and forgets every operation.
    pub(crate) fn clear(&mut self) {
        for op in self.operations.values_mut() {
            op.publish(&Payload::Terminated);
        }
        self.operations.clear();
        self.keys.clear();
    }
}
