// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Router
//!
//! A [`Router`] collects consumer and publisher registrations without touching
//! a broker. Registering is a pure append: several consumers on the same queue
//! are all kept, in registration order, each one getting its own subscription
//! once mounted. The router's default exchange, prefetch count and tracked flag
//! are carried alongside the registrations and only resolved when the router is
//! mounted onto a [`Runtime`](crate::runtime::Runtime).
//!
//! ```ignore
//! let mut router = Router::new().exchange("orders-ex");
//!
//! router.register_consumer("orders.created", |order: Order| {
//!     info!(id = order.id, "new order");
//!     Ok(())
//! });
//!
//! let notify = router.register_publisher("order.created", None, |order: Order| Ok(order));
//! ```

use crate::{
    consumer::{json_handler, ConsumeHandler},
    errors::HandlerError,
    publisher::{json_producer, AnyProducer},
};
use serde::{de::DeserializeOwned, Serialize};
use std::{collections::BTreeMap, fmt, marker::PhantomData, sync::Arc};
use uuid::Uuid;

/// Opaque identity of a registration.
///
/// Each registration is bound to its own channel, and a runtime binds a given
/// identity at most once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegistrationId(Uuid);

impl RegistrationId {
    pub(crate) fn new() -> Self {
        RegistrationId(Uuid::new_v4())
    }
}

impl fmt::Display for RegistrationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A handler bound to a queue.
#[derive(Clone)]
pub struct ConsumerRegistration {
    pub(crate) id: RegistrationId,
    pub(crate) queue: String,
    pub(crate) tracked: Option<bool>,
    pub(crate) handler: Arc<dyn ConsumeHandler>,
}

impl ConsumerRegistration {
    pub fn id(&self) -> RegistrationId {
        self.id
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Tracked flag set at registration, if any.
    pub fn tracked(&self) -> Option<bool> {
        self.tracked
    }
}

impl fmt::Debug for ConsumerRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerRegistration")
            .field("id", &self.id)
            .field("queue", &self.queue)
            .field("tracked", &self.tracked)
            .finish_non_exhaustive()
    }
}

/// A producer function bound to an (exchange, routing key) pair.
#[derive(Clone)]
pub struct PublisherRegistration {
    pub(crate) id: RegistrationId,
    pub(crate) exchange: Option<String>,
    pub(crate) routing_key: String,
    pub(crate) tracked: Option<bool>,
    pub(crate) producer: AnyProducer,
}

impl PublisherRegistration {
    pub fn id(&self) -> RegistrationId {
        self.id
    }

    /// Exchange given at the call site, if any.
    pub fn exchange(&self) -> Option<&str> {
        self.exchange.as_deref()
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub fn tracked(&self) -> Option<bool> {
        self.tracked
    }
}

impl fmt::Debug for PublisherRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublisherRegistration")
            .field("id", &self.id)
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("tracked", &self.tracked)
            .finish_non_exhaustive()
    }
}

/// Typed handle of a publisher registration taking `A` as arguments.
///
/// Exchange it for a callable [`Publisher`](crate::publisher::Publisher) with
/// [`Runtime::publisher`](crate::runtime::Runtime::publisher) once mounted.
pub struct PublisherHandle<A> {
    id: RegistrationId,
    _args: PhantomData<fn(A)>,
}

impl<A> PublisherHandle<A> {
    pub fn id(&self) -> RegistrationId {
        self.id
    }
}

impl<A> Clone for PublisherHandle<A> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<A> Copy for PublisherHandle<A> {}

impl<A> fmt::Debug for PublisherHandle<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PublisherHandle").field(&self.id).finish()
    }
}

/// Key of the publisher table: the explicit exchange, if any, and the routing key.
pub type PublisherKey = (Option<String>, String);

/// Registry of consumers and publishers, independent of any broker connection.
#[derive(Clone, Default)]
pub struct Router {
    exchange: Option<String>,
    prefetch_count: Option<u16>,
    tracked: Option<bool>,
    pub(crate) consumers: BTreeMap<String, Vec<ConsumerRegistration>>,
    pub(crate) publishers: BTreeMap<PublisherKey, Vec<PublisherRegistration>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the exchange inherited by publishers registered without one.
    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange = Some(exchange.to_owned());
        self
    }

    /// Sets the QoS applied to the channels of this router's consumers.
    pub fn prefetch_count(mut self, prefetch_count: u16) -> Self {
        self.prefetch_count = Some(prefetch_count);
        self
    }

    /// Sets whether this router's handlers are timed and logged.
    pub fn tracked(mut self, tracked: bool) -> Self {
        self.tracked = Some(tracked);
        self
    }

    pub fn default_exchange(&self) -> Option<&str> {
        self.exchange.as_deref()
    }

    pub fn default_prefetch_count(&self) -> Option<u16> {
        self.prefetch_count
    }

    pub fn default_tracked(&self) -> Option<bool> {
        self.tracked
    }

    /// Registers `handler` on `queue`, decoding every payload as JSON into `T`.
    ///
    /// Registering another handler on the same queue adds a second subscription.
    ///
    /// # Parameters
    /// * `queue` - Name of an existing queue
    /// * `handler` - Function called with every decoded payload
    ///
    /// # Returns
    /// The identity of the registration, as listed by the runtime once mounted
    pub fn register_consumer<T, F>(&mut self, queue: &str, handler: F) -> RegistrationId
    where
        T: DeserializeOwned + 'static,
        F: Fn(T) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.push_consumer(queue, None, json_handler(handler))
    }

    /// Same as [`register_consumer`](Router::register_consumer) with an explicit
    /// tracked flag overriding the router and runtime defaults.
    pub fn register_tracked_consumer<T, F>(
        &mut self,
        queue: &str,
        tracked: bool,
        handler: F,
    ) -> RegistrationId
    where
        T: DeserializeOwned + 'static,
        F: Fn(T) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.push_consumer(queue, Some(tracked), json_handler(handler))
    }

    fn push_consumer(
        &mut self,
        queue: &str,
        tracked: Option<bool>,
        handler: Arc<dyn ConsumeHandler>,
    ) -> RegistrationId {
        let registration = ConsumerRegistration {
            id: RegistrationId::new(),
            queue: queue.to_owned(),
            tracked,
            handler,
        };
        let id = registration.id;

        self.consumers
            .entry(queue.to_owned())
            .or_default()
            .push(registration);

        id
    }

    /// Registers `producer` as a publisher on `routing_key`.
    ///
    /// The value returned by `producer` is serialized as JSON and published to
    /// `exchange` when given, else to the router's exchange, else to the
    /// runtime's exchange.
    ///
    /// # Parameters
    /// * `routing_key` - Routing key of every message of this publisher
    /// * `exchange` - Call-site exchange, overriding the router and runtime defaults
    /// * `producer` - Function turning the publisher arguments into the payload
    ///
    /// # Returns
    /// A typed handle, exchanged for a callable publisher once mounted
    pub fn register_publisher<A, T, F>(
        &mut self,
        routing_key: &str,
        exchange: Option<&str>,
        producer: F,
    ) -> PublisherHandle<A>
    where
        A: 'static,
        T: Serialize,
        F: Fn(A) -> Result<T, HandlerError> + Send + Sync + 'static,
    {
        self.push_publisher(routing_key, exchange, None, json_producer(producer))
    }

    /// Same as [`register_publisher`](Router::register_publisher) with an
    /// explicit tracked flag overriding the router and runtime defaults.
    pub fn register_tracked_publisher<A, T, F>(
        &mut self,
        routing_key: &str,
        exchange: Option<&str>,
        tracked: bool,
        producer: F,
    ) -> PublisherHandle<A>
    where
        A: 'static,
        T: Serialize,
        F: Fn(A) -> Result<T, HandlerError> + Send + Sync + 'static,
    {
        self.push_publisher(routing_key, exchange, Some(tracked), json_producer(producer))
    }

    fn push_publisher<A>(
        &mut self,
        routing_key: &str,
        exchange: Option<&str>,
        tracked: Option<bool>,
        producer: AnyProducer,
    ) -> PublisherHandle<A> {
        let exchange = exchange.map(str::to_owned);
        let registration = PublisherRegistration {
            id: RegistrationId::new(),
            exchange: exchange.clone(),
            routing_key: routing_key.to_owned(),
            tracked,
            producer,
        };
        let id = registration.id;

        self.publishers
            .entry((exchange, routing_key.to_owned()))
            .or_default()
            .push(registration);

        PublisherHandle {
            id,
            _args: PhantomData,
        }
    }

    /// Consumers registered on `queue`, in registration order.
    pub fn consumers(&self, queue: &str) -> &[ConsumerRegistration] {
        self.consumers.get(queue).map(Vec::as_slice).unwrap_or_default()
    }

    /// Queues with at least one consumer.
    pub fn queues(&self) -> impl Iterator<Item = &str> {
        self.consumers.keys().map(String::as_str)
    }

    /// Publishers registered on `routing_key` with the given explicit exchange.
    pub fn publishers(
        &self,
        exchange: Option<&str>,
        routing_key: &str,
    ) -> &[PublisherRegistration] {
        self.publishers
            .get(&(exchange.map(str::to_owned), routing_key.to_owned()))
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.consumers.is_empty() && self.publishers.is_empty()
    }
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("exchange", &self.exchange)
            .field("prefetch_count", &self.prefetch_count)
            .field("tracked", &self.tracked)
            .field("consumers", &self.consumers)
            .field("publishers", &self.publishers)
            .finish()
    }
}

/// Resolves the exchange of a publisher.
///
/// The call-site exchange wins over the router's default, which wins over the
/// runtime's. Empty names count as unset.
pub(crate) fn resolve_exchange(
    explicit: Option<&str>,
    router: Option<&str>,
    runtime: &str,
) -> String {
    explicit
        .filter(|ex| !ex.is_empty())
        .or(router.filter(|ex| !ex.is_empty()))
        .unwrap_or(runtime)
        .to_owned()
}
