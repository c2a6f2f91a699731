// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Runtime
//!
//! The runtime owns the broker connection and turns router registrations into
//! live resources:
//! - every consumer registration gets its own channel, with QoS applied, and a
//!   dedicated thread running the channel's receive loop
//! - every publisher registration gets its own channel and a resolved exchange,
//!   exposed to application code as a [`Publisher`]
//!
//! Opening channels goes through a lock held by the runtime, as the connection
//! is not assumed to be safe for concurrent use. Mounts are serialized, and a
//! registration already bound is skipped when mounted again. A consumer whose
//! thread stopped no longer counts as bound: mounting it again starts a new
//! channel and thread.
//!
//! ```ignore
//! let connection = AmqpConnection::connect(&AmqpConfig::from_env()?)?;
//! let runtime = Runtime::new(Arc::new(connection), RuntimeConfig::from_env()?);
//!
//! runtime.mount(&orders::router())?;
//! let notify = runtime.publisher(&orders::NOTIFY)?;
//! ```

use crate::{
    broker::{BrokerChannel, BrokerConnection},
    config::RuntimeConfig,
    consumer::ConsumerWrapper,
    errors::MqError,
    listener::{ConsumerState, ConsumerThread, ListenerEntry},
    publisher::{Publisher, PublisherBinding},
    router::{
        resolve_exchange, ConsumerRegistration, PublisherHandle, PublisherRegistration,
        RegistrationId, Router,
    },
};
use parking_lot::Mutex;
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::Arc,
};
use tracing::{debug, error, info, Dispatch};

/// Router defaults inherited by the registrations of a mount.
#[derive(Debug, Clone, Copy, Default)]
struct Inherited<'r> {
    exchange: Option<&'r str>,
    prefetch_count: Option<u16>,
    tracked: Option<bool>,
}

impl<'r> From<&'r Router> for Inherited<'r> {
    fn from(router: &'r Router) -> Self {
        Self {
            exchange: router.default_exchange(),
            prefetch_count: router.default_prefetch_count(),
            tracked: router.default_tracked(),
        }
    }
}

struct MountedPublisher {
    registration: PublisherRegistration,
    binding: Arc<PublisherBinding>,
}

#[derive(Default)]
struct State {
    listener: BTreeMap<String, Vec<ListenerEntry>>,
    publishers: HashMap<RegistrationId, MountedPublisher>,
    bound: HashSet<RegistrationId>,
    shut_down: bool,
}

impl State {
    /// Forgets consumers whose thread stopped, so they can be bound again.
    fn prune_stopped(&mut self) {
        let bound = &mut self.bound;
        for entries in self.listener.values_mut() {
            entries.retain(|entry| {
                if entry.thread.state() != ConsumerState::Stopped {
                    return true;
                }
                debug!(
                    queue = entry.thread.queue(),
                    registration = %entry.registration.id,
                    "forgetting stopped consumer"
                );
                bound.remove(&entry.registration.id);
                false
            });
        }
        self.listener.retain(|_, entries| !entries.is_empty());
    }
}

/// Binds routers onto a broker connection.
pub struct Runtime {
    connection: Arc<dyn BrokerConnection>,
    connection_lock: Mutex<()>,
    mount_lock: Mutex<()>,
    config: RuntimeConfig,
    logger: Option<Dispatch>,
    state: Mutex<State>,
}

impl Runtime {
    /// Creates a runtime over `connection`.
    ///
    /// # Parameters
    /// * `connection` - The broker connection every channel is opened on
    /// * `config` - Default exchange, prefetch and tracked flag of the registrations
    ///
    /// # Returns
    /// A runtime with nothing bound
    pub fn new(connection: Arc<dyn BrokerConnection>, config: RuntimeConfig) -> Self {
        Runtime {
            connection,
            connection_lock: Mutex::new(()),
            mount_lock: Mutex::new(()),
            config,
            logger: None,
            state: Mutex::new(State::default()),
        }
    }

    /// Routes the runtime's logs to `logger` instead of the global subscriber.
    ///
    /// Consumer threads install it as their default; publishers run under it.
    pub fn with_logger(mut self, logger: Dispatch) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Binds every registration of `router`.
    ///
    /// Returns once all consumer threads of the router are running. When a
    /// binding fails, whatever this call bound is released before the error
    /// is returned.
    pub fn mount(&self, router: &Router) -> Result<(), MqError> {
        self.logged(|| self.mount_router(router))
    }

    fn mount_router(&self, router: &Router) -> Result<(), MqError> {
        let _mount = self.mount_lock.lock();
        let inherited = Inherited::from(router);
        let mut bound = vec![];

        match self.mount_entries(router, inherited, &mut bound) {
            Ok(()) => {
                info!(
                    queues = router.consumers.len(),
                    bound = bound.len(),
                    "router mounted"
                );
                Ok(())
            }
            Err(err) => {
                error!(error = err.to_string(), "failure to mount router");
                self.release(&bound);
                Err(err)
            }
        }
    }

    fn mount_entries(
        &self,
        router: &Router,
        inherited: Inherited<'_>,
        bound: &mut Vec<RegistrationId>,
    ) -> Result<(), MqError> {
        for (queue, registrations) in &router.consumers {
            for registration in registrations {
                if self.bind_consumer(queue, registration, inherited)? {
                    bound.push(registration.id);
                }
            }
        }

        for ((exchange, routing_key), registrations) in &router.publishers {
            for registration in registrations {
                if self.bind_publisher(routing_key, exchange.as_deref(), registration, inherited)? {
                    bound.push(registration.id);
                }
            }
        }

        Ok(())
    }

    /// Binds a single consumer registration with the runtime's defaults.
    ///
    /// # Parameters
    /// * `queue` - Queue the consumer reads from
    /// * `registration` - A registration taken from a [`Router`]
    ///
    /// # Returns
    /// Ok(()) once the consumer thread is running, or when the registration is
    /// already bound
    pub fn add_consumer(
        &self,
        queue: &str,
        registration: &ConsumerRegistration,
    ) -> Result<(), MqError> {
        self.logged(|| self.bind_consumer(queue, registration, Inherited::default()))
            .map(|_| ())
    }

    /// Binds a single publisher registration with the runtime's defaults.
    ///
    /// # Parameters
    /// * `routing_key` - Routing key of the published messages
    /// * `exchange` - Overrides the runtime's exchange; the registration's own
    ///   exchange overrides both
    /// * `registration` - A registration taken from a [`Router`]
    ///
    /// # Returns
    /// Ok(()) once the publisher channel is open, or when the registration is
    /// already bound
    pub fn add_publisher(
        &self,
        routing_key: &str,
        exchange: Option<&str>,
        registration: &PublisherRegistration,
    ) -> Result<(), MqError> {
        let inherited = Inherited {
            exchange,
            ..Inherited::default()
        };
        self.logged(|| {
            self.bind_publisher(routing_key, registration.exchange(), registration, inherited)
        })
        .map(|_| ())
    }

    /// Returns the callable publisher of a mounted registration.
    ///
    /// # Returns
    /// `PublisherNotMounted` when the handle was never bound on this runtime,
    /// `PublisherTypeMismatch` when `A` is not the registered argument type
    pub fn publisher<A: 'static>(
        &self,
        handle: &PublisherHandle<A>,
    ) -> Result<Publisher<A>, MqError> {
        let state = self.state.lock();
        let mounted = state
            .publishers
            .get(&handle.id())
            .ok_or(MqError::PublisherNotMounted(handle.id()))?;

        Publisher::realize(mounted.binding.clone(), &mounted.registration.producer)
    }

    /// Consumers bound on `queue`, in binding order.
    pub fn listener(&self, queue: &str) -> Vec<ListenerEntry> {
        self.state
            .lock()
            .listener
            .get(queue)
            .cloned()
            .unwrap_or_default()
    }

    /// Queues with at least one bound consumer.
    pub fn queues(&self) -> Vec<String> {
        self.state.lock().listener.keys().cloned().collect()
    }

    pub fn is_bound(&self, registration: RegistrationId) -> bool {
        self.state.lock().bound.contains(&registration)
    }

    /// Stops every consumer thread, waits for them, releases the publishers and
    /// closes the connection. Calling it again does nothing.
    pub fn shutdown(&self) -> Result<(), MqError> {
        self.logged(|| self.shutdown_all())
    }

    fn shutdown_all(&self) -> Result<(), MqError> {
        let _mount = self.mount_lock.lock();

        let (threads, publishers) = {
            let mut state = self.state.lock();
            if state.shut_down {
                return Ok(());
            }
            state.shut_down = true;
            state.bound.clear();

            let threads: Vec<_> = std::mem::take(&mut state.listener)
                .into_values()
                .flatten()
                .map(|entry| entry.thread)
                .collect();
            let publishers: Vec<_> = std::mem::take(&mut state.publishers)
                .into_values()
                .map(|mounted| mounted.binding)
                .collect();
            (threads, publishers)
        };

        info!(consumers = threads.len(), "shutting down");

        for thread in &threads {
            thread.stop();
        }
        for thread in &threads {
            thread.join();
        }
        for binding in &publishers {
            binding.close();
        }

        let _conn = self.connection_lock.lock();
        self.connection.close()
    }

    /// Binds `registration` on `queue`. `Ok(false)` when it was already bound.
    fn bind_consumer(
        &self,
        queue: &str,
        registration: &ConsumerRegistration,
        inherited: Inherited<'_>,
    ) -> Result<bool, MqError> {
        if !self.reserve(registration.id)? {
            debug!(queue, registration = %registration.id, "consumer already bound");
            return Ok(false);
        }

        match self.start_consumer(queue, registration, inherited) {
            Ok(thread) => {
                self.state
                    .lock()
                    .listener
                    .entry(queue.to_owned())
                    .or_default()
                    .push(ListenerEntry {
                        registration: registration.clone(),
                        thread,
                    });
                Ok(true)
            }
            Err(err) => {
                self.state.lock().bound.remove(&registration.id);
                Err(err)
            }
        }
    }

    fn start_consumer(
        &self,
        queue: &str,
        registration: &ConsumerRegistration,
        inherited: Inherited<'_>,
    ) -> Result<Arc<ConsumerThread>, MqError> {
        let prefetch_count = inherited
            .prefetch_count
            .unwrap_or(self.config.prefetch_count);
        let tracked = registration
            .tracked
            .or(inherited.tracked)
            .unwrap_or(self.config.tracked);

        let mut channel = self.open_channel()?;
        channel.set_qos(prefetch_count).map_err(|err| {
            error!(queue, prefetch_count, error = err.to_string(), "failure to configure qos");
            err
        })?;

        let thread = Arc::new(ConsumerThread::bound(registration.id, queue, prefetch_count));

        let wrapper = ConsumerWrapper::new(
            queue,
            registration.handler.clone(),
            tracked,
            self.config.requeue_on_failure,
        );
        channel.consume(queue, wrapper.into_callback()).map_err(|err| {
            error!(queue, error = err.to_string(), "failure to declare consumer");
            err
        })?;

        thread.start(channel, self.logger.clone())?;

        debug!(queue, registration = %registration.id, prefetch_count, tracked, "consumer bound");
        Ok(thread)
    }

    /// Binds a publisher. `explicit` is the call-site exchange.
    fn bind_publisher(
        &self,
        routing_key: &str,
        explicit: Option<&str>,
        registration: &PublisherRegistration,
        inherited: Inherited<'_>,
    ) -> Result<bool, MqError> {
        if !self.reserve(registration.id)? {
            debug!(routing_key, registration = %registration.id, "publisher already bound");
            return Ok(false);
        }

        let exchange = resolve_exchange(explicit, inherited.exchange, &self.config.exchange);
        let tracked = registration
            .tracked
            .or(inherited.tracked)
            .unwrap_or(self.config.tracked);

        let channel = match self.open_channel() {
            Ok(channel) => channel,
            Err(err) => {
                self.state.lock().bound.remove(&registration.id);
                return Err(err);
            }
        };

        let binding = Arc::new(PublisherBinding::new(
            registration.id,
            &exchange,
            routing_key,
            tracked,
            channel,
            self.logger.clone(),
        ));

        self.state.lock().publishers.insert(
            registration.id,
            MountedPublisher {
                registration: registration.clone(),
                binding,
            },
        );

        debug!(exchange = exchange.as_str(), routing_key, registration = %registration.id, "publisher bound");
        Ok(true)
    }

    /// Marks `registration` as bound. `Ok(false)` when it already was.
    fn reserve(&self, registration: RegistrationId) -> Result<bool, MqError> {
        let mut state = self.state.lock();
        if state.shut_down {
            return Err(MqError::RuntimeShutdown);
        }
        state.prune_stopped();
        Ok(state.bound.insert(registration))
    }

    /// Unbinds the given registrations, stopping and joining their threads.
    fn release(&self, registrations: &[RegistrationId]) {
        let mut threads = vec![];
        {
            let mut state = self.state.lock();
            for id in registrations {
                state.bound.remove(id);
                if let Some(mounted) = state.publishers.remove(id) {
                    mounted.binding.close();
                }
            }
            for entries in state.listener.values_mut() {
                entries.retain(|entry| {
                    if registrations.contains(&entry.registration.id) {
                        threads.push(entry.thread.clone());
                        false
                    } else {
                        true
                    }
                });
            }
            state.listener.retain(|_, entries| !entries.is_empty());
        }

        for thread in &threads {
            thread.stop();
        }
        for thread in &threads {
            thread.join();
        }
    }

    fn logged<T>(&self, f: impl FnOnce() -> T) -> T {
        match &self.logger {
            Some(logger) => tracing::dispatcher::with_default(logger, f),
            None => f(),
        }
    }

    fn open_channel(&self) -> Result<Box<dyn BrokerChannel>, MqError> {
        let _conn = self.connection_lock.lock();
        self.connection.open_channel().map_err(|err| {
            error!(error = err.to_string(), "failure to create the channel");
            err
        })
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        for thread in state.listener.values().flatten().map(|entry| &entry.thread) {
            thread.stop();
        }
    }
}
