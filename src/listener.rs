// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Threads
//!
//! Every bound consumer registration runs on its own OS thread, which owns the
//! registration's channel and blocks in the channel's receive loop. A thread
//! goes through `Bound` (channel allocated, QoS applied, consumer declared),
//! `Consuming` (receive loop running) and `Stopped` (loop returned). A stopped
//! thread is never restarted.

use crate::{
    broker::{BrokerChannel, StopSignal},
    errors::MqError,
    router::{ConsumerRegistration, RegistrationId},
};
use parking_lot::Mutex;
use std::{
    sync::{
        atomic::{AtomicU8, Ordering},
        mpsc, Arc,
    },
    thread::{self, JoinHandle},
};
use tracing::{debug, error, warn, Dispatch};

/// Lifecycle state of a consumer registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Registered,
    Bound,
    Consuming,
    Stopped,
}

impl ConsumerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConsumerState::Registered,
            1 => ConsumerState::Bound,
            2 => ConsumerState::Consuming,
            _ => ConsumerState::Stopped,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            ConsumerState::Registered => 0,
            ConsumerState::Bound => 1,
            ConsumerState::Consuming => 2,
            ConsumerState::Stopped => 3,
        }
    }
}

/// The thread consuming one queue on behalf of one registration.
pub struct ConsumerThread {
    registration: RegistrationId,
    queue: String,
    prefetch_count: u16,
    state: Arc<AtomicU8>,
    stop: StopSignal,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ConsumerThread {
    /// A thread record for a registration whose channel is allocated and configured.
    pub(crate) fn bound(registration: RegistrationId, queue: &str, prefetch_count: u16) -> Self {
        Self {
            registration,
            queue: queue.to_owned(),
            prefetch_count,
            state: Arc::new(AtomicU8::new(ConsumerState::Bound.as_u8())),
            stop: StopSignal::new(),
            handle: Mutex::new(None),
        }
    }

    /// Spawns the receive loop over `channel`, returning once it is running.
    pub(crate) fn start(
        &self,
        mut channel: Box<dyn BrokerChannel>,
        logger: Option<Dispatch>,
    ) -> Result<(), MqError> {
        let (started_tx, started_rx) = mpsc::sync_channel::<()>(1);
        let state = self.state.clone();
        let stop = self.stop.clone();
        let queue = self.queue.clone();

        let handle = thread::Builder::new()
            .name(format!("mq-consumer-{}", self.queue))
            .spawn(move || {
                let _logger = logger.as_ref().map(tracing::dispatcher::set_default);

                state.store(ConsumerState::Consuming.as_u8(), Ordering::SeqCst);
                let _ = started_tx.send(());
                debug!(queue, "consumer started");

                match channel.run_until_closed(&stop) {
                    Ok(()) => debug!(queue, "consumer stopped"),
                    Err(err) if stop.is_stopped() => {
                        debug!(queue, error = err.to_string(), "consumer stopped")
                    }
                    Err(err) => error!(queue, error = err.to_string(), "consumer terminated"),
                }

                state.store(ConsumerState::Stopped.as_u8(), Ordering::SeqCst);
            })
            .map_err(|err| {
                error!(error = err.to_string(), "failure to spawn consumer thread");
                MqError::SpawnThreadError(self.queue.clone())
            })?;

        *self.handle.lock() = Some(handle);

        started_rx.recv().map_err(|_| {
            error!(queue = self.queue, "consumer thread exited before starting");
            MqError::SpawnThreadError(self.queue.clone())
        })
    }

    pub fn registration(&self) -> RegistrationId {
        self.registration
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// QoS applied to the thread's channel.
    pub fn prefetch_count(&self) -> u16 {
        self.prefetch_count
    }

    pub fn state(&self) -> ConsumerState {
        ConsumerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_running(&self) -> bool {
        self.state() == ConsumerState::Consuming
    }

    /// Asks the receive loop to return. The thread stops after the delivery in
    /// progress, if any.
    pub fn stop(&self) {
        self.stop.stop();
    }

    /// Waits for the thread to exit. Returns immediately when already joined.
    pub fn join(&self) {
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!(queue = self.queue, "consumer thread panicked");
                self.state
                    .store(ConsumerState::Stopped.as_u8(), Ordering::SeqCst);
            }
        }
    }
}

impl std::fmt::Debug for ConsumerThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerThread")
            .field("registration", &self.registration)
            .field("queue", &self.queue)
            .field("prefetch_count", &self.prefetch_count)
            .field("state", &self.state())
            .finish()
    }
}

/// A mounted consumer: its registration and the thread consuming for it.
#[derive(Debug, Clone)]
pub struct ListenerEntry {
    pub registration: ConsumerRegistration,
    pub thread: Arc<ConsumerThread>,
}
