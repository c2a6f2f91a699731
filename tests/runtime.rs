// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use mq_router::{
    broker::{Acknowledgement, BrokerConnection, Headers},
    config::RuntimeConfig,
    errors::{HandlerError, MqError},
    listener::ConsumerState,
    memory::MemoryBroker,
    router::Router,
    runtime::Runtime,
};
use opentelemetry::global;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use serde::{Deserialize, Serialize};
use std::{
    io,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    thread,
    time::{Duration, Instant},
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Order {
    id: u64,
}

fn order(id: u64) -> Vec<u8> {
    serde_json::to_vec(&Order { id }).unwrap()
}

fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    cond()
}

fn runtime(broker: &MemoryBroker, config: RuntimeConfig) -> Runtime {
    Runtime::new(Arc::new(broker.connect()), config)
}

fn counting(counter: &Arc<AtomicUsize>) -> impl Fn(Order) -> Result<(), HandlerError> {
    let counter = counter.clone();
    move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[test]
fn mounted_consumer_gets_a_running_thread_and_qos() {
    let broker = MemoryBroker::new();
    broker.declare_queue("orders.created");
    let runtime = runtime(
        &broker,
        RuntimeConfig::default().exchange("notify").prefetch_count(1),
    );

    let mut router = Router::new();
    let h1 = router.register_consumer("orders.created", |_: Order| Ok(()));
    runtime.mount(&router).unwrap();

    let listener = runtime.listener("orders.created");
    assert_eq!(listener.len(), 1);
    assert_eq!(listener[0].registration.id(), h1);
    assert!(listener[0].thread.is_running());
    assert_eq!(listener[0].thread.state(), ConsumerState::Consuming);

    let consumers = broker.consumers("orders.created");
    assert_eq!(consumers.len(), 1);
    assert_eq!(consumers[0].prefetch_count, Some(1));

    runtime.shutdown().unwrap();
}

#[test]
fn publisher_without_exchange_uses_router_exchange() {
    let broker = MemoryBroker::new();
    let runtime = runtime(&broker, RuntimeConfig::default().exchange("notify"));

    let mut router = Router::new().exchange("orders-ex");
    let p1 = router.register_publisher("order.created", None, |id: u64| Ok(Order { id }));
    runtime.mount(&router).unwrap();

    let receipt = runtime.publisher(&p1).unwrap().publish(7).unwrap();
    assert_eq!(receipt.exchange, "orders-ex");

    let published = broker.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].exchange, "orders-ex");
    assert_eq!(published[0].routing_key, "order.created");
    assert_eq!(published[0].content_type, "application/json");
    assert_eq!(published[0].body, order(7));
}

#[test]
fn exchange_resolution_precedence() {
    let broker = MemoryBroker::new();
    let runtime = runtime(&broker, RuntimeConfig::default().exchange("ex2"));

    let mut with_default = Router::new().exchange("ex1");
    let explicit = with_default.register_publisher("k", Some("X"), |_: ()| Ok(1));
    let inherited = with_default.register_publisher("k", None, |_: ()| Ok(1));

    let mut without_default = Router::new();
    let fallback = without_default.register_publisher("k", None, |_: ()| Ok(1));

    runtime.mount(&with_default).unwrap();
    runtime.mount(&without_default).unwrap();

    assert_eq!(runtime.publisher(&explicit).unwrap().exchange(), "X");
    assert_eq!(runtime.publisher(&inherited).unwrap().exchange(), "ex1");
    assert_eq!(runtime.publisher(&fallback).unwrap().exchange(), "ex2");
}

#[test]
fn failing_handler_does_not_stop_other_queues() {
    let broker = MemoryBroker::new();
    broker.declare_queue("a");
    broker.declare_queue("b");
    let runtime = runtime(&broker, RuntimeConfig::default());

    let handled = Arc::new(AtomicUsize::new(0));
    let mut router = Router::new();
    router.register_consumer("a", |_: Order| Err("always failing".into()));
    router.register_consumer("a", |order: Order| {
        if order.id > 0 {
            panic!("panicking handler");
        }
        Ok(())
    });
    router.register_consumer("b", counting(&handled));
    runtime.mount(&router).unwrap();

    for id in 1..=5 {
        broker.deliver("a", order(id)).unwrap();
        broker.deliver("b", order(id)).unwrap();
    }

    assert!(wait_until(|| handled.load(Ordering::SeqCst) == 5));
    assert!(wait_until(|| broker.acknowledgements("a").len() == 10));

    for entry in runtime.listener("a").iter().chain(runtime.listener("b").iter()) {
        assert!(entry.thread.is_running());
    }
    assert!(broker
        .acknowledgements("a")
        .iter()
        .all(|r| r.acknowledgement == Acknowledgement::Nack { requeue: false }));
    assert!(broker
        .acknowledgements("b")
        .iter()
        .all(|r| r.acknowledgement == Acknowledgement::Ack));

    // the failing queue still delivers
    broker.deliver("a", order(0)).unwrap();
    assert!(wait_until(|| broker
        .acknowledgements("a")
        .iter()
        .any(|r| r.acknowledgement == Acknowledgement::Ack)));

    runtime.shutdown().unwrap();
}

#[test]
fn router_prefetch_applies_to_all_its_consumer_channels() {
    let broker = MemoryBroker::new();
    broker.declare_queue("a");
    broker.declare_queue("b");
    let runtime = runtime(&broker, RuntimeConfig::default().prefetch_count(1));

    let mut router = Router::new().prefetch_count(5);
    router.register_consumer("a", |_: Order| Ok(()));
    router.register_consumer("a", |_: Order| Ok(()));
    router.register_consumer("b", |_: Order| Ok(()));
    runtime.mount(&router).unwrap();

    let channels: Vec<_> = broker
        .consumers("a")
        .into_iter()
        .chain(broker.consumers("b"))
        .collect();
    assert_eq!(channels.len(), 3);
    assert!(channels.iter().all(|c| c.prefetch_count == Some(5)));

    runtime.shutdown().unwrap();
}

#[test]
fn handlers_on_the_same_queue_each_get_a_subscription() {
    let broker = MemoryBroker::new();
    broker.declare_queue("orders.created");
    let runtime = runtime(&broker, RuntimeConfig::default());

    let first = Arc::new(AtomicUsize::new(0));
    let second = Arc::new(AtomicUsize::new(0));
    let mut router = Router::new();
    let ids = [
        router.register_consumer("orders.created", counting(&first)),
        router.register_consumer("orders.created", counting(&second)),
    ];
    runtime.mount(&router).unwrap();

    let listener = runtime.listener("orders.created");
    assert_eq!(
        listener.iter().map(|e| e.registration.id()).collect::<Vec<_>>(),
        ids
    );

    let consumers = broker.consumers("orders.created");
    assert_eq!(consumers.len(), 2);
    assert_ne!(consumers[0].id, consumers[1].id);

    broker.deliver("orders.created", order(1)).unwrap();
    assert!(wait_until(|| first.load(Ordering::SeqCst) == 1 && second.load(Ordering::SeqCst) == 1));

    runtime.shutdown().unwrap();
}

#[test]
fn mounting_twice_does_not_duplicate_bindings() {
    let broker = MemoryBroker::new();
    broker.declare_queue("orders.created");
    let runtime = runtime(&broker, RuntimeConfig::default());

    let mut router = Router::new();
    router.register_consumer("orders.created", |_: Order| Ok(()));
    let publisher = router.register_publisher("order.created", None, |id: u64| Ok(id));

    runtime.mount(&router).unwrap();
    let channels = broker.channels().len();
    runtime.mount(&router).unwrap();
    runtime.mount(&router.clone()).unwrap();

    assert_eq!(runtime.listener("orders.created").len(), 1);
    assert_eq!(broker.consumers("orders.created").len(), 1);
    assert_eq!(broker.channels().len(), channels);
    assert!(runtime.is_bound(publisher.id()));

    runtime.shutdown().unwrap();
}

#[test]
fn mount_error_is_returned_and_rolled_back() {
    let broker = MemoryBroker::new();
    broker.declare_queue("a");
    let runtime = runtime(&broker, RuntimeConfig::default());

    let mut router = Router::new();
    let bound_first = router.register_consumer("a", |_: Order| Ok(()));
    router.register_consumer("missing", |_: Order| Ok(()));

    assert_eq!(
        runtime.mount(&router),
        Err(MqError::QueueNotFound("missing".to_owned()))
    );
    assert!(runtime.queues().is_empty());
    assert!(!runtime.is_bound(bound_first));
    assert!(wait_until(|| broker.consumers("a").is_empty()));
}

#[test]
fn open_channel_failure_is_returned_from_mount() {
    let broker = MemoryBroker::new();
    broker.fail_open_channel(true);
    let runtime = runtime(&broker, RuntimeConfig::default());

    let mut router = Router::new();
    router.register_publisher("k", None, |_: ()| Ok(1));

    assert_eq!(runtime.mount(&router), Err(MqError::ChannelError));
}

#[test]
fn shutdown_stops_consumers_and_publishers() {
    let broker = MemoryBroker::new();
    broker.declare_queue("q");
    let runtime = runtime(&broker, RuntimeConfig::default());

    let mut router = Router::new();
    router.register_consumer("q", |_: Order| Ok(()));
    let handle = router.register_publisher("k", None, |_: ()| Ok(1));
    runtime.mount(&router).unwrap();

    let thread = runtime.listener("q")[0].thread.clone();
    let publisher = runtime.publisher(&handle).unwrap();

    runtime.shutdown().unwrap();

    assert_eq!(thread.state(), ConsumerState::Stopped);
    assert!(runtime.listener("q").is_empty());
    assert_eq!(publisher.publish(()), Err(MqError::RuntimeShutdown));
    assert!(broker.consumers("q").is_empty());
}

#[test]
fn closing_the_connection_stops_consumer_threads() {
    let broker = MemoryBroker::new();
    broker.declare_queue("q");
    let connection = Arc::new(broker.connect());
    let runtime = Runtime::new(connection.clone(), RuntimeConfig::default());

    let mut router = Router::new();
    router.register_consumer("q", |_: Order| Ok(()));
    runtime.mount(&router).unwrap();

    let thread = runtime.listener("q")[0].thread.clone();
    connection.close().unwrap();

    assert!(wait_until(|| thread.state() == ConsumerState::Stopped));
}

#[test]
fn a_single_consumer_can_be_stopped() {
    let broker = MemoryBroker::new();
    broker.declare_queue("a");
    broker.declare_queue("b");
    let runtime = runtime(&broker, RuntimeConfig::default());

    let mut router = Router::new();
    router.register_consumer("a", |_: Order| Ok(()));
    router.register_consumer("b", |_: Order| Ok(()));
    runtime.mount(&router).unwrap();

    let a = runtime.listener("a")[0].thread.clone();
    a.stop();
    a.join();

    assert_eq!(a.state(), ConsumerState::Stopped);
    assert!(runtime.listener("b")[0].thread.is_running());

    runtime.shutdown().unwrap();
}

#[test]
fn stopped_consumer_is_bound_again_on_remount() {
    let broker = MemoryBroker::new();
    broker.declare_queue("q");
    let runtime = runtime(&broker, RuntimeConfig::default());

    let handled = Arc::new(AtomicUsize::new(0));
    let mut router = Router::new();
    let id = router.register_consumer("q", counting(&handled));
    runtime.mount(&router).unwrap();

    let first = runtime.listener("q")[0].thread.clone();
    first.stop();
    first.join();
    assert!(broker.consumers("q").is_empty());

    runtime.mount(&router).unwrap();

    let listener = runtime.listener("q");
    assert_eq!(listener.len(), 1);
    assert!(!Arc::ptr_eq(&listener[0].thread, &first));
    assert!(listener[0].thread.is_running());
    assert_eq!(first.state(), ConsumerState::Stopped);
    assert_eq!(broker.consumers("q").len(), 1);
    assert!(runtime.is_bound(id));

    broker.deliver("q", order(1)).unwrap();
    assert!(wait_until(|| handled.load(Ordering::SeqCst) == 1));

    // the running consumer is not duplicated
    runtime.mount(&router).unwrap();
    assert_eq!(runtime.listener("q").len(), 1);

    runtime.shutdown().unwrap();
}

#[test]
fn handler_publishes_and_continues_the_trace() {
    global::set_text_map_propagator(TraceContextPropagator::new());

    let broker = MemoryBroker::new();
    broker.declare_queue("a");
    broker.declare_queue("b");
    let runtime = runtime(&broker, RuntimeConfig::default());

    let received = Arc::new(Mutex::new(vec![]));
    let sink = received.clone();
    let mut downstream = Router::new();
    downstream.register_consumer("b", move |order: Order| {
        sink.lock().unwrap().push(order);
        Ok(())
    });
    let forward = downstream.register_publisher("b", None, |order: Order| Ok(order));
    runtime.mount(&downstream).unwrap();

    let publisher = runtime.publisher(&forward).unwrap();
    let mut upstream = Router::new();
    upstream.register_consumer("a", move |order: Order| {
        publisher.publish(Order { id: order.id + 1 })?;
        Ok(())
    });
    runtime.mount(&upstream).unwrap();

    let mut headers = Headers::new();
    headers.insert(
        "traceparent".to_owned(),
        "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01".to_owned(),
    );
    broker.deliver_with_headers("a", &headers, order(1)).unwrap();

    assert!(wait_until(|| received.lock().unwrap().len() == 1));
    assert!(wait_until(|| broker.acknowledgements("a").len() == 1));
    assert_eq!(received.lock().unwrap()[0], Order { id: 2 });
    assert_eq!(
        broker.acknowledgements("a")[0].acknowledgement,
        Acknowledgement::Ack
    );

    let published = broker.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].routing_key, "b");
    let traceparent = published[0].headers.get("traceparent").unwrap();
    assert!(traceparent.starts_with("00-4bf92f3577b34da6a3ce929d0e0e4736-"));

    runtime.shutdown().unwrap();
}

#[test]
fn failed_messages_are_requeued_when_configured() {
    let broker = MemoryBroker::new();
    broker.declare_queue("q");
    let runtime = runtime(&broker, RuntimeConfig::default().requeue_on_failure(true));

    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();
    let mut router = Router::new();
    router.register_consumer("q", move |_: Order| {
        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err("transient".into());
        }
        Ok(())
    });
    runtime.mount(&router).unwrap();

    broker.deliver("q", order(1)).unwrap();

    assert!(wait_until(|| attempts.load(Ordering::SeqCst) == 2));
    assert!(wait_until(|| broker.acknowledgements("q").len() == 2));
    let acks: Vec<_> = broker
        .acknowledgements("q")
        .into_iter()
        .map(|r| r.acknowledgement)
        .collect();
    assert_eq!(
        acks,
        vec![Acknowledgement::Nack { requeue: true }, Acknowledgement::Ack]
    );

    runtime.shutdown().unwrap();
}

#[test]
fn published_messages_reach_consumers() {
    let broker = MemoryBroker::new();
    broker.declare_queue("orders.created");
    broker.bind_queue("orders.created", "orders-ex", "order.created");
    let runtime = runtime(&broker, RuntimeConfig::default());

    let received = Arc::new(Mutex::new(vec![]));
    let sink = received.clone();
    let mut router = Router::new().exchange("orders-ex");
    router.register_consumer("orders.created", move |order: Order| {
        sink.lock().unwrap().push(order);
        Ok(())
    });
    let notify = router.register_publisher("order.created", None, |id: u64| Ok(Order { id }));
    runtime.mount(&router).unwrap();

    runtime.publisher(&notify).unwrap().publish(11).unwrap();

    assert!(wait_until(|| received.lock().unwrap().len() == 1));
    assert_eq!(received.lock().unwrap()[0], Order { id: 11 });

    runtime.shutdown().unwrap();
}

#[test]
fn publisher_can_be_called_from_many_threads() {
    let broker = MemoryBroker::new();
    let runtime = runtime(&broker, RuntimeConfig::default().tracked(false));

    let mut router = Router::new();
    let handle = router.register_publisher("k", Some("ex"), |id: u64| Ok(id));
    runtime.mount(&router).unwrap();
    let publisher = runtime.publisher(&handle).unwrap();

    let workers: Vec<_> = (0..4)
        .map(|worker| {
            let publisher = publisher.clone();
            thread::spawn(move || {
                for n in 0..25 {
                    publisher.publish(worker * 100 + n).unwrap();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(broker.published().len(), 100);
}

#[derive(Clone, Default)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl io::Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[test]
fn runtime_logs_go_to_its_logger() {
    let buf = SharedBuf::default();
    let writer = buf.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || writer.clone())
        .with_ansi(false)
        .finish();

    let broker = MemoryBroker::new();
    broker.declare_queue("orders.created");
    let runtime = runtime(&broker, RuntimeConfig::default().tracked(true))
        .with_logger(tracing::Dispatch::new(subscriber));

    let mut router = Router::new();
    router.register_consumer("orders.created", |_: Order| Ok(()));
    runtime.mount(&router).unwrap();

    broker.deliver("orders.created", order(1)).unwrap();
    assert!(wait_until(|| broker.acknowledgements("orders.created").len() == 1));
    runtime.shutdown().unwrap();

    let logs = String::from_utf8(buf.0.lock().unwrap().clone()).unwrap();
    assert!(logs.contains("message successfully processed"));
    assert!(logs.contains("orders.created"));
}
