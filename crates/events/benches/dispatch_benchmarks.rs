use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use std::sync::Arc;

use edas_core::{App, Envelope, Event, EventName, Message};
use edas_events::broker::{BrokerClient, ClientSettings, Delivery, InMemoryBroker};
use edas_events::{on_event, Dispatcher, RegistryBuilder};

fn policy_published() -> Event {
    Event::new(
        App::new("policy").unwrap(),
        EventName::new("PolicyPublished").unwrap(),
    )
}

fn envelope() -> Envelope {
    Envelope::build(Some(&policy_published()))
        .unwrap()
        .field("policy_id", "P-7")
        .field("owner", "compliance")
        .field("version", 3)
        .finish()
}

fn bench_envelope_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("envelope_codec");
    let body = envelope().to_json();

    group.bench_function("serialize", |b| {
        let envelope = envelope();
        b.iter(|| black_box(envelope.try_to_json().unwrap()));
    });

    group.bench_function("decode", |b| {
        b.iter(|| black_box(Message::decode(black_box(body.as_bytes())).unwrap()));
    });

    group.finish();
}

fn bench_dispatch_fanout(c: &mut Criterion) {
    let mut group = c.benchmark_group("dispatch_fanout");
    let body = envelope().to_json().into_bytes();

    for listeners in [1usize, 4, 16].iter() {
        let mut builder = RegistryBuilder::new();
        for i in 0..*listeners {
            builder
                .add_listener(
                    on_event("PolicyPublished", false).bind("bench.handlers", &format!("l{i}"), |_, message| {
                        black_box(message.get_str("policy_id"));
                        Ok(())
                    }),
                )
                .unwrap();
        }
        let dispatcher = Dispatcher::new(Arc::new(builder.freeze()));
        let delivery = Delivery {
            delivery_tag: 1,
            exchange: "policy".into(),
            routing_key: String::new(),
            redelivered: false,
            correlation_id: Some("req-bench".into()),
            body: body.clone(),
        };

        group.throughput(Throughput::Elements(*listeners as u64));
        group.bench_with_input(BenchmarkId::from_parameter(listeners), listeners, |b, _| {
            b.iter(|| dispatcher.dispatch(&delivery).join_all());
        });
    }

    group.finish();
}

fn bench_in_memory_publish(c: &mut Criterion) {
    let mut group = c.benchmark_group("in_memory_publish");
    group.throughput(Throughput::Elements(1));

    let broker = InMemoryBroker::new();
    let mut consumer = BrokerClient::new(Arc::new(broker.clone()), ClientSettings::default());
    consumer.connect().unwrap();
    consumer.declare_queue_and_bind("policy", "policy").unwrap();
    let mut publisher = BrokerClient::new(Arc::new(broker.clone()), ClientSettings::default());
    let body = envelope().to_json().into_bytes();

    group.bench_function("confirmed_publish", |b| {
        b.iter(|| publisher.publish(&body, "policy", "", Some("req-bench")).unwrap());
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_envelope_codec,
    bench_dispatch_fanout,
    bench_in_memory_publish
);
criterion_main!(benches);
