//! Dispatch throughput of the filter chain: receive-direction fan-through
//! across a chain of varying length, and a single round through an empty
//! chain (the baseline every filter's overhead is measured against).

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use weir::{Filter, FilterChain, Message, ReadController, Service, ServiceConfig, Session};

struct PassThroughFilter;

impl Filter for PassThroughFilter {
    fn message_received(&self, session: &Session, msg: Message, ctrl: &mut ReadController<'_>) {
        ctrl.call_read_next(session, msg);
    }
}

struct CountingHandler;
impl weir::Handler for CountingHandler {
    fn message_received(&self, _session: &Session, _message: Message) {}
}

fn session_with_chain_len(len: usize) -> (Arc<Service>, Session) {
    let filters = (0..len).map(|_| Arc::new(PassThroughFilter) as Arc<dyn Filter>).collect();
    let chain = FilterChain::new(filters);
    let service = Service::new(ServiceConfig::default(), Arc::new(CountingHandler), chain);
    let session = Session::standalone_for_test(&service);
    (service, session)
}

fn bench_receive_dispatch(c: &mut Criterion) {
    let mut group = c.benchmark_group("chain_fire_message_received");
    for len in [0usize, 1, 8, 32] {
        let (_service, session) = session_with_chain_len(len);
        group.bench_with_input(BenchmarkId::from_parameter(len), &len, |b, _| {
            b.iter(|| {
                session
                    .chain()
                    .fire_message_received(&session, Message::new(black_box(vec![0u8; 64])));
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_receive_dispatch);
criterion_main!(benches);
