//! End-to-end client-server benchmarks.

use async_trait::async_trait;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use icebridge_client::{Client, ConnectionConfig, ServiceProxy};
use icebridge_core::{DispatchError, DispatchResult, IncomingRequest};
use icebridge_protocol::{Encapsulation, Identity, OperationMode};
use icebridge_server::{Router, Servant, Server, ServerConfig};
use std::sync::Arc;
use tokio::runtime::Runtime;

struct Echo;

#[async_trait]
impl Servant for Echo {
    fn type_ids(&self) -> &[&'static str] {
        &["::Bench::Echo"]
    }

    async fn dispatch(&self, request: IncomingRequest) -> DispatchResult {
        match request.operation() {
            "echo" => Ok(request.request.params.clone()),
            _ => Err(DispatchError::OperationNotFound),
        }
    }
}

fn setup_server_and_proxy(rt: &Runtime) -> ServiceProxy {
    rt.block_on(async {
        let router = Arc::new(Router::default());
        router.add(Identity::new("echo"), Arc::new(Echo));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Arc::new(Server::new(ServerConfig::new(addr), router));
        tokio::spawn(async move {
            let _ = server.run_on(listener).await;
        });

        let client = Arc::new(Client::new(ConnectionConfig::new(addr)));
        client.connect().await.unwrap();
        ServiceProxy::new(client, Identity::new("echo"))
    })
}

fn bench_ping_latency(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let proxy = setup_server_and_proxy(&rt);

    let mut group = c.benchmark_group("e2e_ping");
    group.throughput(Throughput::Elements(1));

    group.bench_function("ice_ping", |b| {
        b.to_async(&rt)
            .iter(|| async { black_box(proxy.ice_ping().await.unwrap()) });
    });

    group.finish();
}

fn bench_echo(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let proxy = setup_server_and_proxy(&rt);

    let mut group = c.benchmark_group("e2e_echo");

    for size in [100, 1000, 10000] {
        let params = Encapsulation::build(|encoder| {
            encoder.encode_string(&"x".repeat(size));
            Ok(())
        })
        .unwrap();

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &params, |b, params| {
            b.to_async(&rt).iter(|| async {
                black_box(
                    proxy
                        .invoke("echo", OperationMode::Normal, params.clone(), &[])
                        .await
                        .unwrap(),
                )
            });
        });
    }

    group.finish();
}

fn bench_concurrent_requests(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let proxy = setup_server_and_proxy(&rt);

    let mut group = c.benchmark_group("e2e_concurrent");

    for concurrency in [1, 8, 64] {
        group.throughput(Throughput::Elements(concurrency as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(concurrency),
            &concurrency,
            |b, &concurrency| {
                b.to_async(&rt).iter(|| async {
                    let mut tasks = tokio::task::JoinSet::new();
                    for _ in 0..concurrency {
                        let proxy = proxy.clone();
                        tasks.spawn(async move { proxy.ice_ping().await.unwrap() });
                    }
                    while tasks.join_next().await.is_some() {}
                });
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_ping_latency,
    bench_echo,
    bench_concurrent_requests,
);

criterion_main!(benches);
