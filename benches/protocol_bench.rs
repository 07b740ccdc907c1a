use criterion::{black_box, criterion_group, criterion_main, Criterion};
use fetchpool::config::PoolConfig;
use fetchpool::protocol::{self, PoolMessage, WorkerMessage};
use fetchpool::{Pool, Task};
use serde_json::json;
use tokio::runtime::Runtime;

fn progress_frames(count: usize) -> Vec<WorkerMessage> {
    (0..count)
        .map(|i| WorkerMessage::Progress {
            id: format!("task-{}", i % 16),
            value: json!({
                "percent": (i % 100) as f64,
                "total": "12.40MiB",
                "speed": "3.10MiB/s",
                "eta": "00:04",
            }),
        })
        .collect()
}

fn bench_encode_progress(c: &mut Criterion) {
    let messages = progress_frames(1000);

    c.bench_function("encode_1000_progress_frames", |b| {
        b.iter(|| {
            for message in &messages {
                black_box(protocol::encode(message).unwrap());
            }
        });
    });
}

fn bench_decode_tasks(c: &mut Criterion) {
    let frames: Vec<_> = (0..1000)
        .map(|i| {
            protocol::encode(&PoolMessage::Task {
                id: format!("task-{i}"),
                payload: json!({ "url": format!("https://example.com/watch?v={i}") }),
            })
            .unwrap()
        })
        .collect();

    c.bench_function("decode_1000_task_frames", |b| {
        b.iter(|| {
            for frame in &frames {
                black_box(protocol::decode::<PoolMessage>(frame).unwrap());
            }
        });
    });
}

fn bench_pool_round_trip(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let pool = rt.block_on(async {
        Pool::spawn(
            PoolConfig::default()
                .with_size(4)
                .with_command(env!("CARGO_BIN_EXE_fetchpool"), ["worker", "--handler", "probe"]),
        )
        .unwrap()
    });
    let mut next_id = 0u64;

    c.bench_function("pool_100_noop_tasks", |b| {
        b.iter(|| {
            let handles: Vec<_> = (0..100)
                .map(|_| {
                    next_id += 1;
                    pool.submit(Task::new(next_id.to_string(), json!({}))).unwrap()
                })
                .collect();
            black_box(rt.block_on(futures::future::join_all(handles)));
        });
    });

    rt.block_on(pool.terminate());
}

criterion_group!(
    benches,
    bench_encode_progress,
    bench_decode_tasks,
    bench_pool_round_trip
);
criterion_main!(benches);
