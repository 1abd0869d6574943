//! Resilience hot-path benchmarks
//!
//! Circuit admission, token bucket refill, permit churn, retry loop overhead,
//! backoff math and queue throughput.
//!
//! Run with: `cargo bench --bench resilience_bench -p taskgate-common
//! --features runtime`

use std::error::Error;
use std::fmt::{Display, Formatter};
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use taskgate_common::collections::{Priority, QueueConfig, TaskQueue};
use taskgate_common::resilience::{
    policies, CircuitBreaker, CircuitBreakerConfig, ConcurrencyLimiter, Jitter, MockClock,
    RetryConfig, RetryExecutor, TokenBucket, TokenBucketConfig,
};
use tokio::runtime::Builder as RuntimeBuilder;

// ============================================================================
// Circuit Breaker Benchmarks
// ============================================================================

fn bench_circuit_breaker_paths(c: &mut Criterion) {
    let mut group = c.benchmark_group("circuit_breaker_paths");

    group.bench_function("admit_and_succeed", |b| {
        let breaker = CircuitBreaker::with_defaults();
        b.iter(|| match breaker.try_acquire(black_box("svc")) {
            Ok(permit) => permit.succeed(),
            Err(err) => panic!("closed circuit rejected call: {err}"),
        });
    });

    group.bench_function("reject_while_open", |b| {
        let config = CircuitBreakerConfig::builder()
            .failure_threshold(1)
            .reset_timeout(Duration::from_secs(3600))
            .build()
            .expect("valid circuit breaker config for benchmarks");
        let breaker = CircuitBreaker::with_clock(config, MockClock::new());
        if let Ok(permit) = breaker.try_acquire("svc") {
            permit.fail();
        }
        b.iter(|| black_box(breaker.try_acquire("svc").is_err()));
    });

    group.bench_function("many_keys", |b| {
        let breaker = CircuitBreaker::with_defaults();
        let keys: Vec<String> = (0..64).map(|n| format!("key-{n}")).collect();
        b.iter(|| {
            for key in &keys {
                if let Ok(permit) = breaker.try_acquire(key) {
                    permit.succeed();
                }
            }
        });
    });

    group.finish();
}

// ============================================================================
// Limiter Benchmarks
// ============================================================================

fn bench_limiters(c: &mut Criterion) {
    let mut group = c.benchmark_group("limiters");

    group.bench_function("token_bucket_try_acquire", |b| {
        let config = TokenBucketConfig::builder()
            .capacity(1_000_000)
            .refill_amount(1_000_000)
            .refill_interval(Duration::from_millis(1))
            .build()
            .expect("valid bucket config for benchmarks");
        let bucket = TokenBucket::new(config).expect("valid bucket");
        b.iter(|| black_box(bucket.try_acquire(1)));
    });

    group.bench_function("concurrency_permit_churn", |b| {
        let limiter = ConcurrencyLimiter::new(8).expect("valid limiter");
        b.iter(|| drop(black_box(limiter.try_acquire())));
    });

    group.finish();
}

// ============================================================================
// Retry Benchmarks
// ============================================================================

fn build_runtime() -> tokio::runtime::Runtime {
    RuntimeBuilder::new_current_thread()
        .enable_all()
        .build()
        .expect("tokio runtime should build for benchmarks")
}

#[derive(Debug, Clone)]
struct BenchError(&'static str);

impl Display for BenchError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Error for BenchError {}

fn zero_backoff(max_attempts: u32) -> RetryConfig {
    RetryConfig::builder()
        .max_attempts(max_attempts)
        .exponential_backoff(Duration::ZERO, 1.0, Duration::ZERO)
        .no_jitter()
        .build()
        .expect("retry config should build for benchmarks")
}

fn bench_retry_executor_outcomes(c: &mut Criterion) {
    let mut group = c.benchmark_group("retry_executor_outcomes");
    let runtime = build_runtime();

    group.bench_function("immediate_success", |b| {
        let executor = RetryExecutor::new(zero_backoff(3), policies::AlwaysRetry);
        b.to_async(&runtime).iter(|| async {
            let result = executor.execute(|_| async { Ok::<_, BenchError>(()) }).await;
            if let Err(err) = result {
                panic!("retry immediate success failed: {err:?}");
            }
        });
    });

    group.bench_function("transient_failures_then_success", |b| {
        let executor = RetryExecutor::new(zero_backoff(5), policies::AlwaysRetry);
        b.to_async(&runtime).iter(|| async {
            let result = executor
                .execute(|attempt| async move {
                    if attempt <= 3 {
                        Err::<(), _>(BenchError("transient failure"))
                    } else {
                        Ok(())
                    }
                })
                .await;
            if let Err(err) = result {
                panic!("retry transient failure path exhausted: {err:?}");
            }
        });
    });

    group.bench_function("always_fail", |b| {
        let executor = RetryExecutor::new(zero_backoff(4), policies::AlwaysRetry);
        b.to_async(&runtime).iter(|| async {
            let result: Result<(), _> =
                executor.execute(|_| async { Err::<(), _>(BenchError("permanent failure")) }).await;
            let _result = black_box(result);
        });
    });

    group.finish();
}

fn bench_retry_backoff(c: &mut Criterion) {
    let mut group = c.benchmark_group("retry_backoff");
    let config = RetryConfig::builder()
        .exponential_backoff(Duration::from_millis(100), 2.0, Duration::from_secs(2))
        .build()
        .expect("retry config should build for benchmarks");

    group.bench_function("raw_delay", |b| {
        b.iter(|| {
            for attempt in 1..=10 {
                black_box(config.raw_delay(attempt));
            }
        });
    });

    let jitters = [("none", Jitter::None), ("full", Jitter::Full), ("equal", Jitter::Equal)];
    for (name, jitter) in jitters {
        group.bench_with_input(BenchmarkId::new("jitter", name), &jitter, |b, jitter| {
            b.iter(|| black_box(jitter.apply(Duration::from_millis(800))));
        });
    }

    group.finish();
}

// ============================================================================
// Queue Benchmarks
// ============================================================================

fn bench_task_queue(c: &mut Criterion) {
    let mut group = c.benchmark_group("task_queue");

    group.bench_function("enqueue_dequeue_mixed_priority", |b| {
        let queue: TaskQueue<u64, u64> =
            TaskQueue::new(QueueConfig::default()).expect("valid queue config");
        let mut next = 0u64;
        b.iter(|| {
            for n in 0..64u64 {
                next += 1;
                let priority = Priority::from((n % 5) as u8);
                if let Err(err) = queue.try_enqueue(next, priority, n) {
                    panic!("enqueue failed: {err}");
                }
            }
            while let Some(item) = queue.try_dequeue() {
                black_box(item);
            }
        });
    });

    group.finish();
}

criterion_group!(
    resilience,
    bench_circuit_breaker_paths,
    bench_limiters,
    bench_retry_executor_outcomes,
    bench_retry_backoff,
    bench_task_queue
);
criterion_main!(resilience);
