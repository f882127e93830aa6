#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use shardq_core::app::{Engine, EngineBuilder, PartitionScope};
use shardq_core::config::EngineConfig;
use shardq_core::ports::FixedClock;

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 17, 12, 0, 0).unwrap()
}

/// Default config without retry jitter, so backoff is predictable.
pub fn config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.retry.jitter_ratio = 0.0;
    config
}

/// Builds with a fixed clock at `t0()` and creates the initial partitions.
pub async fn start(builder: EngineBuilder) -> (Engine, FixedClock) {
    let clock = FixedClock::new(t0());
    let engine = builder.with_clock(Arc::new(clock.clone())).build().unwrap();
    engine.initialize().await.unwrap();
    (engine, clock)
}

/// Runs dispatch rounds, moving the clock a minute forward after each, until
/// nothing is pending or running. Returns the number of rounds.
pub async fn drain(engine: &Engine, clock: &FixedClock, max_rounds: usize) -> usize {
    let dispatcher = engine.dispatcher();
    for round in 1..=max_rounds {
        dispatcher.run_once(&PartitionScope::All).await.unwrap();
        clock.advance(Duration::minutes(1));
        if engine.status().totals().await.unwrap().is_drained() {
            return round;
        }
    }
    panic!("queue not drained after {max_rounds} rounds");
}
