use crate::RUNNING;

use core::sync::atomic::Ordering;
use metriken::{metric, Counter, Gauge, LazyCounter, LazyGauge};
use ringlog::info;
use std::time::Duration;
use tokio::time::sleep;

/*
 * Registry
 */

#[metric(name = "registry/spawn/total")]
pub static SPAWN: LazyCounter = LazyCounter::new(Counter::default);

#[metric(name = "registry/spawn/ok")]
pub static SPAWN_OK: LazyCounter = LazyCounter::new(Counter::default);

#[metric(name = "registry/spawn/exception")]
pub static SPAWN_EX: LazyCounter = LazyCounter::new(Counter::default);

#[metric(name = "registry/workers/current")]
pub static WORKERS_CURR: LazyGauge = LazyGauge::new(Gauge::default);

/*
 * Workers
 */

#[metric(name = "worker/request/total")]
pub static REQUEST: LazyCounter = LazyCounter::new(Counter::default);

#[metric(name = "worker/request/get")]
pub static REQUEST_GET: LazyCounter = LazyCounter::new(Counter::default);

#[metric(name = "worker/request/put")]
pub static REQUEST_PUT: LazyCounter = LazyCounter::new(Counter::default);

#[metric(name = "worker/request/delete")]
pub static REQUEST_DELETE: LazyCounter = LazyCounter::new(Counter::default);

#[metric(name = "worker/request/create_update")]
pub static REQUEST_CREATE_UPDATE: LazyCounter = LazyCounter::new(Counter::default);

#[metric(name = "worker/request/update")]
pub static REQUEST_UPDATE: LazyCounter = LazyCounter::new(Counter::default);

#[metric(name = "worker/request/decode_error")]
pub static REQUEST_DECODE_EX: LazyCounter = LazyCounter::new(Counter::default);

#[metric(name = "worker/response/ok")]
pub static RESPONSE_OK: LazyCounter = LazyCounter::new(Counter::default);

#[metric(name = "worker/response/notfound")]
pub static RESPONSE_NOTFOUND: LazyCounter = LazyCounter::new(Counter::default);

#[metric(name = "worker/response/exception")]
pub static RESPONSE_EX: LazyCounter = LazyCounter::new(Counter::default);

/*
 * Transport
 */

#[metric(name = "node/undeliverable")]
pub static UNDELIVERABLE: LazyCounter = LazyCounter::new(Counter::default);

#[metric(name = "gateway/connect/total")]
pub static GATEWAY_CONNECT: LazyCounter = LazyCounter::new(Counter::default);

#[metric(name = "gateway/connections/current")]
pub static GATEWAY_CONNECT_CURR: LazyGauge = LazyGauge::new(Gauge::default);

#[metric(name = "gateway/frames/received")]
pub static FRAMES_RX: LazyCounter = LazyCounter::new(Counter::default);

#[metric(name = "gateway/frames/sent")]
pub static FRAMES_TX: LazyCounter = LazyCounter::new(Counter::default);

pub async fn log(interval: Duration) {
    let mut requests = REQUEST.value();
    while RUNNING.load(Ordering::Relaxed) {
        sleep(interval).await;

        let total = REQUEST.value();
        let rate = total.saturating_sub(requests) as f64 / interval.as_secs_f64();
        requests = total;

        info!(
            "workers: {} connections: {} requests: {} ({:.2}/s) ok: {} notfound: {} errors: {} spawn errors: {}",
            WORKERS_CURR.value(),
            GATEWAY_CONNECT_CURR.value(),
            total,
            rate,
            RESPONSE_OK.value(),
            RESPONSE_NOTFOUND.value(),
            RESPONSE_EX.value(),
            SPAWN_EX.value(),
        );
    }
}
