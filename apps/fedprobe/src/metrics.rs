use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub static PROBES: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("fedprobe_probe_total", "probes dispatched by kind and outcome"),
        &["kind", "outcome"],
    )
    .expect("probe counter opts");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static DELEGATIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "fedprobe_delegation_total",
            "server name resolutions by the step that produced the endpoint",
        ),
        &["via"],
    )
    .expect("delegation counter opts");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static BACKWALK_PAGES: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "fedprobe_backwalk_pages_total",
            "room history pages fetched by direction",
        ),
        &["direction"],
    )
    .expect("backwalk page counter opts");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static BACKWALK_RETRIES: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "fedprobe_backwalk_retries_total",
            "room history page fetches retried by direction",
        ),
        &["direction"],
    )
    .expect("backwalk retry counter opts");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub fn gather() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buf = Vec::new();
    encoder.encode(&metric_families, &mut buf).ok();
    buf
}
