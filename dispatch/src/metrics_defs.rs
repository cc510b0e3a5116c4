//! Metrics definitions for the dispatch core.

use shared::metrics_defs::{MetricDef, MetricType};

pub const DISPATCH_DURATION: MetricDef = MetricDef {
    name: "dispatch.duration",
    metric_type: MetricType::Histogram,
    description: "Time to complete a dispatch in seconds. Tagged with result.",
};

pub const DISPATCH_INFLIGHT: MetricDef = MetricDef {
    name: "dispatch.inflight",
    metric_type: MetricType::Gauge,
    description: "Number of dispatches currently being processed",
};

pub const NODE_ATTEMPTS: MetricDef = MetricDef {
    name: "node.attempts",
    metric_type: MetricType::Counter,
    description: "Calls made to a node. Tagged with node and outcome.",
};

pub const CIRCUIT_OPEN_SKIPS: MetricDef = MetricDef {
    name: "node.circuit_open_skips",
    metric_type: MetricType::Counter,
    description: "Candidates skipped without a call because their circuit was open",
};

pub const BREAKER_TRANSITIONS: MetricDef = MetricDef {
    name: "circuit_breaker.transitions",
    metric_type: MetricType::Counter,
    description: "Circuit breaker state changes. Tagged with the new state.",
};

pub const KEY_RATE_LIMITED: MetricDef = MetricDef {
    name: "api_key.rate_limited",
    metric_type: MetricType::Counter,
    description: "Rate limit responses attributed to an api key",
};

pub const KEY_EXHAUSTED: MetricDef = MetricDef {
    name: "api_key.exhausted",
    metric_type: MetricType::Counter,
    description: "Key acquisitions that failed because every key was unavailable",
};

pub const ALL_METRICS: &[MetricDef] = &[
    DISPATCH_DURATION,
    DISPATCH_INFLIGHT,
    NODE_ATTEMPTS,
    CIRCUIT_OPEN_SKIPS,
    BREAKER_TRANSITIONS,
    KEY_RATE_LIMITED,
    KEY_EXHAUSTED,
];
