//! Gauges and counters reported through the `metrics` facade.

use metrics::{counter, gauge};

pub const INSTANCES: &str = "lodestone_instances";
pub const SERVICES: &str = "lodestone_services";
pub const HEARTBEAT_REJECTED: &str = "lodestone_heartbeat_rejected_total";
pub const EVICTIONS: &str = "lodestone_evictions_total";
pub const NOTIFY_DROPPED: &str = "lodestone_notify_dropped_total";
pub const SYNC_DROPPED: &str = "lodestone_sync_dropped_total";
pub const DISPATCH_BACKLOG: &str = "lodestone_dispatch_backlog";

pub fn report_instances(domain: &str, delta: f64) {
    gauge!(INSTANCES, "domain" => domain.to_string()).increment(delta);
}

pub fn report_services(domain: &str, framework: &str, framework_version: &str, delta: f64) {
    gauge!(
        SERVICES,
        "domain" => domain.to_string(),
        "framework" => framework.to_string(),
        "framework_version" => framework_version.to_string()
    )
    .increment(delta);
}

pub fn heartbeat_rejected() {
    counter!(HEARTBEAT_REJECTED).increment(1);
}

pub fn instance_evicted() {
    counter!(EVICTIONS).increment(1);
}

pub fn notify_dropped() {
    counter!(NOTIFY_DROPPED).increment(1);
}

pub fn sync_dropped() {
    counter!(SYNC_DROPPED).increment(1);
}

pub fn dispatch_queued(kind: &str) {
    gauge!(DISPATCH_BACKLOG, "kind" => kind.to_string()).increment(1.0);
}

pub fn dispatch_handled(kind: &str) {
    gauge!(DISPATCH_BACKLOG, "kind" => kind.to_string()).decrement(1.0);
}
