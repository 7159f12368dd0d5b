use tracing::trace;

// Counters are emitted as trace events; the exporter renders whatever the
// recorder has collected.

pub fn inc_requests(route: &'static str) {
    trace!(
        target = "dropship.metrics",
        route = route,
        "requests_total_inc"
    );
}

pub fn job_finished(job: &'static str, outcome: &'static str, elapsed_ms: u128) {
    trace!(
        target = "dropship.metrics",
        job = job,
        outcome = outcome,
        elapsed_ms = elapsed_ms as u64,
        "job_finished"
    );
}

pub fn order_outcome(outcome: &str) {
    trace!(
        target = "dropship.metrics",
        outcome = outcome,
        "order_outcome_inc"
    );
}

pub fn browser_contexts(open: usize) {
    trace!(
        target = "dropship.metrics",
        open = open as u64,
        "browser_contexts_gauge"
    );
}
