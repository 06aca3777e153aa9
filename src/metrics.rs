use tracing::trace;

// Trace-based counters; the Prometheus recorder only serves what is emitted here.

pub fn inc_requests(route: &'static str) {
    trace!(
        target = "publisher.metrics",
        route = route,
        "requests_total_inc"
    );
}

pub fn stage_elapsed(stage: &'static str, elapsed_ms: u128) {
    trace!(
        target = "publisher.metrics",
        stage = stage,
        elapsed_ms = elapsed_ms as u64,
        "stage_elapsed"
    );
}

pub fn outcome(platform: &'static str, outcome: &'static str) {
    trace!(
        target = "publisher.metrics",
        platform = platform,
        outcome = outcome,
        "submission_outcomes_total_inc"
    );
}

pub fn failure(scope: &'static str, kind: &'static str) {
    trace!(
        target = "publisher.metrics",
        scope = scope,
        kind = kind,
        "failures_total_inc"
    );
}
