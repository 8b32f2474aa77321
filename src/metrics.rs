pub mod stage1 {
    /// Increment when a stage-1 routing request is accepted.
    pub fn request() {
        metrics::counter!("routingd_stage1_requests_total").increment(1);
    }

    /// Increment when a stage-1 request fails.
    pub fn failed(reason: &str) {
        metrics::counter!(
            "routingd_stage1_requests_failed_total",
            "reason" => reason.to_string()
        )
        .increment(1);
    }

    /// Record the wall time of a whole stage-1 computation.
    pub fn latency_seconds(duration_secs: f64) {
        metrics::histogram!("routingd_stage1_latency_seconds").record(duration_secs);
    }

    /// Increment when a symbolic late-route name resolves from the cache.
    pub fn lateroute_hit() {
        metrics::counter!("routingd_lateroute_cache_hits_total").increment(1);
    }

    /// Increment when a symbolic late-route name is no longer cached.
    pub fn lateroute_miss() {
        metrics::counter!("routingd_lateroute_cache_misses_total").increment(1);
    }
}
