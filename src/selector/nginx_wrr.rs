use crate::selector::{
    spawn_evaluator, spawn_weight_reporter, ProbeTable, Selector, Upstream, UpstreamStatus,
    UpstreamType,
};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

static PROBE: ProbeTable = ProbeTable {
    network_error: -10,
    json_http_error: -3,
    ietf_http_error: -5,
    decode_error: -2,
    ok: 5,
};

/// Smooth weighted round-robin.
///
/// Each pick adds every upstream's effective weight to its current weight,
/// chooses the largest current weight, then subtracts the pool total from
/// the winner. Over a full cycle each upstream is chosen exactly its weight
/// times, and the choices interleave instead of bursting.
pub struct NginxWRRSelector {
    upstreams: Vec<Arc<Upstream>>,
    timeout: Duration,
}

impl NginxWRRSelector {
    pub fn new(timeout: Duration) -> NginxWRRSelector {
        NginxWRRSelector {
            upstreams: Vec::default(),
            timeout,
        }
    }
}

impl Selector for NginxWRRSelector {
    fn add(&mut self, url: &str, r#type: UpstreamType, weight: i32) {
        self.upstreams.push(Arc::new(Upstream::new(url, r#type, weight)));
    }

    fn get(&self) -> Option<Arc<Upstream>> {
        let mut total = 0;
        let mut best: Option<usize> = None;

        for (i, upstream) in self.upstreams.iter().enumerate() {
            let effective = upstream.effective_weight();
            let current = upstream.current_weight().fetch_add(effective, Ordering::Relaxed)
                + effective;
            total += effective;

            // Strict comparison keeps ties on the first upstream.
            match best {
                None => best = Some(i),
                Some(b) => {
                    if current > self.upstreams[b].current_weight().load(Ordering::Relaxed) {
                        best = Some(i)
                    }
                }
            }
        }

        let best = &self.upstreams[best?];
        best.current_weight().fetch_sub(total, Ordering::Relaxed);

        Some(best.clone())
    }

    fn start_evaluate(&self) {
        spawn_evaluator(self.upstreams.clone(), self.timeout, &PROBE);
    }

    fn report_status(&self, upstream: &Upstream, status: UpstreamStatus) {
        match status {
            UpstreamStatus::Timeout => upstream.adjust_weight(-5),
            UpstreamStatus::Error => upstream.adjust_weight(-3),
            UpstreamStatus::Ok => upstream.adjust_weight(1),
        }
    }

    fn start_debug_report(&self) {
        spawn_weight_reporter(self.upstreams.clone());
    }
}
