use crate::selector::{
    spawn_evaluator, spawn_weight_reporter, ProbeTable, Selector, Upstream, UpstreamStatus,
    UpstreamType,
};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

static PROBE: ProbeTable = ProbeTable {
    network_error: -5,
    json_http_error: -3,
    ietf_http_error: -3,
    decode_error: -2,
    ok: 5,
};

/// The Linux Virtual Server flavour of weighted round-robin.
///
/// Upstreams are visited in cycle order against a descending threshold:
/// every wrap-around lowers the threshold by the gcd of all effective
/// weights, and once it reaches zero it resets to the maximum. An upstream
/// is eligible when its effective weight meets the threshold, so heavier
/// upstreams serve longer stretches of each cycle.
pub struct LVSWRRSelector {
    upstreams: Vec<Arc<Upstream>>,
    timeout: Duration,
    last_choose: AtomicI32,
    current_weight: AtomicI32,
}

impl LVSWRRSelector {
    pub fn new(timeout: Duration) -> LVSWRRSelector {
        LVSWRRSelector {
            upstreams: Vec::default(),
            timeout,
            last_choose: AtomicI32::new(-1),
            current_weight: AtomicI32::new(0),
        }
    }

    fn gcd_weight(&self) -> i32 {
        self.upstreams
            .iter()
            .fold(0, |acc, upstream| gcd(acc, upstream.effective_weight()))
    }

    fn max_weight(&self) -> i32 {
        self.upstreams
            .iter()
            .map(|upstream| upstream.effective_weight())
            .max()
            .unwrap_or(0)
    }
}

fn gcd(x: i32, y: i32) -> i32 {
    if x == 0 {
        return y;
    }
    if y == 0 {
        return x;
    }

    let (mut x, mut y) = (x, y);
    while y != 0 {
        let tmp = x % y;
        x = y;
        y = tmp;
    }
    x
}

impl Selector for LVSWRRSelector {
    fn add(&mut self, url: &str, r#type: UpstreamType, weight: i32) {
        self.upstreams.push(Arc::new(Upstream::new(url, r#type, weight)));
    }

    fn get(&self) -> Option<Arc<Upstream>> {
        let n = self.upstreams.len();
        if n == 0 {
            return None;
        }
        if n == 1 {
            return Some(self.upstreams[0].clone());
        }

        // Every cycle with weights intact finds an eligible upstream within
        // max-weight wrap-arounds. If concurrent weight churn starves the
        // scan anyway, fall back to plain cycle order instead of spinning.
        let max_scans = n * self.max_weight().max(1) as usize;

        for _ in 0..max_scans {
            let i = (self.last_choose.load(Ordering::Relaxed) + 1).rem_euclid(n as i32);
            self.last_choose.store(i, Ordering::Relaxed);

            if i == 0 {
                let gcd = self.gcd_weight();
                let current = self.current_weight.fetch_sub(gcd, Ordering::Relaxed) - gcd;
                if current <= 0 {
                    self.current_weight.fetch_add(self.max_weight(), Ordering::Relaxed);
                }
            }

            let upstream = &self.upstreams[i as usize];
            if upstream.effective_weight() >= self.current_weight.load(Ordering::Relaxed) {
                return Some(upstream.clone());
            }
        }

        log::warn!("weighted scan failed to settle, serving round-robin");
        let i = (self.last_choose.load(Ordering::Relaxed) + 1).rem_euclid(n as i32);
        Some(self.upstreams[i as usize].clone())
    }

    fn start_evaluate(&self) {
        spawn_evaluator(self.upstreams.clone(), self.timeout, &PROBE);
    }

    fn report_status(&self, upstream: &Upstream, status: UpstreamStatus) {
        match status {
            UpstreamStatus::Timeout => upstream.adjust_weight(-5),
            UpstreamStatus::Error => upstream.adjust_weight(-2),
            UpstreamStatus::Ok => upstream.adjust_weight(1),
        }
    }

    fn start_debug_report(&self) {
        spawn_weight_reporter(self.upstreams.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn pool(weights: &[i32]) -> LVSWRRSelector {
        let mut selector = LVSWRRSelector::new(Duration::from_secs(10));
        for (i, weight) in weights.iter().enumerate() {
            selector.add(
                &format!("https://u{}.example/dns-query", i + 1),
                UpstreamType::Google,
                *weight,
            );
        }
        selector
    }

    #[test]
    fn test_gcd() {
        assert_eq!(gcd(12, 8), 4);
        assert_eq!(gcd(7, 3), 1);
        assert_eq!(gcd(0, 5), 5);
        assert_eq!(gcd(5, 0), 5);
        assert_eq!(gcd(6, 6), 6);
    }

    #[test]
    fn test_weights_set_the_serving_rate() {
        // Weights {3, 1}: over any multiple of 4 picks, u1 serves 3/4.
        let selector = pool(&[3, 1]);

        let mut u1 = 0;
        let mut u2 = 0;
        for _ in 0..40 {
            match selector.get().unwrap().url.as_str() {
                "https://u1.example/dns-query" => u1 += 1,
                _ => u2 += 1,
            }
        }

        assert_eq!(u1, 30);
        assert_eq!(u2, 10);
    }

    #[test]
    fn test_equal_weights_alternate() {
        let selector = pool(&[2, 2]);

        let mut urls = Vec::new();
        for _ in 0..4 {
            urls.push(selector.get().unwrap().url.clone());
        }

        assert_eq!(
            urls,
            vec![
                "https://u1.example/dns-query",
                "https://u2.example/dns-query",
                "https://u1.example/dns-query",
                "https://u2.example/dns-query",
            ]
        );
    }

    #[test]
    fn test_single_upstream_short_circuits() {
        let selector = pool(&[7]);
        assert_eq!(selector.get().unwrap().url, "https://u1.example/dns-query");
    }

    #[test]
    fn test_status_reports_move_the_weight() {
        let selector = pool(&[10, 10]);
        let upstream = selector.get().unwrap();

        selector.report_status(&upstream, UpstreamStatus::Timeout);
        assert_eq!(upstream.effective_weight(), 5);

        selector.report_status(&upstream, UpstreamStatus::Error);
        assert_eq!(upstream.effective_weight(), 3);

        selector.report_status(&upstream, UpstreamStatus::Ok);
        assert_eq!(upstream.effective_weight(), 4);
    }
}
