use crate::selector::{Selector, Upstream, UpstreamStatus, UpstreamType};
use rand::Rng;
use std::sync::Arc;

/// Picks an upstream uniformly at random. Weights and status reports are
/// ignored, and nothing is probed; the strategy for operators who trust
/// every endpoint equally.
pub struct RandomSelector {
    upstreams: Vec<Arc<Upstream>>,
}

impl RandomSelector {
    pub fn new() -> RandomSelector {
        RandomSelector {
            upstreams: Vec::default(),
        }
    }
}

impl Default for RandomSelector {
    fn default() -> Self {
        Self::new()
    }
}

impl Selector for RandomSelector {
    fn add(&mut self, url: &str, r#type: UpstreamType, weight: i32) {
        self.upstreams.push(Arc::new(Upstream::new(url, r#type, weight)));
    }

    fn get(&self) -> Option<Arc<Upstream>> {
        if self.upstreams.is_empty() {
            return None;
        }

        let i = rand::thread_rng().gen_range(0..self.upstreams.len());
        Some(self.upstreams[i].clone())
    }

    fn start_evaluate(&self) {}

    fn report_status(&self, _upstream: &Upstream, _status: UpstreamStatus) {}

    fn start_debug_report(&self) {
        crate::selector::spawn_weight_reporter(self.upstreams.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_covers_the_whole_pool() {
        let mut selector = RandomSelector::new();
        selector.add("https://one.example/dns-query", UpstreamType::Google, 1);
        selector.add("https://two.example/dns-query", UpstreamType::Ietf, 1);

        let mut seen = [false; 2];
        for _ in 0..200 {
            let upstream = selector.get().unwrap();
            match upstream.url.as_str() {
                "https://one.example/dns-query" => seen[0] = true,
                "https://two.example/dns-query" => seen[1] = true,
                other => panic!("unexpected upstream {}", other),
            }
        }

        // With 200 draws the odds of missing one endpoint are ~2^-199.
        assert!(seen[0] && seen[1]);
    }

    #[test]
    fn test_empty_pool() {
        let selector = RandomSelector::new();
        assert!(selector.get().is_none());
    }
}
