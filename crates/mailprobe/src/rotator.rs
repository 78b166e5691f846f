use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

/// Caps the per-target counter map; when full it is trimmed back to
/// 80% by discarding the targets idle the longest.
const MAX_TRACKED_TARGETS: usize = 1000;

#[derive(Debug, Default)]
struct TargetCounters {
    helo: usize,
    from: usize,
    last_used: Option<Instant>,
}

/// Hands out HELO-domain and MAIL-FROM identities round-robin.
///
/// With a target domain the rotation is tracked per target so that
/// consecutive probes of the same site present different identities;
/// without one a global cursor is used. Start positions are randomized
/// per process.
pub struct IdentityRotator {
    helo_domains: Vec<String>,
    from_addresses: Vec<String>,
    helo_cursor: AtomicUsize,
    from_cursor: AtomicUsize,
    targets: Mutex<HashMap<String, TargetCounters>>,
    max_targets: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RotatorStats {
    pub helo_domains: usize,
    pub from_addresses: usize,
    pub tracked_targets: usize,
}

impl IdentityRotator {
    pub fn new(
        helo_domains: Vec<String>,
        from_addresses: Vec<String>,
    ) -> anyhow::Result<Self> {
        anyhow::ensure!(
            !helo_domains.is_empty(),
            "at least one HELO domain is required"
        );
        anyhow::ensure!(
            !from_addresses.is_empty(),
            "at least one MAIL FROM address is required"
        );

        let mut rng = rand::thread_rng();
        let helo_cursor = AtomicUsize::new(rng.gen_range(0..helo_domains.len()));
        let from_cursor = AtomicUsize::new(rng.gen_range(0..from_addresses.len()));

        Ok(Self {
            helo_domains,
            from_addresses,
            helo_cursor,
            from_cursor,
            targets: Mutex::new(HashMap::new()),
            max_targets: MAX_TRACKED_TARGETS,
        })
    }

    #[cfg(test)]
    fn with_max_targets(mut self, max: usize) -> Self {
        self.max_targets = max;
        self
    }

    pub fn next_helo(&self, target_domain: Option<&str>) -> String {
        match target_domain {
            Some(target) => {
                let index = self.bump_target(target, |counters| {
                    let index = counters.helo;
                    counters.helo += 1;
                    index
                });
                self.helo_domains[index % self.helo_domains.len()].clone()
            }
            None => {
                let index = self.helo_cursor.fetch_add(1, Ordering::Relaxed);
                self.helo_domains[index % self.helo_domains.len()].clone()
            }
        }
    }

    pub fn next_from(&self, target_domain: Option<&str>) -> String {
        match target_domain {
            Some(target) => {
                let index = self.bump_target(target, |counters| {
                    let index = counters.from;
                    counters.from += 1;
                    index
                });
                self.from_addresses[index % self.from_addresses.len()].clone()
            }
            None => {
                let index = self.from_cursor.fetch_add(1, Ordering::Relaxed);
                self.from_addresses[index % self.from_addresses.len()].clone()
            }
        }
    }

    /// A (HELO, MAIL FROM) pair. When possible the FROM address is
    /// advanced so that its domain differs from the HELO domain, which
    /// keeps the pair from looking self-referential to filters.
    pub fn credentials(&self, target_domain: Option<&str>) -> (String, String) {
        let helo = self.next_helo(target_domain);
        let mut from = self.next_from(target_domain);

        if self.from_addresses.len() >= 2 && domain_of(&from) == Some(helo.as_str()) {
            from = self.next_from(target_domain);
        }

        (helo, from)
    }

    pub fn stats(&self) -> RotatorStats {
        RotatorStats {
            helo_domains: self.helo_domains.len(),
            from_addresses: self.from_addresses.len(),
            tracked_targets: self.targets.lock().len(),
        }
    }

    fn bump_target<F: FnOnce(&mut TargetCounters) -> usize>(&self, target: &str, f: F) -> usize {
        let mut targets = self.targets.lock();

        if targets.len() >= self.max_targets && !targets.contains_key(target) {
            trim_targets(&mut targets, self.max_targets * 4 / 5);
        }

        let counters = targets.entry(target.to_string()).or_default();
        counters.last_used = Some(Instant::now());
        f(counters)
    }
}

fn trim_targets(targets: &mut HashMap<String, TargetCounters>, keep: usize) {
    if targets.len() <= keep {
        return;
    }
    let mut by_age: Vec<(String, Option<Instant>)> = targets
        .iter()
        .map(|(k, v)| (k.clone(), v.last_used))
        .collect();
    by_age.sort_by_key(|(_, last_used)| *last_used);

    let drop_count = targets.len() - keep;
    for (key, _) in by_age.into_iter().take(drop_count) {
        targets.remove(&key);
    }
    tracing::debug!("trimmed rotator target map to {} entries", targets.len());
}

fn domain_of(address: &str) -> Option<&str> {
    address.rsplit_once('@').map(|(_, domain)| domain)
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::HashSet;

    fn rotator() -> IdentityRotator {
        IdentityRotator::new(
            vec![
                "probe-a.example.net".to_string(),
                "probe-b.example.net".to_string(),
                "probe-c.example.net".to_string(),
            ],
            vec![
                "verify@probe-a.example.net".to_string(),
                "verify@probe-b.example.net".to_string(),
            ],
        )
        .unwrap()
    }

    #[test]
    fn empty_lists_are_rejected() {
        assert!(IdentityRotator::new(vec![], vec!["a@b.c".to_string()]).is_err());
        assert!(IdentityRotator::new(vec!["b.c".to_string()], vec![]).is_err());
    }

    #[test]
    fn global_rotation_covers_every_identity() {
        let rotator = rotator();
        let mut seen = HashSet::new();
        for _ in 0..3 {
            seen.insert(rotator.next_helo(None));
        }
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn per_target_rotation_is_independent() {
        let rotator = rotator();
        // Both targets start from index 0 regardless of the global cursor
        let a1 = rotator.next_helo(Some("alpha.example.com"));
        let b1 = rotator.next_helo(Some("beta.example.com"));
        assert_eq!(a1, b1);

        let a2 = rotator.next_helo(Some("alpha.example.com"));
        assert_ne!(a1, a2);
        assert_eq!(rotator.stats().tracked_targets, 2);
    }

    #[test]
    fn sequential_calls_wrap_around() {
        let rotator = rotator();
        let first = rotator.next_from(Some("gamma.example.com"));
        let second = rotator.next_from(Some("gamma.example.com"));
        let third = rotator.next_from(Some("gamma.example.com"));
        assert_ne!(first, second);
        assert_eq!(first, third);
    }

    #[test]
    fn credentials_avoid_matching_domains() {
        let rotator = rotator();
        for _ in 0..12 {
            let (helo, from) = rotator.credentials(Some("delta.example.com"));
            assert_ne!(domain_of(&from), Some(helo.as_str()));
        }
    }

    #[test]
    fn target_map_is_capped() {
        let rotator = IdentityRotator::new(
            vec!["probe.example.net".to_string()],
            vec!["verify@probe.example.net".to_string()],
        )
        .unwrap()
        .with_max_targets(10);

        for i in 0..50 {
            rotator.next_helo(Some(&format!("target-{i}.example.com")));
        }
        assert!(rotator.stats().tracked_targets <= 10);
    }
}
