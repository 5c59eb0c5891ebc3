use proptest::prelude::*;
use weavemesh::reputation::{OutcomeRecord, ReputationStore, TrustTier};
use weavemesh::types::TaskStatus;

#[test]
fn sidecar_reload_restores_counters() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("reputation.jsonl");
    {
        let store = ReputationStore::with_sidecar(&path).unwrap();
        store.record_outcome("p", &OutcomeRecord::completed(100)).unwrap();
        store.record_outcome("p", &OutcomeRecord::failed(200)).unwrap();
        store.record_outcome("q", &OutcomeRecord::completed(50)).unwrap();
    }

    let store = ReputationStore::with_sidecar(&path).unwrap();
    let p = store.snapshot("p").unwrap();
    assert_eq!(p.tasks_completed, 1);
    assert_eq!(p.tasks_failed, 1);
    assert_eq!(p.consecutive_failures, 1);
    assert!(store.snapshot("q").is_some());

    // Counters keep accumulating after the reload.
    store.record_outcome("p", &OutcomeRecord::completed(100)).unwrap();
    assert_eq!(store.snapshot("p").unwrap().tasks_completed, 2);
}

fn zero_latency(status: TaskStatus) -> OutcomeRecord {
    OutcomeRecord {
        status,
        duration_ms: 0,
        tokens_used: 0,
        cost_usd: 0.0,
        latency_ms: Some(0),
    }
}

proptest! {
    // After k completions then j failures (no aborts), trust never drops
    // below the success-rate floor minus the capped streak penalty.
    #[test]
    fn trust_lower_bound_holds(k in 0u32..40, j in 0u32..40) {
        prop_assume!(k + j > 0);
        let store = ReputationStore::in_memory();
        for _ in 0..k {
            store.record_outcome("p", &zero_latency(TaskStatus::Completed)).unwrap();
        }
        for _ in 0..j {
            store.record_outcome("p", &zero_latency(TaskStatus::Failed)).unwrap();
        }

        let floor = 0.6 * f64::from(k) / f64::from(k + j) - 0.05 * f64::from(j.min(8));
        prop_assert!(store.trust_score("p") >= floor - 1e-9);
    }

    // Tier assignment is monotone non-decreasing in trust.
    #[test]
    fn tier_is_monotonic(a in 0.0f64..1.0, b in 0.0f64..1.0) {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        prop_assert!(TrustTier::from_trust(lo) <= TrustTier::from_trust(hi));
    }
}
