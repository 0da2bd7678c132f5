#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crossbeam::channel::unbounded;

    use crate::config::CoreConfig;
    use crate::mem::tests::helpers::*;
    use crate::mem::{Mem, MemArena, SquashRequest};
    use crate::stmt::Value;

    fn mem_with_threshold(threshold: u8) -> (Mem, crossbeam::channel::Receiver<SquashRequest>) {
        let (tx, rx) = unbounded();
        let config = CoreConfig {
            upsert_squash_threshold: threshold,
            ..CoreConfig::default()
        };
        let mem = Mem::new(Arc::new(MemArena::unbounded()), key_def(), format(), 3)
            .with_config(&config)
            .with_squash_queue(tx);
        (mem, rx)
    }

    #[test]
    fn test_counter_increments_along_the_chain() {
        init_tracing();
        let (mem, _rx) = mem_with_threshold(16);
        let u1 = upsert(10, 1, 0, 1);
        let u2 = upsert(11, 1, 0, 1);
        let u3 = upsert(12, 1, 0, 1);
        mem.insert_upsert(u1.clone()).unwrap();
        mem.insert_upsert(u2.clone()).unwrap();
        mem.insert_upsert(u3.clone()).unwrap();
        assert_eq!(u1.n_upserts(), 0);
        assert_eq!(u2.n_upserts(), 1);
        assert_eq!(u3.n_upserts(), 2);
    }

    #[test]
    fn test_threshold_crossing_requests_exactly_one_squash() {
        init_tracing();
        let (mem, rx) = mem_with_threshold(2);
        for i in 0..6u64 {
            mem.insert_upsert(upsert(10 + i, 1, 0, 1)).unwrap();
        }
        // One request at the crossing, silence while saturated.
        let request = rx.try_recv().unwrap();
        assert_eq!(request.generation, 3);
        assert_eq!(request.key, vec![Value::Unsigned(1)]);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_counter_saturates_past_the_threshold() {
        init_tracing();
        let (mem, _rx) = mem_with_threshold(2);
        let mut last = None;
        for i in 0..8u64 {
            let stmt = upsert(10 + i, 1, 0, 1);
            mem.insert_upsert(stmt.clone()).unwrap();
            last = Some(stmt);
        }
        assert_eq!(last.unwrap().n_upserts(), 3);
    }

    #[test]
    fn test_distinct_keys_do_not_interact() {
        init_tracing();
        let (mem, rx) = mem_with_threshold(2);
        for key in 1..=4u64 {
            let stmt = upsert(10 + key, key, 0, 1);
            mem.insert_upsert(stmt.clone()).unwrap();
            assert_eq!(stmt.n_upserts(), 0);
        }
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_terminal_under_upsert_resets_the_chain() {
        init_tracing();
        let (mem, rx) = mem_with_threshold(2);
        mem.insert(replace(10, 1, 5)).unwrap();
        let u = upsert(11, 1, 0, 1);
        mem.insert_upsert(u.clone()).unwrap();
        // The older neighbour is terminal, so the chain starts fresh.
        assert_eq!(u.n_upserts(), 0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_requests_survive_a_missing_scheduler() {
        init_tracing();
        // No queue installed: crossing the threshold must not fail.
        let mem = Mem::new(Arc::new(MemArena::unbounded()), key_def(), format(), 1)
            .with_config(&CoreConfig {
                upsert_squash_threshold: 1,
                ..CoreConfig::default()
            });
        for i in 0..4u64 {
            mem.insert_upsert(upsert(10 + i, 1, 0, 1)).unwrap();
        }
        assert_eq!(mem.row_count(), 4);
    }
}
