#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use super::super::{Dispatcher, KeyHandler, WorkQueue};

    fn queue() -> WorkQueue {
        WorkQueue::new(Duration::from_millis(5), Duration::from_millis(40))
    }

    #[tokio::test]
    async fn waiting_key_is_coalesced() {
        let q = queue();
        q.add("ns/a");
        q.add("ns/a");
        q.add("ns/b");
        assert_eq!(q.len(), 2);
        assert_eq!(q.get().await.as_deref(), Some("ns/a"));
        assert_eq!(q.get().await.as_deref(), Some("ns/b"));
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn key_added_while_held_runs_again_after_done() {
        let q = queue();
        q.add("ns/a");
        let key = q.get().await.unwrap();
        q.add("ns/a");
        q.add("ns/a");
        // Held by us, so nobody else can get it yet
        let other =
            tokio::time::timeout(Duration::from_millis(20), q.get()).await;
        assert!(other.is_err());
        q.done(&key);
        assert_eq!(q.get().await.as_deref(), Some("ns/a"));
        q.done("ns/a");
        assert!(q.is_empty());
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let q = queue();
        let delays: Vec<_> = (1..=5).map(|n| q.backoff(n)).collect();
        assert_eq!(
            delays,
            vec![5, 10, 20, 40, 40]
                .into_iter()
                .map(Duration::from_millis)
                .collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    async fn rate_limited_add_counts_and_forget_resets() {
        let q = queue();
        q.add_rate_limited("ns/a");
        q.add_rate_limited("ns/a");
        assert_eq!(q.num_requeues("ns/a"), 2);
        let key = tokio::time::timeout(Duration::from_secs(1), q.get())
            .await
            .unwrap();
        assert_eq!(key.as_deref(), Some("ns/a"));
        q.forget("ns/a");
        assert_eq!(q.num_requeues("ns/a"), 0);
    }

    #[tokio::test]
    async fn shutdown_releases_waiting_workers() {
        let q = queue();
        let waiter = tokio::spawn({
            let q = q.clone();
            async move { q.get().await }
        });
        q.shutdown();
        assert_eq!(waiter.await.unwrap(), None);
        q.add("ns/a");
        assert!(q.is_empty());
    }

    /// Records overlapping runs per key.
    #[derive(Default)]
    struct Tally {
        in_flight: Mutex<HashMap<String, usize>>,
        max_overlap: AtomicUsize,
        runs: AtomicUsize,
        fail_times: usize,
        panic_times: usize,
        exhausted: Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl KeyHandler for Tally {
        type Error = String;

        async fn handle(&self, key: &str) -> Result<(), String> {
            let n = {
                let mut m = self.in_flight.lock().unwrap();
                let n = m.entry(key.to_string()).or_insert(0);
                *n += 1;
                *n
            };
            self.max_overlap.fetch_max(n, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(30)).await;
            *self.in_flight.lock().unwrap().get_mut(key).unwrap() -= 1;
            let run = self.runs.fetch_add(1, Ordering::SeqCst);
            if run < self.panic_times {
                panic!("handler blew up on run {run}");
            }
            if run < self.fail_times {
                return Err(format!("attempt {run} failed"));
            }
            Ok(())
        }

        async fn on_exhausted(&self, key: &str, _err: &String) {
            self.exhausted.lock().unwrap().push(key.to_string());
        }
    }

    #[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn one_worker_per_key_with_coalesced_reruns() {
        let q = queue();
        let tally = Arc::new(Tally::default());
        let dispatcher = Dispatcher::new(q.clone(), tally.clone(), 4, 3);
        let run = tokio::spawn(dispatcher.run());

        q.add("ns/pg1");
        tokio::time::sleep(Duration::from_millis(10)).await;
        for _ in 0..10 {
            q.add("ns/pg1");
        }
        tokio::time::sleep(Duration::from_millis(150)).await;
        q.shutdown();
        run.await.unwrap();

        assert_eq!(tally.max_overlap.load(Ordering::SeqCst), 1);
        assert_eq!(tally.runs.load(Ordering::SeqCst), 2);
    }

    #[test_log::test(tokio::test)]
    async fn failures_are_retried_then_dropped() {
        let q = queue();
        let tally = Arc::new(Tally {
            fail_times: usize::MAX,
            ..Default::default()
        });
        let run =
            tokio::spawn(Dispatcher::new(q.clone(), tally.clone(), 1, 2).run());

        q.add("ns/pg1");
        tokio::time::sleep(Duration::from_millis(300)).await;
        q.shutdown();
        run.await.unwrap();

        // first attempt plus two requeues
        assert_eq!(tally.runs.load(Ordering::SeqCst), 3);
        assert_eq!(
            *tally.exhausted.lock().unwrap(),
            vec!["ns/pg1".to_string()]
        );
        assert_eq!(q.num_requeues("ns/pg1"), 0);
    }

    #[test_log::test(tokio::test)]
    async fn success_after_failure_clears_ledger() {
        let q = queue();
        let tally = Arc::new(Tally {
            fail_times: 1,
            ..Default::default()
        });
        let run =
            tokio::spawn(Dispatcher::new(q.clone(), tally.clone(), 1, 5).run());

        q.add("ns/pg1");
        tokio::time::sleep(Duration::from_millis(200)).await;
        q.shutdown();
        run.await.unwrap();

        assert_eq!(tally.runs.load(Ordering::SeqCst), 2);
        assert_eq!(q.num_requeues("ns/pg1"), 0);
        assert!(tally.exhausted.lock().unwrap().is_empty());
    }

    #[test_log::test(tokio::test)]
    async fn panicking_handler_is_retried_and_keeps_its_worker() {
        let q = queue();
        let tally = Arc::new(Tally {
            panic_times: 1,
            ..Default::default()
        });
        let run =
            tokio::spawn(Dispatcher::new(q.clone(), tally.clone(), 1, 3).run());

        q.add("ns/pg1");
        tokio::time::sleep(Duration::from_millis(150)).await;
        // retried after the panic and succeeded
        assert_eq!(tally.runs.load(Ordering::SeqCst), 2);
        assert_eq!(q.num_requeues("ns/pg1"), 0);

        q.add("ns/pg1");
        tokio::time::sleep(Duration::from_millis(100)).await;
        q.shutdown();
        run.await.unwrap();

        assert_eq!(tally.runs.load(Ordering::SeqCst), 3);
        assert!(tally.exhausted.lock().unwrap().is_empty());
    }

    #[test_log::test(tokio::test)]
    async fn panic_past_the_budget_releases_the_key() {
        let q = queue();
        let tally = Arc::new(Tally {
            panic_times: 1,
            ..Default::default()
        });
        let run =
            tokio::spawn(Dispatcher::new(q.clone(), tally.clone(), 1, 0).run());

        q.add("ns/pg1");
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(tally.runs.load(Ordering::SeqCst), 1);

        q.add("ns/pg1");
        tokio::time::sleep(Duration::from_millis(80)).await;
        q.shutdown();
        run.await.unwrap();

        assert_eq!(tally.runs.load(Ordering::SeqCst), 2);
        assert_eq!(q.num_requeues("ns/pg1"), 0);
    }
}
