use ibft_common::{OnlineProofRegistry, RetainWindow};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};

/// Periodically drop online proofs that fell out of the retention window
pub(crate) async fn run(
    registry: OnlineProofRegistry,
    strategy: RetainWindow,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = interval.tick() => {
                registry.prune_stale(&strategy, registry.current_sequence());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ibft_common::{Address, Hash, OnlineValidator};

    #[tokio::test]
    async fn test_interval_pruner_follows_current_sequence() {
        let registry = OnlineProofRegistry::new();
        for sequence in 1..=10 {
            registry.append(OnlineValidator::new(sequence, Address([1; 20]), Hash::zero(), vec![]));
        }
        registry.set_current_sequence(10);

        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(run(registry.clone(), RetainWindow::new(3), Duration::from_millis(10), rx));
        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(true).unwrap();
        task.await.unwrap();

        assert_eq!(registry.snapshot().keys().copied().collect::<Vec<_>>(), vec![7, 8, 9, 10]);
    }
}
