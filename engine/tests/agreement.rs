mod common;

use common::{make_block, TestSystem};
use ibft_common::Hash;
use ibft_engine::State;
use std::time::Duration;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_four_replicas_agree_on_two_sequences() -> anyhow::Result<()> {
    let system = TestSystem::new(4);
    system.start();

    let first = make_block(1, Hash::zero(), "first");
    system.submit(first.clone());
    tokio::time::sleep(Duration::from_secs(1)).await;

    let second = make_block(2, first.hash(), "second");
    system.submit(second.clone());
    tokio::time::sleep(Duration::from_secs(1)).await;

    for backend in &system.backends {
        let committed = backend.committed();
        assert_eq!(backend.committed_numbers(), vec![1, 2]);
        assert_eq!(committed[0].proposal.hash(), first.hash());
        assert_eq!(committed[1].proposal.hash(), second.hash());

        for record in &committed {
            assert_eq!(record.certificate.digest, record.proposal.hash());
            record.certificate.verify(backend.validator_set())?;
        }
    }

    for engine in &system.engines {
        assert_eq!(engine.current_view().sequence, 3);
        assert_eq!(engine.state(), State::AcceptRequest);
        assert_eq!(engine.last_committed().map(|c| c.proposal.number()), Some(2));
        assert_eq!(engine.metrics().commits, 2);
    }

    // round-robin: the first proposer's successor proposes the second sequence
    let proposals: Vec<u64> = system.engines.iter().map(|e| e.metrics().proposals).collect();
    assert_eq!(proposals, vec![1, 1, 0, 0]);

    system.stop().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_request_for_future_sequence_waits() {
    let system = TestSystem::new(4);
    system.start();

    let first = make_block(1, Hash::zero(), "first");
    let second = make_block(2, first.hash(), "second");
    // the second request arrives before the first sequence is decided
    system.submit(second.clone());
    system.submit(first.clone());

    let done = system
        .wait_for(Duration::from_secs(3), |s| s.backends.iter().all(|b| b.committed_numbers() == vec![1, 2]))
        .await;
    assert!(done, "replicas did not finalize both sequences");
    system.stop().await;
}
