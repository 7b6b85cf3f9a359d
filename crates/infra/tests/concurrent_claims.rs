//! Many workers racing on one queue must never share a job.

use std::collections::HashSet;
use std::sync::{Arc, Barrier};
use std::thread;

use pressflow_core::WorkerId;
use pressflow_infra::jobs::{InMemoryJobRepository, JobQueue, JobStatus};

const CLAIMANTS: usize = 12;
const JOBS: usize = 500;

#[test]
fn concurrent_claimants_receive_disjoint_jobs() {
    let queue = Arc::new(JobQueue::new(InMemoryJobRepository::arc()));
    for n in 0..JOBS {
        queue
            .enqueue("press.index", serde_json::json!({ "n": n }), 3)
            .unwrap();
    }

    let barrier = Arc::new(Barrier::new(CLAIMANTS));
    let handles: Vec<_> = (0..CLAIMANTS)
        .map(|i| {
            let queue = queue.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                let worker = WorkerId::for_unit("claimant", i);
                let mut claimed = Vec::new();
                barrier.wait();
                while let Some(job) = queue.claim(&worker).unwrap() {
                    assert_eq!(job.claimed_by.as_ref(), Some(&worker));
                    claimed.push(job.id);
                }
                claimed
            })
        })
        .collect();

    let mut seen = HashSet::new();
    let mut total = 0;
    for handle in handles {
        for id in handle.join().unwrap() {
            total += 1;
            assert!(seen.insert(id), "job {id} was claimed twice");
        }
    }

    assert_eq!(total, JOBS);
    let stats = queue.stats().unwrap();
    assert_eq!(stats.claimed, JOBS);
    assert_eq!(stats.pending, 0);
}

#[test]
fn concurrent_acks_only_succeed_for_the_claimant() {
    let queue = Arc::new(JobQueue::new(InMemoryJobRepository::arc()));
    let owner = WorkerId::new("owner").unwrap();
    let job = queue.enqueue("press.index", serde_json::json!({}), 1).unwrap();
    queue.claim(&owner).unwrap().unwrap();

    let barrier = Arc::new(Barrier::new(CLAIMANTS));
    let handles: Vec<_> = (0..CLAIMANTS)
        .map(|i| {
            let queue = queue.clone();
            let barrier = barrier.clone();
            let owner = owner.clone();
            thread::spawn(move || {
                // Worker 0 is the real claimant, the rest impersonate strangers.
                let worker = if i == 0 {
                    owner
                } else {
                    WorkerId::for_unit("stranger", i)
                };
                barrier.wait();
                queue.ack(job.id, &worker).is_ok()
            })
        })
        .collect();

    let successes = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|ok| *ok)
        .count();

    assert_eq!(successes, 1);
    assert_eq!(queue.get(job.id).unwrap().status, JobStatus::Succeeded);
}
