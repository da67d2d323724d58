//! Pipeline Deterministic Simulation Tests
//!
//! Runs the create-list pipeline against a fault-injecting origin bucket
//! across many seeds, restarting from the reported resume cursor until
//! each run completes.

use carpark_bucket_diff::dst::{
    run_dst_batch, summarize_batch, PipelineDSTConfig, PipelineDSTHarness,
};

// =============================================================================
// Standard Configuration Tests
// =============================================================================

#[tokio::test]
async fn test_pipeline_dst_50_seeds_calm() {
    let results = run_dst_batch(0, 50, PipelineDSTConfig::calm).await;
    let summary = summarize_batch(&results);
    println!("{}", summary);

    let passed = results.iter().filter(|r| r.is_success()).count();
    assert_eq!(passed, 50, "All seeds should pass without faults: {}", summary);
    assert!(
        results.iter().all(|r| r.attempts == 1 && r.duplicate_rows == 0),
        "Calm runs should complete first time"
    );
}

#[tokio::test]
async fn test_pipeline_dst_50_seeds_moderate() {
    let results = run_dst_batch(1000, 50, PipelineDSTConfig::moderate).await;
    let summary = summarize_batch(&results);
    println!("{}", summary);

    let passed = results.iter().filter(|r| r.is_success()).count();
    assert_eq!(passed, 50, "All seeds should pass with moderate faults: {}", summary);
}

#[tokio::test]
async fn test_pipeline_dst_50_seeds_chaos() {
    let results = run_dst_batch(2000, 50, PipelineDSTConfig::chaos).await;
    let summary = summarize_batch(&results);
    println!("{}", summary);

    let passed = results.iter().filter(|r| r.is_success()).count();
    assert_eq!(passed, 50, "All seeds should pass under chaos: {}", summary);
}

// =============================================================================
// Larger Buckets
// =============================================================================

#[tokio::test]
async fn test_pipeline_dst_large_bucket_chaos() {
    let config = PipelineDSTConfig {
        object_count: 1500,
        read_batch_size: 100,
        write_batch_size: 64,
        ..PipelineDSTConfig::chaos(12345)
    };
    let mut harness = PipelineDSTHarness::new(config);
    harness.run().await;
    let result = harness.result();
    println!("Large bucket: {}", result.summary());
    assert!(
        result.is_success(),
        "Large bucket should maintain invariants: {:?}",
        result.invariant_violations
    );
}

#[tokio::test]
async fn test_pipeline_dst_single_entry_shards() {
    let config = PipelineDSTConfig {
        write_batch_size: 1,
        ..PipelineDSTConfig::moderate(777)
    };
    let mut harness = PipelineDSTHarness::new(config);
    harness.run().await;
    let result = harness.result();
    println!("Single-entry shards: {}", result.summary());
    assert!(result.is_success(), "{:?}", result.invariant_violations);
    assert_eq!(result.shards, result.manifest_rows);
}
