//! Shared scenarios against the in-memory device.

use serbridge_testkit::MockFactory;

#[tokio::test]
async fn mock_round_trip_wraparound() {
    serbridge_testkit::init_tracing();
    serbridge_testkit::run_round_trip_wraparound::<MockFactory>().await;
}

#[tokio::test]
async fn mock_spillover_fifo() {
    serbridge_testkit::run_spillover_fifo::<MockFactory>().await;
}

#[tokio::test]
async fn mock_partial_timeout() {
    serbridge_testkit::run_partial_timeout::<MockFactory>().await;
}

#[tokio::test]
async fn mock_idempotent_close() {
    serbridge_testkit::run_idempotent_close::<MockFactory>().await;
}

#[tokio::test]
async fn mock_drain_discards_stale() {
    serbridge_testkit::run_drain_discards_stale::<MockFactory>().await;
}

#[tokio::test]
async fn mock_reopen() {
    serbridge_testkit::run_reopen::<MockFactory>().await;
}

#[tokio::test]
async fn mock_reset_sequence_at_target_baud() {
    serbridge_testkit::run_reset_sequence(115_200).await;
}

#[tokio::test]
async fn mock_reset_sequence_at_reset_baud() {
    serbridge_testkit::run_reset_sequence(1200).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn mock_round_trip_on_multi_thread_runtime() {
    serbridge_testkit::run_round_trip_wraparound::<MockFactory>().await;
}
