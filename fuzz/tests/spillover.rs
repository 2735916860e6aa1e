//! Bolero fuzzer for the spillover buffer.
//!
//! Properties tested:
//! - FIFO order across arbitrary extend/take interleavings
//! - `take_exact` never returns a partial result

use bolero::check;
use serbridge_fuzz::spillover_model::{execute_and_verify, SpilloverOp};

fn main() {
    check!()
        .with_type::<Vec<(u8, Vec<u8>)>>()
        .for_each(|ops_data| {
            let ops: Vec<SpilloverOp> = ops_data
                .iter()
                .map(|(kind, bytes)| match kind % 6 {
                    0 | 1 => SpilloverOp::Extend(bytes.clone()),
                    2 | 3 => SpilloverOp::TakeExact(bytes.len()),
                    4 => SpilloverOp::TakeAll,
                    _ => SpilloverOp::Clear,
                })
                .collect();

            if let Err(e) = execute_and_verify(&ops) {
                panic!("Invariant violated: {}", e);
            }
        });
}
