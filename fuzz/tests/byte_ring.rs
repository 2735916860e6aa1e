//! Bolero fuzzer for the byte ring.
//!
//! Properties tested:
//! - Cursors stay inside `header_size..capacity`
//! - Bytes come out in the order they went in, across wraparound
//! - A push is accepted iff it fits in the free space (one byte held back)
//! - `available()` and `free_space()` always agree with the oracle

use bolero::check;
use serbridge_fuzz::ring_model::{config_from, execute_and_verify, RingOp};

fn main() {
    check!()
        .with_type::<(u8, u8, Vec<(u8, Vec<u8>)>)>()
        .for_each(|(capacity_byte, header_byte, ops_data)| {
            let config = config_from(*capacity_byte, *header_byte);

            let ops: Vec<RingOp> = ops_data
                .iter()
                .map(|(kind, bytes)| match kind % 5 {
                    0 | 1 => RingOp::Push(bytes.clone()),
                    2 | 3 => RingOp::Drain(bytes.len()),
                    _ => RingOp::Skip,
                })
                .collect();

            if let Err(e) = execute_and_verify(config, &ops) {
                panic!("Invariant violated: {}", e);
            }
        });
}
