//! Oracle check for the byte ring.

use std::collections::VecDeque;

use serbridge::{RingChannel, RingConfig, RingError, RingReader, RingWriter};

/// Smallest capacity the harness builds (header included).
pub const MIN_CAPACITY: u32 = 5;
/// Keep small so wraparound happens every few operations.
pub const MAX_CAPACITY: u32 = 96;

/// Operations applied to one ring.
#[derive(Clone, Debug)]
pub enum RingOp {
    Push(Vec<u8>),
    Drain(usize),
    Skip,
}

/// Build a ring geometry from arbitrary input bytes.
pub fn config_from(capacity_byte: u8, header_byte: u8) -> RingConfig {
    let capacity = MIN_CAPACITY + capacity_byte as u32 % (MAX_CAPACITY - MIN_CAPACITY + 1);
    // Leave at least two payload bytes.
    let header_size = 1 + header_byte as u32 % (capacity - 2);
    RingConfig::new(capacity, header_size)
}

struct Harness {
    writer: RingWriter,
    reader: RingReader,
    oracle: VecDeque<u8>,
    config: RingConfig,
}

/// Execute a sequence of operations and verify invariants.
pub fn execute_and_verify(config: RingConfig, ops: &[RingOp]) -> Result<(), String> {
    let (writer, reader) =
        RingChannel::pair(config).map_err(|e| format!("invalid config {:?}: {}", config, e))?;
    let mut h = Harness {
        writer,
        reader,
        oracle: VecDeque::new(),
        config,
    };

    for (i, op) in ops.iter().enumerate() {
        match op {
            RingOp::Push(bytes) => {
                let free = h.config.payload_len() - 1 - h.oracle.len();
                match h.writer.push(bytes) {
                    Ok(()) => {
                        if bytes.len() > free {
                            return Err(format!(
                                "op {}: accepted {} bytes with only {} free",
                                i,
                                bytes.len(),
                                free
                            ));
                        }
                        h.oracle.extend(bytes.iter().copied());
                    }
                    Err(RingError::Overflow { requested, free: reported }) => {
                        if bytes.len() <= free || requested != bytes.len() || reported != free {
                            return Err(format!(
                                "op {}: rejected {} bytes (reported free {}, actual free {})",
                                i,
                                bytes.len(),
                                reported,
                                free
                            ));
                        }
                    }
                }
            }
            RingOp::Drain(max_len) => {
                let got = h.reader.drain(*max_len);
                let n = (*max_len).min(h.oracle.len());
                let expected: Vec<u8> = h.oracle.drain(..n).collect();
                if got != expected {
                    return Err(format!(
                        "op {}: drained {:?}, expected {:?}",
                        i, got, expected
                    ));
                }
            }
            RingOp::Skip => {
                let skipped = h.reader.skip_to_producer();
                if skipped != h.oracle.len() {
                    return Err(format!(
                        "op {}: skipped {}, expected {}",
                        i,
                        skipped,
                        h.oracle.len()
                    ));
                }
                h.oracle.clear();
            }
        }

        verify_invariants(&h, i)?;
    }

    Ok(())
}

fn verify_invariants(h: &Harness, op_idx: usize) -> Result<(), String> {
    let header = h.config.header_size as u16;
    let capacity = h.config.capacity;

    for (name, cursor) in [("producer", h.writer.cursor()), ("reader", h.reader.cursor())] {
        if cursor < header || cursor as u32 >= capacity {
            return Err(format!(
                "after op {}: {} cursor {} outside {}..{}",
                op_idx, name, cursor, header, capacity
            ));
        }
    }

    if h.reader.available() != h.oracle.len() {
        return Err(format!(
            "after op {}: available()={} but oracle holds {}",
            op_idx,
            h.reader.available(),
            h.oracle.len()
        ));
    }

    let free = h.config.payload_len() - 1 - h.oracle.len();
    if h.writer.free_space() != free {
        return Err(format!(
            "after op {}: free_space()={} but expected {}",
            op_idx,
            h.writer.free_space(),
            free
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrap_sequence() {
        let config = RingConfig::new(16, 3);
        let ops = vec![
            RingOp::Push(vec![1; 7]),
            RingOp::Drain(100),
            RingOp::Push(vec![2; 6]),
            RingOp::Drain(3),
            RingOp::Push(vec![3; 9]),
            RingOp::Push(vec![4; 1]),
            RingOp::Drain(100),
        ];
        execute_and_verify(config, &ops).unwrap();
    }

    #[test]
    fn test_skip_then_push() {
        let config = RingConfig::new(8, 1);
        let ops = vec![
            RingOp::Push(vec![9; 6]),
            RingOp::Skip,
            RingOp::Push(vec![1, 2, 3, 4, 5, 6]),
            RingOp::Drain(6),
        ];
        execute_and_verify(config, &ops).unwrap();
    }

    #[test]
    fn test_config_from_is_always_valid() {
        for c in 0..=255u8 {
            for h in [0u8, 1, 7, 200, 255] {
                config_from(c, h).validate().unwrap();
            }
        }
    }
}
