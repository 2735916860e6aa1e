//! Oracle check for the spillover buffer.

use std::collections::VecDeque;

use serbridge::SpilloverBuffer;

#[derive(Clone, Debug)]
pub enum SpilloverOp {
    Extend(Vec<u8>),
    TakeExact(usize),
    TakeAll,
    Clear,
}

/// Execute a sequence of operations and verify FIFO order.
pub fn execute_and_verify(ops: &[SpilloverOp]) -> Result<(), String> {
    let mut buf = SpilloverBuffer::new();
    let mut oracle: VecDeque<u8> = VecDeque::new();

    for (i, op) in ops.iter().enumerate() {
        match op {
            SpilloverOp::Extend(bytes) => {
                buf.extend(bytes);
                oracle.extend(bytes.iter().copied());
            }
            SpilloverOp::TakeExact(n) => {
                let got = buf.take_exact(*n);
                let expected = (oracle.len() >= *n).then(|| oracle.drain(..*n).collect::<Vec<u8>>());
                if got != expected {
                    return Err(format!(
                        "op {}: take_exact({}) = {:?}, expected {:?}",
                        i, n, got, expected
                    ));
                }
            }
            SpilloverOp::TakeAll => {
                let got = buf.take_all();
                let expected: Vec<u8> = oracle.drain(..).collect();
                if got != expected {
                    return Err(format!("op {}: take_all = {:?}, expected {:?}", i, got, expected));
                }
            }
            SpilloverOp::Clear => {
                buf.clear();
                oracle.clear();
            }
        }

        if buf.len() != oracle.len() || buf.is_empty() != oracle.is_empty() {
            return Err(format!(
                "after op {}: len {} but oracle holds {}",
                i,
                buf.len(),
                oracle.len()
            ));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_take_leaves_buffer_intact() {
        let ops = vec![
            SpilloverOp::Extend(vec![1, 2, 3]),
            SpilloverOp::TakeExact(4),
            SpilloverOp::TakeExact(2),
            SpilloverOp::Extend(vec![4]),
            SpilloverOp::TakeAll,
        ];
        execute_and_verify(&ops).unwrap();
    }
}
