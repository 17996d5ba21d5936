//! The deterministic mapping between answer sets and figurine identifiers.
//!
//! Six questions, with 6/5/5/6/6/5 possible answers each, give 27000
//! combinations. The id is a mixed-radix encoding of the six answer indices
//! in question order, shifted to be 1-based.

use crate::catalog::ANSWER_COUNTS;
use crate::shapes::{shape_for, Shape};

/// Number of distinct figurine identifiers; product of [`ANSWER_COUNTS`].
pub const TOTAL_IDS: u32 = 27000;

/// Mixed-radix encode of the answer indices in F01..F06 order. F01 is the
/// most significant digit. Returns `None` if any index is out of range for
/// its question.
pub fn encode(indices: [u8; 6]) -> Option<u32> {
    let mut id = 0u32;
    for (i, &idx) in indices.iter().enumerate() {
        let radix = ANSWER_COUNTS[i] as u32;
        if idx as u32 >= radix {
            return None;
        }
        id = id * radix + idx as u32;
    }
    Some(id + 1)
}

/// Inverse of [`encode`]. Returns `None` outside `[1, TOTAL_IDS]`.
pub fn decode(id: u32) -> Option<[u8; 6]> {
    if id == 0 || id > TOTAL_IDS {
        return None;
    }
    let mut rest = id - 1;
    let mut indices = [0u8; 6];
    for i in (0..6).rev() {
        let radix = ANSWER_COUNTS[i] as u32;
        indices[i] = (rest % radix) as u8;
        rest /= radix;
    }
    Some(indices)
}

/// The six shapes of a figurine in visual order, top of the stack first
/// (F06 down to F01). Returns `None` outside `[1, TOTAL_IDS]`.
pub fn shapes_of(id: u32) -> Option<[Shape; 6]> {
    let indices = decode(id)?;
    let mut shapes = [Shape::WideRectangle; 6];
    for (level, q) in (0..6).rev().enumerate() {
        shapes[level] = shape_for(q, indices[q] as usize);
    }
    Some(shapes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_zero_answers_is_id_one() {
        assert_eq!(encode([0, 0, 0, 0, 0, 0]), Some(1));
    }

    #[test]
    fn all_max_answers_is_last_id() {
        assert_eq!(encode([5, 4, 4, 5, 5, 4]), Some(TOTAL_IDS));
    }

    #[test]
    fn mixed_answers_match_hand_computed_id() {
        // 0*4500 + 1*900 + 2*180 + 3*30 + 4*5 + 0*1, one-based.
        assert_eq!(encode([0, 1, 2, 3, 4, 0]), Some(1371));
    }

    #[test]
    fn out_of_range_index_is_rejected() {
        assert_eq!(encode([6, 0, 0, 0, 0, 0]), None);
        assert_eq!(encode([0, 5, 0, 0, 0, 0]), None);
    }

    #[test]
    fn decode_rejects_out_of_range_ids() {
        assert_eq!(decode(0), None);
        assert_eq!(decode(TOTAL_IDS + 1), None);
    }

    #[test]
    fn encode_then_decode_roundtrips_every_answer_set() {
        for a0 in 0..6u8 {
            for a1 in 0..5u8 {
                for a2 in 0..5u8 {
                    for a3 in 0..6u8 {
                        for a4 in 0..6u8 {
                            for a5 in 0..5u8 {
                                let answers = [a0, a1, a2, a3, a4, a5];
                                let id = encode(answers).unwrap();
                                assert!((1..=TOTAL_IDS).contains(&id));
                                assert_eq!(decode(id), Some(answers));
                            }
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn decode_then_encode_covers_the_full_range_without_duplicates() {
        let mut seen = vec![false; TOTAL_IDS as usize + 1];
        for id in 1..=TOTAL_IDS {
            let answers = decode(id).unwrap();
            assert_eq!(encode(answers), Some(id));
            assert!(!seen[id as usize]);
            seen[id as usize] = true;
        }
    }

    #[test]
    fn shapes_are_listed_top_first() {
        let shapes = shapes_of(1).unwrap();
        assert_eq!(shapes[0], shape_for(5, 0));
        assert_eq!(shapes[5], shape_for(0, 0));
    }
}
