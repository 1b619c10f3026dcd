// src/tt.rs
//
// Shared transposition table. Entries are two packed 64-bit words per slot;
// the key word is stored as `real_key ^ data` (the Hyatt XOR trick) so a
// torn write from a racing thread fails validation and reads as a miss.
// Probes and stores touch the slots without locking; the outer RwLock only
// serializes resize/clear against readers.
//
// Data word layout:
// [15-0]:  move (16 bits)
// [31-16]: score (16 bits, two's complement)
// [47-32]: static eval (16 bits, two's complement)
// [53-48]: depth (6 bits)
// [55-54]: bound (2 bits)
// [61-56]: age (6 bits)

use crate::defs::MATE_BOUND;
use crate::position::Position;
use chess::{ChessMove, Piece, ALL_SQUARES};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

const MOVE_SHIFT: u64 = 0;
const MOVE_MASK: u64 = 0xFFFF;
const SCORE_SHIFT: u64 = 16;
const SCORE_MASK: u64 = 0xFFFF;
const EVAL_SHIFT: u64 = 32;
const EVAL_MASK: u64 = 0xFFFF;
const DEPTH_SHIFT: u64 = 48;
const DEPTH_MASK: u64 = 0x3F;
const BOUND_SHIFT: u64 = 54;
const BOUND_MASK: u64 = 0x3;
const AGE_SHIFT: u64 = 56;
const AGE_MASK: u64 = 0x3F;

pub const SLOTS_PER_BUCKET: usize = 3;

/// Whether a stored score is exact or a bound from a fail-high/fail-low.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Bound {
    Exact = 0,
    /// Fail-high: the true score is at least the stored one.
    Lower = 1,
    /// Fail-low: the true score is at most the stored one.
    Upper = 2,
}

#[derive(Clone, Copy)]
pub struct TtEntry {
    key: u64,
    data: u64,
}

impl TtEntry {
    /// Pack a search result. Mate scores are shifted to be relative to this
    /// node (`+ply` / `-ply`) so that a later probe at a different ply can
    /// recover the distance from its own point of view.
    pub fn new(
        key: u64,
        mut score: i32,
        eval: i32,
        bound: Bound,
        depth: i32,
        mv: Option<ChessMove>,
        ply: i32,
    ) -> Self {
        if score > MATE_BOUND {
            score += ply;
        } else if score < -MATE_BOUND {
            score -= ply;
        }

        let depth = depth.clamp(0, DEPTH_MASK as i32) as u64;
        let data = ((encode_move(mv) as u64) << MOVE_SHIFT)
            | (((score as i16 as u16) as u64) << SCORE_SHIFT)
            | (((eval as i16 as u16) as u64) << EVAL_SHIFT)
            | (depth << DEPTH_SHIFT)
            | ((bound as u64) << BOUND_SHIFT);

        TtEntry { key, data }
    }

    /// Stored score seen from `ply`: the inverse of the shift in `new`.
    pub fn score(&self, ply: i32) -> i32 {
        let s = ((self.data >> SCORE_SHIFT) & SCORE_MASK) as u16 as i16 as i32;
        if s > MATE_BOUND {
            s - ply
        } else if s < -MATE_BOUND {
            s + ply
        } else {
            s
        }
    }

    #[inline]
    pub fn eval(&self) -> i32 {
        ((self.data >> EVAL_SHIFT) & EVAL_MASK) as u16 as i16 as i32
    }

    #[inline]
    pub fn depth(&self) -> i32 {
        ((self.data >> DEPTH_SHIFT) & DEPTH_MASK) as i32
    }

    #[inline]
    pub fn bound(&self) -> Bound {
        match (self.data >> BOUND_SHIFT) & BOUND_MASK {
            0 => Bound::Exact,
            1 => Bound::Lower,
            _ => Bound::Upper,
        }
    }

    #[inline]
    pub fn age(&self) -> u8 {
        ((self.data >> AGE_SHIFT) & AGE_MASK) as u8
    }

    pub fn mv(&self) -> Option<ChessMove> {
        decode_move(((self.data >> MOVE_SHIFT) & MOVE_MASK) as u16)
    }

    fn with_age(self, age: u8) -> Self {
        let data =
            (self.data & !(AGE_MASK << AGE_SHIFT)) | (((age as u64) & AGE_MASK) << AGE_SHIFT);
        TtEntry { key: self.key, data }
    }
}

// A move fits in 16 bits: source square in the top six, destination in the
// middle six, promotion piece in the low nibble. The all-zero word is
// reserved for "no move" (a1a1 with no promotion is never legal, so nothing
// real packs to zero).
const TT_MOVE_SRC_SHIFT: u16 = 10;
const TT_MOVE_DST_SHIFT: u16 = 4;
const TT_MOVE_SQ_MASK: u16 = 0x3F;
const TT_MOVE_PROMO_MASK: u16 = 0xF;

fn encode_move(mv: Option<ChessMove>) -> u16 {
    let Some(m) = mv else { return 0 };
    let promo: u16 = match m.get_promotion() {
        Some(Piece::Knight) => 1,
        Some(Piece::Bishop) => 2,
        Some(Piece::Rook) => 3,
        Some(Piece::Queen) => 4,
        _ => 0,
    };
    ((m.get_source().to_index() as u16) << TT_MOVE_SRC_SHIFT)
        | ((m.get_dest().to_index() as u16) << TT_MOVE_DST_SHIFT)
        | promo
}

fn decode_move(val: u16) -> Option<ChessMove> {
    if val == 0 {
        return None;
    }
    // Masked indices stay below 64, so the square lookup cannot go out of
    // bounds even on a corrupted word.
    let src = ALL_SQUARES[((val >> TT_MOVE_SRC_SHIFT) & TT_MOVE_SQ_MASK) as usize];
    let dst = ALL_SQUARES[((val >> TT_MOVE_DST_SHIFT) & TT_MOVE_SQ_MASK) as usize];
    let promo = match val & TT_MOVE_PROMO_MASK {
        1 => Some(Piece::Knight),
        2 => Some(Piece::Bishop),
        3 => Some(Piece::Rook),
        4 => Some(Piece::Queen),
        _ => None,
    };
    Some(ChessMove::new(src, dst, promo))
}

#[derive(Default)]
struct Slot {
    key: AtomicU64,
    data: AtomicU64,
}

#[derive(Default)]
struct Bucket {
    slots: [Slot; SLOTS_PER_BUCKET],
}

pub struct TranspositionTable {
    buckets: RwLock<Vec<Bucket>>,
    age: AtomicU8,
}

impl TranspositionTable {
    pub fn new(mbs: usize) -> Self {
        let tt = Self {
            buckets: RwLock::new(Vec::new()),
            age: AtomicU8::new(0),
        };
        tt.resize(mbs);
        tt
    }

    /// Reallocate to `mbs` megabytes, invalidating every entry. Must not
    /// race a searcher: stop and wait for the worker first.
    pub fn resize(&self, mbs: usize) {
        let count = (mbs * 1024 * 1024 / std::mem::size_of::<Bucket>()).max(1);
        let mut buckets = self.buckets.write();
        *buckets = (0..count).map(|_| Bucket::default()).collect();
    }

    /// Zero all buckets in place.
    pub fn clear(&self) {
        let buckets = self.buckets.write();
        for b in buckets.iter() {
            for slot in &b.slots {
                slot.key.store(0, Ordering::Relaxed);
                slot.data.store(0, Ordering::Relaxed);
            }
        }
    }

    /// Bump the generation counter. Once per root search.
    pub fn new_search(&self) {
        let age = self.age.load(Ordering::Relaxed);
        self.age
            .store(age.wrapping_add(1) & AGE_MASK as u8, Ordering::Relaxed);
    }

    /// First XOR-valid entry in the bucket, with its age refreshed in place
    /// (a benign race: a torn refresh just reads as a miss later).
    pub fn probe(&self, key: u64) -> Option<TtEntry> {
        let buckets = self.buckets.read();
        let bucket = &buckets[(key % buckets.len() as u64) as usize];
        let age = self.age.load(Ordering::Relaxed);

        for slot in &bucket.slots {
            let k = slot.key.load(Ordering::Relaxed);
            let d = slot.data.load(Ordering::Relaxed);
            if k ^ d == key {
                let mut entry = TtEntry { key, data: d };
                if entry.age() != age {
                    entry = entry.with_age(age);
                    slot.data.store(entry.data, Ordering::Relaxed);
                    slot.key.store(key ^ entry.data, Ordering::Relaxed);
                }
                return Some(entry);
            }
        }

        None
    }

    /// Replacement order: the slot already holding this key, else the
    /// shallowest slot from an older generation, else the shallowest slot.
    pub fn store(&self, entry: TtEntry) {
        let age = self.age.load(Ordering::Relaxed);
        let entry = entry.with_age(age);
        let buckets = self.buckets.read();
        let bucket = &buckets[(entry.key % buckets.len() as u64) as usize];

        let mut replace = None;
        for slot in &bucket.slots {
            let k = slot.key.load(Ordering::Relaxed);
            let d = slot.data.load(Ordering::Relaxed);
            if k ^ d == entry.key {
                replace = Some(slot);
                break;
            }
        }

        if replace.is_none() {
            let mut replace_depth = i32::MAX;
            for slot in &bucket.slots {
                let e = TtEntry {
                    key: 0,
                    data: slot.data.load(Ordering::Relaxed),
                };
                if e.age() != age && e.depth() < replace_depth {
                    replace = Some(slot);
                    replace_depth = e.depth();
                }
            }
            if replace.is_none() {
                for slot in &bucket.slots {
                    let e = TtEntry {
                        key: 0,
                        data: slot.data.load(Ordering::Relaxed),
                    };
                    if e.depth() < replace_depth {
                        replace = Some(slot);
                        replace_depth = e.depth();
                    }
                }
            }
        }

        if let Some(slot) = replace {
            slot.data.store(entry.data, Ordering::Relaxed);
            slot.key.store(entry.key ^ entry.data, Ordering::Relaxed);
        }
    }

    /// Hint the bucket into cache ahead of the probe.
    #[inline]
    pub fn prefetch(&self, key: u64) {
        #[cfg(target_arch = "x86_64")]
        {
            let buckets = self.buckets.read();
            let bucket = &buckets[(key % buckets.len() as u64) as usize];
            unsafe {
                use std::arch::x86_64::{_mm_prefetch, _MM_HINT_NTA};
                _mm_prefetch(bucket as *const Bucket as *const i8, _MM_HINT_NTA);
            }
        }
        #[cfg(not(target_arch = "x86_64"))]
        let _ = key;
    }

    /// Fill estimate in permille, sampled over the first 1000 buckets and
    /// counting only current-generation slots.
    pub fn hashfull(&self) -> u64 {
        let buckets = self.buckets.read();
        let age = self.age.load(Ordering::Relaxed);
        let sample = buckets.len().min(1000);
        let mut cnt = 0u64;
        for bucket in buckets.iter().take(sample) {
            for slot in &bucket.slots {
                let e = TtEntry {
                    key: 0,
                    data: slot.data.load(Ordering::Relaxed),
                };
                if e.depth() != 0 && e.age() == age {
                    cnt += 1;
                }
            }
        }
        cnt * 1000 / (sample as u64 * SLOTS_PER_BUCKET as u64)
    }

    /// Follow stored moves from `pos` while they stay legal.
    pub fn extract_pv(&self, mut pos: Position, max_len: usize) -> Vec<ChessMove> {
        let mut pv = Vec::new();
        while pv.len() < max_len {
            let Some(entry) = self.probe(pos.key()) else { break };
            let Some(mv) = entry.mv() else { break };
            if !pos.is_legal(mv) {
                break;
            }
            pos = pos.do_move(mv);
            pv.push(mv);
        }
        pv
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn move_packing_round_trip() {
        for s in ["e2e4", "a1h8", "e7e8q", "b7b8n", "g2g1r", "c2c1b"] {
            let mv = ChessMove::from_str(s).unwrap();
            assert_eq!(decode_move(encode_move(Some(mv))), Some(mv));
        }
        assert_eq!(encode_move(None), 0);
        assert_eq!(decode_move(0), None);
    }

    #[test]
    fn entry_field_isolation() {
        let mv = ChessMove::from_str("g1f3").unwrap();
        let e = TtEntry::new(0xDEAD_BEEF, -1234, 567, Bound::Upper, 17, Some(mv), 0);
        assert_eq!(e.score(0), -1234);
        assert_eq!(e.eval(), 567);
        assert_eq!(e.depth(), 17);
        assert_eq!(e.bound(), Bound::Upper);
        assert_eq!(e.mv(), Some(mv));
    }

    #[test]
    fn depth_is_clamped_to_six_bits() {
        let e = TtEntry::new(1, 0, 0, Bound::Exact, 200, None, 0);
        assert_eq!(e.depth(), 63);
    }
}
