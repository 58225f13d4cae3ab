use rand::Rng;

/// Half of the u16 sequence space, used for wraparound comparisons.
pub const SEQ_NUM_HALF: u16 = 1 << 15;

/// Signed distance from `prev` to `value`, taking wraparound into account.
pub fn seq_diff(value: u16, prev: u16) -> i32 {
    value.wrapping_sub(prev) as i16 as i32
}

/// Returns true if `value` comes after `prev` in sequence number order.
pub fn is_seq_newer(value: u16, prev: u16) -> bool {
    value != prev && value.wrapping_sub(prev) < SEQ_NUM_HALF
}

/// Sequencer generates sequential sequence numbers for building RTP packets.
#[derive(Debug, Clone)]
pub struct Sequencer {
    sequence_number: u16,
    roll_over_count: u64,
}

impl Sequencer {
    /// Returns a new sequencer starting from a random sequence number.
    pub fn new_random() -> Self {
        Self::new_fixed(rand::rng().random::<u16>())
    }

    /// Returns a new sequencer starting from a specific sequence number.
    pub fn new_fixed(s: u16) -> Self {
        Self {
            sequence_number: s,
            roll_over_count: 0,
        }
    }

    /// Returns the next sequence number and advances the sequencer.
    pub fn next_sequence_number(&mut self) -> u16 {
        let s = self.sequence_number;
        self.sequence_number = self.sequence_number.wrapping_add(1);
        if self.sequence_number == 0 {
            self.roll_over_count += 1;
        }
        s
    }

    /// Number of times the 16-bit sequence number has wrapped.
    pub fn roll_over_count(&self) -> u64 {
        self.roll_over_count
    }
}
