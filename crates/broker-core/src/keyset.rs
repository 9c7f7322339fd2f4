/// Open-addressed, linear-probing set of 64-bit keys used for per-ledger dedup.
///
/// Capacity is always a power of two, starting at 32. The sentinel "empty" slot value
/// is `0`, which means this set cannot represent the key `0`. This is an accepted
/// restriction inherited from the on-disk format (callers must never insert `0`).
pub struct KeySet {
    table: Vec<u64>,
    size: usize,
}

const INITIAL_CAPACITY: usize = 32;

impl KeySet {
    pub fn new() -> KeySet {
        KeySet {
            table: vec![0u64; INITIAL_CAPACITY],
            size: 0,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn contains(&self, value: u64) -> bool {
        debug_assert_ne!(value, 0, "KeySet cannot represent the sentinel key 0");

        let mask = self.table.len() - 1;
        let mut bucket = (hash(value) as usize) & mask;

        loop {
            let slot = self.table[bucket];
            if slot == 0 {
                return false;
            }
            if slot == value {
                return true;
            }
            bucket = (bucket + 1) & mask;
        }
    }

    /// Inserts `value`, rehashing first if load factor would exceed one half. No-op if
    /// the value is already present.
    pub fn add(&mut self, value: u64) {
        debug_assert_ne!(value, 0, "KeySet cannot represent the sentinel key 0");

        if (self.size + 1) * 2 > self.table.len() {
            self.rehash();
        }

        let mask = self.table.len() - 1;
        let mut bucket = (hash(value) as usize) & mask;

        loop {
            let slot = self.table[bucket];
            if slot == value {
                return;
            }
            if slot == 0 {
                self.table[bucket] = value;
                self.size += 1;
                return;
            }
            bucket = (bucket + 1) & mask;
        }
    }

    fn rehash(&mut self) {
        let new_len = self.table.len() * 2;
        let old = std::mem::replace(&mut self.table, vec![0u64; new_len]);
        let mask = self.table.len() - 1;

        for value in old {
            if value == 0 {
                continue;
            }
            let mut bucket = (hash(value) as usize) & mask;
            while self.table[bucket] != 0 {
                bucket = (bucket + 1) & mask;
            }
            self.table[bucket] = value;
        }
    }
}

impl Default for KeySet {
    fn default() -> KeySet {
        KeySet::new()
    }
}

/// MurmurHash3-style 64-to-32 finalizer, applied twice and then folded once more,
/// shaped after the original 64-bit hash set's avalanche-then-fold. The intermediate
/// values here stay in `u64` rather than truncating to `uint32_t` at each step like
/// the C finalizer, so individual bucket placement differs; dedup correctness and
/// amortized probe length are unaffected.
fn hash(value: u64) -> u32 {
    let mut tmp = value ^ (value >> 32);
    tmp = ((tmp >> 16) ^ tmp).wrapping_mul(0x119d_e1f3);
    tmp = ((tmp >> 16) ^ tmp).wrapping_mul(0x119d_e1f3);
    tmp = (tmp >> 16) ^ tmp;
    tmp as u32
}
