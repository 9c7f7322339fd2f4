use std::io;

/// A growable, bounded byte queue used for both the receive and transmit side of a
/// client connection. Data is written at `size` and read from `pos`; once the readable
/// span `[pos, size)` is fully consumed both cursors reset to zero.
///
/// `reserve` compacts the buffer (moving `[pos, size)` down to index zero) before
/// growing, and doubles capacity up to `MAX` if compaction alone isn't enough. If the
/// buffer is already at `MAX` and still doesn't have room, `reserve` fails, and callers
/// decide whether that's fatal (a pending write can't be queued) or benign backpressure
/// (nothing more to read off the socket right now).
pub struct NetworkBuffer {
    data: Vec<u8>,
    size: usize,
    capacity: usize,
    pos: usize,
}

impl NetworkBuffer {
    pub const MAX: usize = 16384;

    pub fn new(initial_capacity: usize) -> NetworkBuffer {
        let capacity = initial_capacity.min(Self::MAX);
        NetworkBuffer {
            data: vec![0u8; capacity],
            size: 0,
            capacity,
            pos: 0,
        }
    }

    #[inline]
    pub fn readable(&self) -> &[u8] {
        &self.data[self.pos..self.size]
    }

    #[inline]
    pub fn readable_len(&self) -> usize {
        self.size - self.pos
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pos == self.size
    }

    /// Advance the read cursor. Resets both cursors to zero once everything buffered has
    /// been consumed, so the next `reserve` doesn't need to compact.
    #[inline]
    pub fn consume(&mut self, n: usize) {
        self.pos += n;
        debug_assert!(self.pos <= self.size);
        if self.pos == self.size {
            self.pos = 0;
            self.size = 0;
        }
    }

    /// Ensures at least `n` bytes of writable room past `size`, compacting and then
    /// doubling capacity (up to `MAX`) as needed. Returns `false` if `n` bytes of room
    /// cannot be made available.
    pub fn reserve(&mut self, n: usize) -> bool {
        if self.capacity - self.size >= n {
            return true;
        }

        if self.pos > 0 {
            self.data.copy_within(self.pos..self.size, 0);
            self.size -= self.pos;
            self.pos = 0;

            if self.capacity - self.size >= n {
                return true;
            }
        }

        while self.capacity < Self::MAX {
            let new_capacity = (self.capacity * 2).min(Self::MAX);
            self.data.resize(new_capacity, 0);
            self.capacity = new_capacity;

            if self.capacity - self.size >= n {
                return true;
            }
        }

        false
    }

    /// Writable tail, valid only immediately after a successful `reserve` for at least
    /// the slice length the caller intends to fill.
    #[inline]
    pub fn writable_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.size..self.capacity]
    }

    #[inline]
    pub fn commit(&mut self, n: usize) {
        self.size += n;
        debug_assert!(self.size <= self.capacity);
    }

    #[inline]
    pub fn clear(&mut self) {
        self.pos = 0;
        self.size = 0;
    }

    /// Drains as much of the readable span as possible into `writer`. Stops cleanly on
    /// `WouldBlock`; any other error is propagated for the caller to treat as fatal.
    pub fn egress<W: io::Write>(&mut self, writer: &mut W) -> io::Result<usize> {
        let mut total = 0usize;

        while !self.is_empty() {
            match writer.write(self.readable()) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    self.consume(n);
                    total += n;
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(total),
                Err(err) => return Err(err),
            }
        }

        Ok(total)
    }
}
