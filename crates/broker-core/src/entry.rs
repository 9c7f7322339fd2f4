use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};

/// Maximum payload size for a single entry, per the wire and on-disk format.
pub const MAX_PAYLOAD: usize = 128;

/// Header size: 8 bytes key + 1 byte size.
pub const HEADER_SIZE: usize = 9;

/// An entry header: a 64-bit dedup key and the payload length that follows it. The
/// payload itself is carried separately (callers hold it as a borrowed slice or a
/// fixed-size stack buffer) rather than owned by this type, matching how the reactor
/// handles it: read into a scratch buffer, never copied into a heap allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub key: u64,
    pub size: u8,
}

impl Header {
    pub fn new(key: u64, size: u8) -> Header {
        Header { key, size }
    }

    pub fn encode(&self, out: &mut [u8; HEADER_SIZE]) {
        (&mut out[..]).write_u64::<LittleEndian>(self.key).expect("fixed-size buffer");
        out[8] = self.size;
    }

    pub fn write<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_u64::<LittleEndian>(self.key)?;
        writer.write_u8(self.size)
    }

    pub fn decode(bytes: &[u8; HEADER_SIZE]) -> Header {
        let key = (&bytes[..8]).read_u64::<LittleEndian>().expect("fixed-size buffer");
        Header { key, size: bytes[8] }
    }

    pub fn read<R: Read>(reader: &mut R) -> io::Result<Header> {
        let key = reader.read_u64::<LittleEndian>()?;
        let size = reader.read_u8()?;
        Ok(Header { key, size })
    }
}

/// Padding so that `HEADER_SIZE + payload_size + padding` is a multiple of 16.
#[inline]
pub fn padding(payload_size: usize) -> usize {
    (16 - ((HEADER_SIZE + payload_size) % 16)) % 16
}

/// Stored length of an entry on disk: header, payload, and alignment padding.
#[inline]
pub fn stored_len(payload_size: usize) -> usize {
    round_up(HEADER_SIZE + payload_size, 16)
}

#[inline]
pub fn round_up(n: usize, align: usize) -> usize {
    (n + align - 1) / align * align
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips_through_fixed_buffer() {
        let header = Header::new(0x0123_4567_89ab_cdef, 42);
        let mut buf = [0u8; HEADER_SIZE];
        header.encode(&mut buf);
        assert_eq!(Header::decode(&buf), header);
    }

    #[test]
    fn header_encodes_little_endian() {
        let header = Header::new(1, 3);
        let mut buf = [0u8; HEADER_SIZE];
        header.encode(&mut buf);
        assert_eq!(&buf[..8], &[1, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(buf[8], 3);
    }

    #[test]
    fn padding_boundary_sizes() {
        // 9 + 0 = 9 -> pad 7 -> stored 16
        assert_eq!(padding(0), 7);
        assert_eq!(stored_len(0), 16);

        // 9 + 128 = 137 -> pad 7 -> stored 144
        assert_eq!(padding(128), 7);
        assert_eq!(stored_len(128), 144);

        // 9 + 7 = 16 -> pad 0 -> stored 16
        assert_eq!(padding(7), 0);
        assert_eq!(stored_len(7), 16);
    }

    #[test]
    fn round_up_is_exact_multiple() {
        assert_eq!(round_up(9, 16), 16);
        assert_eq!(round_up(16, 16), 16);
        assert_eq!(round_up(17, 16), 32);
    }
}
