//! The 8-byte payload codec used by every bootloader message.
//!
//! Layout, identical in both directions:
//!
//! | Byte | Field                                      |
//! |------|--------------------------------------------|
//! | 0..2 | MCU-ID, big-endian                         |
//! | 2    | command code                               |
//! | 3    | fragment: bits 7..5 data length, 4..0 addr |
//! | 4..8 | address (big-endian) or flash data         |

use scroll::{Pread, BE};

/// Every bootloader frame carries exactly this many payload bytes.
pub const PAYLOAD_LEN: usize = 8;

/// At most this many flash data bytes fit into one frame.
pub const MAX_DATA_LEN: usize = 4;

/// Pack a data-byte count (0..=4) and the low 5 address bits into byte 3.
pub fn pack_fragment(len: u8, address: u32) -> u8 {
    debug_assert!(len as usize <= MAX_DATA_LEN);
    (len << 5) | (address as u8 & 0x1F)
}

/// Split byte 3 into `(byte_count, addr_low5)`.
pub fn split_fragment(fragment: u8) -> (u8, u8) {
    (fragment >> 5, fragment & 0x1F)
}

/// A decoded (or to-be-encoded) bootloader payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Payload {
    pub mcu_id: u16,
    pub command: u8,
    pub fragment: u8,
    pub tail: [u8; 4],
}

impl Payload {
    /// Payload with zeroed fragment and tail.
    pub fn new(mcu_id: u16, command: u8) -> Self {
        Payload {
            mcu_id,
            command,
            fragment: 0,
            tail: [0; 4],
        }
    }

    /// Payload whose tail carries a big-endian flash address.
    pub fn with_address(mcu_id: u16, command: u8, address: u32) -> Self {
        Payload {
            tail: address.to_be_bytes(),
            ..Payload::new(mcu_id, command)
        }
    }

    /// Payload carrying up to 4 flash data bytes plus the packed fragment.
    pub fn with_data(mcu_id: u16, command: u8, address: u32, bytes: &[u8]) -> Self {
        debug_assert!(bytes.len() <= MAX_DATA_LEN);
        let mut tail = [0u8; 4];
        tail[..bytes.len()].copy_from_slice(bytes);
        Payload {
            mcu_id,
            command,
            fragment: pack_fragment(bytes.len() as u8, address),
            tail,
        }
    }

    /// Decode a received payload. Anything but exactly 8 bytes is ignored.
    pub fn decode(raw: &[u8]) -> Option<Self> {
        if raw.len() != PAYLOAD_LEN {
            return None;
        }
        let mcu_id = raw.pread_with::<u16>(0, BE).ok()?;
        let mut tail = [0u8; 4];
        tail.copy_from_slice(&raw[4..8]);
        Some(Payload {
            mcu_id,
            command: raw[2],
            fragment: raw[3],
            tail,
        })
    }

    pub fn to_bytes(&self) -> [u8; PAYLOAD_LEN] {
        let [hi, lo] = self.mcu_id.to_be_bytes();
        let [t0, t1, t2, t3] = self.tail;
        [hi, lo, self.command, self.fragment, t0, t1, t2, t3]
    }

    /// Number of flash data bytes in the tail (bits 7..5 of the fragment).
    pub fn byte_count(&self) -> u8 {
        self.fragment >> 5
    }

    /// Low 5 bits of the flash address this payload refers to.
    pub fn addr_low5(&self) -> u8 {
        self.fragment & 0x1F
    }

    /// The tail interpreted as a big-endian flash address.
    pub fn address(&self) -> u32 {
        u32::from_be_bytes(self.tail)
    }

    /// The flash data bytes carried in the tail.
    pub fn data(&self) -> &[u8] {
        &self.tail[..(self.byte_count() as usize).min(MAX_DATA_LEN)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fragment_packing() {
        assert_eq!(pack_fragment(4, 0x0000), 0x80);
        assert_eq!(pack_fragment(1, 0x0000), 0x20);
        assert_eq!(pack_fragment(0, 0x1F), 0x1F);
        assert_eq!(pack_fragment(2, 0x0123), 0x40 | 0x03);
        for len in 0..=4u8 {
            for addr in [0u32, 1, 0x1F, 0x20, 0x1234, 0xFFFF_FFFF] {
                let frag = pack_fragment(len, addr);
                assert_eq!(frag, (len << 5) | (addr as u8 & 0x1F));
                assert_eq!(split_fragment(frag), (len, addr as u8 & 0x1F));
            }
        }
    }

    #[test]
    fn round_trip() {
        for len in 0..=4usize {
            let bytes = [0xAA, 0xBB, 0xCC, 0xDD];
            let p = Payload::with_data(0x0042, 0x08, 0x0123, &bytes[..len]);
            let raw = p.to_bytes();
            let q = Payload::decode(&raw).unwrap();
            assert_eq!(q, p);
            assert_eq!(q.mcu_id, 0x0042);
            assert_eq!(q.command, 0x08);
            assert_eq!(q.byte_count() as usize, len);
            assert_eq!(q.addr_low5(), 0x03);
            assert_eq!(q.data(), &bytes[..len]);
        }
    }

    #[test]
    fn address_is_big_endian() {
        let p = Payload::with_address(0x0042, 0x0A, 0x1234_5678);
        assert_eq!(p.to_bytes()[4..], [0x12, 0x34, 0x56, 0x78]);
        assert_eq!(Payload::decode(&p.to_bytes()).unwrap().address(), 0x1234_5678);
    }

    #[test]
    fn decode_rejects_short_and_long_payloads() {
        assert!(Payload::decode(&[0u8; 7]).is_none());
        assert!(Payload::decode(&[0u8; 9]).is_none());
        assert!(Payload::decode(&[]).is_none());
        assert!(Payload::decode(&[0u8; 8]).is_some());
    }

    #[test]
    fn mcu_id_occupies_first_two_bytes() {
        let p = Payload::new(0xBEEF, 0x00);
        let raw = p.to_bytes();
        assert_eq!(raw[0], 0xBE);
        assert_eq!(raw[1], 0xEF);
        assert_eq!(raw[2..], [0, 0, 0, 0, 0, 0]);
    }
}
