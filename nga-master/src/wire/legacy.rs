//! Legacy poll frame for 9600 baud devices.
//!
//! This is a fixed control frame, framed with DLE STX ... DLE ETX. It's sent
//! raw on the serial line, not as an IP packet.

use bytes::BufMut;

pub const LEGACY_POLL_FRAME: [u8; 7] = [0x10, 0x02, 0x78, 0x00, 0x8a, 0x10, 0x03];

pub fn encode_legacy_poll<B: BufMut>(mut buffer: B) {
    buffer.put_slice(&LEGACY_POLL_FRAME);
}

#[cfg(test)]
mod tests {
    use crate::wire::legacy::encode_legacy_poll;

    #[test]
    fn frame_is_dle_framed() {
        let mut buffer = Vec::new();
        encode_legacy_poll(&mut buffer);
        assert_eq!(buffer.len(), 7);
        assert_eq!(&buffer[..2], &[0x10, 0x02]);
        assert_eq!(&buffer[5..], &[0x10, 0x03]);
    }
}
