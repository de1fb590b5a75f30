//! Wire formats spoken on the SLIP link.
//!
//! There are three of them:
//!
//! - the [topology message][topology::TopologyMessage], broadcast by the
//!   master. It carries time sync and the list of known devices.
//! - the [announce frame][announce::Announce], sent by an end device to
//!   advertise its address and serial number. We only ever see it through
//!   the raw capture socket, so it's decoded from the captured IP packet.
//! - the [legacy poll frame][legacy::LEGACY_POLL_FRAME], a constant control
//!   frame for 9600 baud devices.
//!
//! All multi-byte integers are little-endian.

use bytes::Buf;

pub mod announce;
pub mod legacy;
pub mod topology;

/// Length of the serial number carried in announces and topology messages.
pub const SERIAL_NUMBER_LENGTH: usize = 18;

/// First two octets of every device address (`169.254.0.0/16`).
pub const LINK_LOCAL_PREFIX: [u8; 2] = [169, 254];

/// UDP port the topology broadcast and the device polls are sent to.
pub const BROADCAST_PORT: u16 = 30000;

/// Unencrypted MQTT port. Devices treat any other port as encrypted.
pub const MQTT_PORT: u16 = 1883;

pub(crate) trait BufReadBytesExt {
    fn get_bytes<const N: usize>(&mut self) -> [u8; N];
}

impl<B: Buf> BufReadBytesExt for B {
    fn get_bytes<const N: usize>(&mut self) -> [u8; N] {
        let mut data: [u8; N] = [0; N];
        self.copy_to_slice(&mut data[..]);
        data
    }
}

/// Encode the 4 byte poll datagram for a device.
///
/// The payload is the full address of the device being polled. The datagram
/// itself is broadcast, every device sees it and the addressed one answers.
pub fn encode_poll<B: bytes::BufMut>(ip_suffix: crate::IpSuffix, mut buffer: B) {
    buffer.put_slice(&LINK_LOCAL_PREFIX);
    buffer.put_u8(ip_suffix.octet3);
    buffer.put_u8(ip_suffix.octet4);
}

/// Length of a poll datagram in bytes
pub const POLL_LENGTH: usize = 4;

#[cfg(test)]
mod tests {
    use crate::{
        IpSuffix,
        wire::encode_poll,
    };

    #[test]
    fn poll_datagram_carries_the_device_address() {
        let mut buffer = Vec::new();
        encode_poll(
            IpSuffix {
                octet3: 20,
                octet4: 84,
            },
            &mut buffer,
        );
        assert_eq!(buffer, [169, 254, 20, 84]);
    }
}
