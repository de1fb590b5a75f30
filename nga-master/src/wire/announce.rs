//! Device announce frames.
//!
//! An announce is a UDP datagram with 32 bytes of payload. The capture socket
//! on the SLIP interface sees the bare IP packet (there is no link header), so
//! the payload starts right after the 20 byte IP and 8 byte UDP headers:
//!
//! | offset | content                      |
//! |--------|------------------------------|
//! | 28     | marker `0x55`                |
//! | 29     | octet 4 of the device address|
//! | 30     | octet 3 of the device address|
//! | 31     | unused                       |
//! | 32..50 | serial number                |

use crate::{
    DeviceRecord,
    IpSuffix,
    SerialNumber,
    wire::{
        BufReadBytesExt,
        SERIAL_NUMBER_LENGTH,
    },
};

/// Total captured length of an announce frame.
pub const ANNOUNCE_LENGTH: usize = 60;

pub const ANNOUNCE_MARKER: u8 = 0x55;

const MARKER_OFFSET: usize = 28;
const OCTET4_OFFSET: usize = 29;
const OCTET3_OFFSET: usize = 30;
const SERIAL_NUMBER_OFFSET: usize = 32;

/// Why a captured frame isn't an announce.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum AnnounceError {
    #[error("frame has {length} bytes, announces have {}", ANNOUNCE_LENGTH)]
    Length { length: usize },

    #[error("marker byte is 0x{found:02x}, expected 0x{:02x}", ANNOUNCE_MARKER)]
    Marker { found: u8 },
}

/// A device announcing itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Announce {
    pub ip_suffix: IpSuffix,
    pub serial_number: SerialNumber,
}

impl Announce {
    pub fn decode(frame: &[u8]) -> Result<Self, AnnounceError> {
        if frame.len() != ANNOUNCE_LENGTH {
            return Err(AnnounceError::Length {
                length: frame.len(),
            });
        }

        let marker = frame[MARKER_OFFSET];
        if marker != ANNOUNCE_MARKER {
            return Err(AnnounceError::Marker { found: marker });
        }

        let ip_suffix = IpSuffix {
            octet3: frame[OCTET3_OFFSET],
            octet4: frame[OCTET4_OFFSET],
        };

        let mut buffer = &frame[SERIAL_NUMBER_OFFSET..];
        let serial_number = SerialNumber(buffer.get_bytes::<SERIAL_NUMBER_LENGTH>());

        Ok(Self {
            ip_suffix,
            serial_number,
        })
    }

    /// Writes the announce fields into a 60 byte frame.
    ///
    /// Only the marker, address and serial number bytes are touched. The IP
    /// and UDP headers are left to the caller.
    pub fn encode(&self, frame: &mut [u8; ANNOUNCE_LENGTH]) {
        frame[MARKER_OFFSET] = ANNOUNCE_MARKER;
        frame[OCTET4_OFFSET] = self.ip_suffix.octet4;
        frame[OCTET3_OFFSET] = self.ip_suffix.octet3;
        frame[SERIAL_NUMBER_OFFSET..SERIAL_NUMBER_OFFSET + SERIAL_NUMBER_LENGTH]
            .copy_from_slice(&self.serial_number.0);
    }
}

impl From<Announce> for DeviceRecord {
    fn from(value: Announce) -> Self {
        DeviceRecord {
            ip_suffix: value.ip_suffix,
            serial_number: value.serial_number,
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        IpSuffix,
        SerialNumber,
        wire::announce::{
            ANNOUNCE_LENGTH,
            Announce,
            AnnounceError,
        },
    };

    fn example_frame() -> [u8; ANNOUNCE_LENGTH] {
        let mut frame = [0u8; ANNOUNCE_LENGTH];
        // ipv4, udp, 60 bytes total
        frame[0] = 0x45;
        frame[3] = 60;
        frame[9] = 17;
        frame[28] = 0x55;
        frame[29] = 20;
        frame[30] = 10;
        frame[32..38].copy_from_slice(b"SN0001");
        frame
    }

    #[test]
    fn it_decodes_the_example() {
        let announce = Announce::decode(&example_frame()).unwrap();
        assert_eq!(announce.ip_suffix, IpSuffix::new(10, 20));
        assert_eq!(announce.serial_number, SerialNumber::from_str_padded("SN0001"));
    }

    #[test]
    fn it_checks_the_length() {
        let frame = example_frame();
        assert_eq!(
            Announce::decode(&frame[..59]),
            Err(AnnounceError::Length { length: 59 })
        );
        let mut longer = frame.to_vec();
        longer.push(0);
        assert_eq!(
            Announce::decode(&longer),
            Err(AnnounceError::Length { length: 61 })
        );
    }

    #[test]
    fn it_checks_the_marker() {
        let mut frame = example_frame();
        frame[28] = 0x54;
        assert_eq!(
            Announce::decode(&frame),
            Err(AnnounceError::Marker { found: 0x54 })
        );
    }

    #[test]
    fn encoded_fields_decode_to_the_same_announce() {
        let announce = Announce {
            ip_suffix: IpSuffix::new(254, 1),
            serial_number: SerialNumber(*b"ABCDEFGHIJKLMNOPQR"),
        };
        let mut frame = [0xff; ANNOUNCE_LENGTH];
        announce.encode(&mut frame);
        assert_eq!(Announce::decode(&frame), Ok(announce));
    }
}
