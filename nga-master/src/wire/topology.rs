//! Topology broadcast.
//!
//! The master broadcasts this periodically. End devices use it to sync
//! their clock, learn the MQTT port, and find out whether the master knows
//! about them.
//!
//! # Format
//!
//! A 12 byte header, followed by `device_count` 22 byte [`DeviceDescriptor`]s:
//!
//! | offset | length | content                          |
//! |--------|--------|----------------------------------|
//! | 0      | 4      | seconds since the Unix epoch     |
//! | 4      | 4      | nanoseconds                      |
//! | 8      | 2      | MQTT port                        |
//! | 10     | 1      | device count                     |
//! | 11     | 1      | format version                   |

use std::fmt::Debug;

use bytemuck::{
    Pod,
    Zeroable,
};
use bytes::BufMut;
use chrono::{
    DateTime,
    Utc,
};

use crate::{
    DeviceRecord,
    DeviceTable,
    wire::{
        MQTT_PORT,
        SERIAL_NUMBER_LENGTH,
    },
};

/// Header length in bytes.
pub const HEADER_LENGTH: usize = 12;

/// Length of one device descriptor in bytes.
pub const DESCRIPTOR_LENGTH: usize = std::mem::size_of::<DeviceDescriptor>();

/// Topology format version.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TopologyVersion {
    /// The original layout without time sync. We never send it, but devices
    /// running older firmware might.
    Legacy,
    /// The layout described in the module docs.
    Current,
}

impl TopologyVersion {
    const LEGACY: u8 = 0;
    const CURRENT: u8 = 1;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
#[error("invalid topology version: {0}")]
pub struct InvalidTopologyVersion(pub u8);

impl TryFrom<u8> for TopologyVersion {
    type Error = InvalidTopologyVersion;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            Self::LEGACY => Ok(Self::Legacy),
            Self::CURRENT => Ok(Self::Current),
            _ => Err(InvalidTopologyVersion(value)),
        }
    }
}

impl From<TopologyVersion> for u8 {
    fn from(value: TopologyVersion) -> Self {
        match value {
            TopologyVersion::Legacy => TopologyVersion::LEGACY,
            TopologyVersion::Current => TopologyVersion::CURRENT,
        }
    }
}

/// Wall clock time as sent in the topology header.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Timestamp {
    pub seconds: u32,
    pub nanos: u32,
}

impl Timestamp {
    pub fn now() -> Self {
        Utc::now().into()
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(value: DateTime<Utc>) -> Self {
        // devices expect 32 bit seconds and only microsecond precision
        Self {
            seconds: value.timestamp() as u32,
            nanos: value.timestamp_subsec_micros() * 1000,
        }
    }
}

/// One entry of the device list in a topology message.
#[derive(Clone, Copy, Pod, Zeroable, PartialEq, Eq)]
#[repr(C)]
pub struct DeviceDescriptor {
    pub octet4: u8,
    pub octet3: u8,
    /// Set if the address was detected to be in use twice. The device is
    /// expected to pick another one.
    pub duplicate: u8,
    pub serial_number: [u8; SERIAL_NUMBER_LENGTH],
    pub reserved: u8,
}

impl From<&DeviceRecord> for DeviceDescriptor {
    fn from(value: &DeviceRecord) -> Self {
        Self {
            octet4: value.ip_suffix.octet4,
            octet3: value.ip_suffix.octet3,
            duplicate: 0,
            serial_number: value.serial_number.0,
            reserved: 0,
        }
    }
}

impl Debug for DeviceDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceDescriptor")
            .field("octet3", &self.octet3)
            .field("octet4", &self.octet4)
            .field("duplicate", &self.duplicate)
            .field(
                "serial_number",
                &String::from_utf8_lossy(&self.serial_number),
            )
            .finish()
    }
}

/// A topology broadcast.
///
/// This is built fresh from the [`DeviceTable`] for every broadcast.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TopologyMessage {
    pub timestamp: Timestamp,
    pub mqtt_port: u16,
    pub version: TopologyVersion,
    pub devices: Vec<DeviceDescriptor>,
}

impl TopologyMessage {
    pub fn from_table(table: &DeviceTable, timestamp: Timestamp, mqtt_port: u16) -> Self {
        Self {
            timestamp,
            mqtt_port,
            version: TopologyVersion::Current,
            devices: table.iter().map(|(_, record)| record.into()).collect(),
        }
    }

    pub fn encoded_len(&self) -> usize {
        HEADER_LENGTH + self.devices.len() * DESCRIPTOR_LENGTH
    }

    pub fn encode<B: BufMut>(&self, mut buffer: B) {
        // the table never holds more than 64 devices, so this always fits
        let device_count = u8::try_from(self.devices.len()).unwrap_or(u8::MAX);

        buffer.put_u32_le(self.timestamp.seconds);
        buffer.put_u32_le(self.timestamp.nanos);
        buffer.put_u16_le(self.mqtt_port);
        buffer.put_u8(device_count);
        buffer.put_u8(self.version.into());

        for device in self.devices.iter().take(device_count.into()) {
            buffer.put_slice(bytemuck::bytes_of(device));
        }
    }

    pub fn to_vec(&self) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(self.encoded_len());
        self.encode(&mut buffer);
        buffer
    }
}

impl Default for TopologyMessage {
    fn default() -> Self {
        Self {
            timestamp: Timestamp::default(),
            mqtt_port: MQTT_PORT,
            version: TopologyVersion::Current,
            devices: vec![],
        }
    }
}
