use std::{
    fmt::{
        Debug,
        Display,
    },
    net::Ipv4Addr,
};

use crate::wire::{
    LINK_LOCAL_PREFIX,
    SERIAL_NUMBER_LENGTH,
};

/// Maximum number of devices the master keeps track of.
pub const MAX_DEVICES: usize = 64;

/// Last two octets of a device's `169.254.x.y` address.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IpSuffix {
    pub octet3: u8,
    pub octet4: u8,
}

impl IpSuffix {
    pub const fn new(octet3: u8, octet4: u8) -> Self {
        Self { octet3, octet4 }
    }

    pub fn address(&self) -> Ipv4Addr {
        let [a, b] = LINK_LOCAL_PREFIX;
        Ipv4Addr::new(a, b, self.octet3, self.octet4)
    }
}

impl Display for IpSuffix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.address())
    }
}

impl Debug for IpSuffix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "IpSuffix({}.{})", self.octet3, self.octet4)
    }
}

/// 18 byte serial number of a device.
///
/// Devices pad shorter serial numbers with zeros.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SerialNumber(pub [u8; SERIAL_NUMBER_LENGTH]);

impl SerialNumber {
    /// Creates a serial number from a string, truncating or zero-padding it
    /// to 18 bytes.
    pub fn from_str_padded(s: &str) -> Self {
        let mut data = [0; SERIAL_NUMBER_LENGTH];
        let n = s.len().min(SERIAL_NUMBER_LENGTH);
        data[..n].copy_from_slice(&s.as_bytes()[..n]);
        Self(data)
    }

    /// The serial number without trailing padding.
    pub fn trimmed(&self) -> &[u8] {
        let end = self
            .0
            .iter()
            .rposition(|byte| *byte != 0)
            .map_or(0, |i| i + 1);
        &self.0[..end]
    }
}

impl Display for SerialNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(self.trimmed()))
    }
}

impl Debug for SerialNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SerialNumber({:?})", String::from_utf8_lossy(self.trimmed()))
    }
}

/// A discovered end device.
///
/// Records are never changed or removed once created.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceRecord {
    pub ip_suffix: IpSuffix,
    pub serial_number: SerialNumber,
}

/// What happened to a device announce on its way into the table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Discovery {
    /// The announce was placed in the discovery mailbox.
    Posted,
    /// The mailbox was still occupied, the announce was dropped.
    MailboxBusy,
    /// A new record was created in `slot`.
    Accepted { slot: usize },
    /// A record with this address already exists in `slot`.
    Duplicate { slot: usize },
    /// All slots are in use, the announce was dropped.
    CapacityExhausted,
}

/// Fixed capacity, append-only table of known devices.
///
/// Iteration order is slot order, which is discovery order.
#[derive(Clone)]
pub struct DeviceTable {
    slots: [Option<DeviceRecord>; MAX_DEVICES],
    len: usize,
}

impl Default for DeviceTable {
    fn default() -> Self {
        Self {
            slots: [None; MAX_DEVICES],
            len: 0,
        }
    }
}

impl DeviceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a device, unless one with the same address already exists or
    /// the table is full.
    pub fn insert(&mut self, record: DeviceRecord) -> Discovery {
        if let Some(slot) = self.find(record.ip_suffix) {
            return Discovery::Duplicate { slot };
        }

        let Some((slot, free)) = self
            .slots
            .iter_mut()
            .enumerate()
            .find(|(_, slot)| slot.is_none())
        else {
            return Discovery::CapacityExhausted;
        };

        *free = Some(record);
        self.len += 1;
        Discovery::Accepted { slot }
    }

    /// Returns the slot of the device with this address.
    pub fn find(&self, ip_suffix: IpSuffix) -> Option<usize> {
        self.slots.iter().position(|slot| {
            slot.as_ref()
                .is_some_and(|record| record.ip_suffix == ip_suffix)
        })
    }

    pub fn get(&self, slot: usize) -> Option<&DeviceRecord> {
        self.slots.get(slot)?.as_ref()
    }

    /// Devices in use, with their slot index.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &DeviceRecord)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(slot, record)| Some((slot, record.as_ref()?)))
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == MAX_DEVICES
    }
}

impl Debug for DeviceTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}
