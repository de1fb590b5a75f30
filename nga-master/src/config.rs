use std::{
    ffi::c_int,
    net::{
        Ipv4Addr,
        SocketAddr,
        SocketAddrV4,
    },
    path::PathBuf,
    time::Duration,
};

use crate::{
    BaudRate,
    FilterProgram,
    notifier::DEFAULT_FRAME_SIGNAL,
    wire::{
        BROADCAST_PORT,
        MQTT_PORT,
    },
};

/// Timing and protocol parameters of the [`Poller`][crate::Poller].
#[derive(Clone, Debug)]
pub struct PollerConfig {
    /// A topology message is broadcast once this much time passed since the
    /// last one.
    pub topology_interval: Duration,

    /// Pause after a topology broadcast, before polling devices.
    pub settle_delay: Duration,

    /// How long to wait for a device to start responding.
    pub idle_poll: Duration,

    /// How long to wait for a response to end, measured from the poll, once it
    /// started.
    pub max_response: Duration,

    /// MQTT port advertised in the topology message.
    pub mqtt_port: u16,

    /// Run the legacy 9600 baud poll after every round.
    pub legacy_poll: bool,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            topology_interval: Duration::from_secs(4),
            settle_delay: Duration::from_millis(500),
            idle_poll: Duration::from_millis(150),
            max_response: Duration::from_millis(600),
            mqtt_port: MQTT_PORT,
            legacy_poll: false,
        }
    }
}

/// Where the SLIP link is and how to talk to it.
#[derive(Clone, Debug)]
pub struct LinkConfig {
    /// Name of the SLIP network interface.
    pub interface: String,

    /// tty the SLIP interface is attached to.
    pub serial_port: PathBuf,

    pub baud_rate: BaudRate,

    /// Destination of topology broadcasts and device polls.
    pub broadcast: SocketAddr,

    /// Real-time signal the driver raises on frame boundaries.
    pub frame_signal: c_int,

    pub filter: FilterProgram,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            interface: "sl0".to_owned(),
            serial_port: "/dev/ttyUSB0".into(),
            baud_rate: BaudRate::B115200,
            broadcast: SocketAddrV4::new(Ipv4Addr::new(169, 254, 255, 255), BROADCAST_PORT).into(),
            frame_signal: DEFAULT_FRAME_SIGNAL,
            filter: FilterProgram::PassAll,
        }
    }
}
