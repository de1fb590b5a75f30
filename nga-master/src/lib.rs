//! # NGA field-bus master
//!
//! Discovery and polling engine for NGA end devices attached through a SLIP
//! serial link.
//!
//! The master never gets a direct reply to anything it sends. Requests leave
//! as UDP datagrams routed over the SLIP interface, and the answers are
//! observed out-of-band:
//!
//! - the [capture thread][spawn_capture_thread] reads every frame crossing
//!   the SLIP interface from a raw packet socket. It reports device announce
//!   frames and marks the end of inbound frames.
//! - the [notifier thread][spawn_notifier_thread] waits for the real-time
//!   signal the SLIP driver raises on frame delimiters, and marks response
//!   start and end.
//! - the [`Poller`] owns the device table. It broadcasts the topology message
//!   and polls each known device in turn, waiting on the flags the other two
//!   threads set.
//!
//! All three share one [`Coordination`] through an [`Arc`][std::sync::Arc].
//! Every flag in it has exactly one writer, so no locks are needed except for
//! the single-slot discovery mailbox.

mod capture;
mod config;
mod devices;
mod filter;
mod legacy;
mod link;
mod notifier;
mod poller;
mod serial;
mod shared;
mod sys;
pub mod wire;

pub use crate::{
    capture::{
        FrameEvent,
        PacketSocket,
        Received,
        spawn_capture_thread,
    },
    config::{
        LinkConfig,
        PollerConfig,
    },
    devices::{
        DeviceRecord,
        DeviceTable,
        Discovery,
        IpSuffix,
        MAX_DEVICES,
        SerialNumber,
    },
    filter::FilterProgram,
    link::{
        Link,
        SlipLink,
    },
    notifier::{
        FrameBoundary,
        block_frame_signal,
        spawn_notifier_thread,
    },
    poller::{
        PollOutcome,
        Poller,
        RoundReport,
    },
    serial::{
        BaudRate,
        DriverCommand,
        SerialPort,
    },
    shared::{
        Coordination,
        PollFlags,
        PollGuard,
    },
};

/// Errors returned by the master
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("capture setup failed: {operation} on {interface}")]
    Capture {
        operation: &'static str,
        interface: String,
        #[source]
        source: std::io::Error,
    },

    #[error("serial port error: {operation}")]
    Serial {
        operation: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("serial port error: {operation}")]
    Port {
        operation: &'static str,
        #[source]
        source: serialport::Error,
    },

    #[error("short write: sent {sent} of {expected} bytes")]
    ShortWrite { sent: usize, expected: usize },

    #[error("invalid interface name: {name:?}")]
    InterfaceName { name: String },

    #[error("signal {signal} is not a real-time signal ({min}..={max})")]
    NotRealtimeSignal { signal: i32, min: i32, max: i32 },

    #[error("unsupported baud rate: {0}")]
    UnsupportedBaudRate(u32),

    #[error("blocking task died unexpectedly")]
    BlockingTaskDead,

    #[error("io error")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn capture(
        operation: &'static str,
        interface: &str,
        source: std::io::Error,
    ) -> Self {
        Self::Capture {
            operation,
            interface: interface.to_owned(),
            source,
        }
    }

    pub(crate) fn serial(operation: &'static str, source: std::io::Error) -> Self {
        Self::Serial { operation, source }
    }

    pub(crate) fn port(operation: &'static str, source: serialport::Error) -> Self {
        Self::Port { operation, source }
    }
}
