//! Poll for devices that only speak the old 9600 baud protocol.
//!
//! This temporarily takes over the serial line: it switches to 9600 baud,
//! sends the [legacy poll frame][LEGACY_POLL_FRAME] as a raw frame on the
//! SLIP interface, gives devices a moment to answer, and switches back. It
//! must never run while a high speed poll is in flight.

use std::{
    thread,
    time::Duration,
};

use crate::{
    BaudRate,
    DriverCommand,
    Error,
    PacketSocket,
    SerialPort,
    wire::legacy::{
        LEGACY_POLL_FRAME,
        encode_legacy_poll,
    },
};

/// How long we keep the line at 9600 baud after sending, so devices can answer.
pub const LEGACY_RECEIVE_WINDOW: Duration = Duration::from_millis(100);

/// What the legacy poll needs from the serial line.
pub(crate) trait LegacyLine {
    type Saved;

    /// Remembers the current rate, then switches to `baud_rate`.
    fn save_and_switch(&self, baud_rate: BaudRate) -> Result<Self::Saved, Error>;

    fn restore(&self, saved: &Self::Saved) -> Result<(), Error>;

    fn driver_control(&self, command: DriverCommand) -> Result<(), Error>;

    fn send_frame(&self, frame: &[u8]) -> Result<(), Error>;

    /// Waits for output to drain and discards what's left.
    fn settle(&self) -> Result<(), Error>;
}

/// The real serial port, with a raw socket on the SLIP interface to send the
/// frame through.
pub(crate) struct SerialLine<'a> {
    pub serial: &'a SerialPort,
    pub sender: &'a PacketSocket,
}

impl LegacyLine for SerialLine<'_> {
    /// The line rate in bits per second, which need not be a [`BaudRate`].
    type Saved = u32;

    fn save_and_switch(&self, baud_rate: BaudRate) -> Result<Self::Saved, Error> {
        let saved = self.serial.raw_baud_rate()?;
        self.serial.set_baud_rate(baud_rate)?;
        Ok(saved)
    }

    fn restore(&self, saved: &Self::Saved) -> Result<(), Error> {
        self.serial.set_raw_baud_rate(*saved)
    }

    fn driver_control(&self, command: DriverCommand) -> Result<(), Error> {
        self.serial.driver_control(command)
    }

    fn send_frame(&self, frame: &[u8]) -> Result<(), Error> {
        self.sender.send(frame)
    }

    fn settle(&self) -> Result<(), Error> {
        self.serial.settle()
    }
}

/// Restores the saved baud rate when dropped.
struct RestoreOnDrop<'a, L: LegacyLine> {
    line: &'a L,
    saved: L::Saved,
}

impl<L: LegacyLine> Drop for RestoreOnDrop<'_, L> {
    fn drop(&mut self) {
        if let Err(error) = self.line.restore(&self.saved) {
            tracing::error!(?error, "failed to restore the baud rate");
        }
    }
}

/// Runs one legacy poll. Blocks for at least [`LEGACY_RECEIVE_WINDOW`].
pub(crate) fn legacy_poll<L: LegacyLine>(line: &L) -> Result<(), Error> {
    let saved = line.save_and_switch(BaudRate::LEGACY)?;
    let _restore = RestoreOnDrop { line, saved };

    let mut frame = Vec::with_capacity(LEGACY_POLL_FRAME.len());
    encode_legacy_poll(&mut frame);

    line.driver_control(DriverCommand::StartTransmit)?;
    let sent = line.send_frame(&frame);
    // sending starts the transmitter internally, stop it again either way
    let stopped = line.driver_control(DriverCommand::StopTransmit);
    sent?;
    stopped?;

    line.settle()?;
    thread::sleep(LEGACY_RECEIVE_WINDOW);

    tracing::trace!("legacy poll sent");
    Ok(())
}

/// Runs a legacy poll on the serial port.
pub(crate) fn legacy_poll_serial(serial: &SerialPort, sender: &PacketSocket) -> Result<(), Error> {
    serial.set_exclusive()?;
    legacy_poll(&SerialLine { serial, sender })
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use crate::{
        BaudRate,
        DriverCommand,
        Error,
        legacy::{
            LegacyLine,
            legacy_poll,
        },
        wire::legacy::LEGACY_POLL_FRAME,
    };

    #[derive(Debug, PartialEq, Eq)]
    enum Step {
        Switch(BaudRate),
        Restore(BaudRate),
        Driver(DriverCommand),
        Send(Vec<u8>),
        Settle,
    }

    #[derive(Default)]
    struct RecordingLine {
        steps: RefCell<Vec<Step>>,
        fail_send: bool,
    }

    impl LegacyLine for RecordingLine {
        type Saved = BaudRate;

        fn save_and_switch(&self, baud_rate: BaudRate) -> Result<Self::Saved, Error> {
            self.steps.borrow_mut().push(Step::Switch(baud_rate));
            Ok(BaudRate::B115200)
        }

        fn restore(&self, saved: &Self::Saved) -> Result<(), Error> {
            self.steps.borrow_mut().push(Step::Restore(*saved));
            Ok(())
        }

        fn driver_control(&self, command: DriverCommand) -> Result<(), Error> {
            self.steps.borrow_mut().push(Step::Driver(command));
            Ok(())
        }

        fn send_frame(&self, frame: &[u8]) -> Result<(), Error> {
            self.steps.borrow_mut().push(Step::Send(frame.to_vec()));
            if self.fail_send {
                Err(Error::ShortWrite {
                    sent: 3,
                    expected: frame.len(),
                })
            }
            else {
                Ok(())
            }
        }

        fn settle(&self) -> Result<(), Error> {
            self.steps.borrow_mut().push(Step::Settle);
            Ok(())
        }
    }

    #[test]
    fn it_switches_to_9600_and_back() {
        let line = RecordingLine::default();
        legacy_poll(&line).unwrap();
        assert_eq!(
            line.steps.into_inner(),
            [
                Step::Switch(BaudRate::B9600),
                Step::Driver(DriverCommand::StartTransmit),
                Step::Send(LEGACY_POLL_FRAME.to_vec()),
                Step::Driver(DriverCommand::StopTransmit),
                Step::Settle,
                Step::Restore(BaudRate::B115200),
            ]
        );
    }

    #[test]
    fn it_restores_the_baud_rate_after_a_failed_send() {
        let line = RecordingLine {
            fail_send: true,
            ..Default::default()
        };
        assert!(matches!(
            legacy_poll(&line),
            Err(Error::ShortWrite { sent: 3, .. })
        ));
        assert_eq!(
            line.steps.into_inner(),
            [
                Step::Switch(BaudRate::B9600),
                Step::Driver(DriverCommand::StartTransmit),
                Step::Send(LEGACY_POLL_FRAME.to_vec()),
                Step::Driver(DriverCommand::StopTransmit),
                Step::Restore(BaudRate::B115200),
            ]
        );
    }
}
