use std::{
    io::Write,
    os::fd::AsRawFd,
    path::{
        Path,
        PathBuf,
    },
};

use parking_lot::Mutex;
use serialport::{
    ClearBuffer,
    SerialPort as _,
    TTYPort,
};

use crate::{
    Error,
    sys::{
        cvt,
        iow,
    },
};

/// `REG_CURRENT_TASK` ioctl of the custom SLIP driver.
///
/// Must match the driver: `_IOW('a', 'a', int32_t *)`
const REG_CURRENT_TASK: u64 = iow(b'a', b'a', std::mem::size_of::<*const i32>());

/// Commands understood by the SLIP driver's `REG_CURRENT_TASK` ioctl.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DriverCommand {
    /// Register the calling thread to receive the frame boundary signal.
    RegisterTask,
    /// Stop the tty transmitter, so no SLIP traffic goes out.
    StopTransmit,
    /// Start the tty transmitter.
    StartTransmit,
}

impl DriverCommand {
    const REGISTER_TASK: i32 = 0;
    const STOP_TRANSMIT: i32 = 100;
    const START_TRANSMIT: i32 = 101;

    fn value(&self) -> i32 {
        match self {
            Self::RegisterTask => Self::REGISTER_TASK,
            Self::StopTransmit => Self::STOP_TRANSMIT,
            Self::StartTransmit => Self::START_TRANSMIT,
        }
    }
}

/// Serial line rates we know how to set.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BaudRate {
    B9600,
    B19200,
    B38400,
    B57600,
    B115200,
    B230400,
    B460800,
    B921600,
}

impl BaudRate {
    /// Rate used by legacy devices.
    pub const LEGACY: Self = Self::B9600;
}

impl TryFrom<u32> for BaudRate {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            9600 => Ok(Self::B9600),
            19200 => Ok(Self::B19200),
            38400 => Ok(Self::B38400),
            57600 => Ok(Self::B57600),
            115200 => Ok(Self::B115200),
            230400 => Ok(Self::B230400),
            460800 => Ok(Self::B460800),
            921600 => Ok(Self::B921600),
            _ => Err(Error::UnsupportedBaudRate(value)),
        }
    }
}

impl From<BaudRate> for u32 {
    fn from(value: BaudRate) -> Self {
        match value {
            BaudRate::B9600 => 9600,
            BaudRate::B19200 => 19200,
            BaudRate::B38400 => 38400,
            BaudRate::B57600 => 57600,
            BaudRate::B115200 => 115200,
            BaudRate::B230400 => 230400,
            BaudRate::B460800 => 460800,
            BaudRate::B921600 => 921600,
        }
    }
}

/// The tty the SLIP interface is attached to.
///
/// We never read or write data through this. The kernel's SLIP line
/// discipline does that. It's only used to set the line rate, wait for
/// transmissions to finish, and to talk to the driver.
#[derive(derive_more::Debug)]
pub struct SerialPort {
    #[debug(skip)]
    port: Mutex<TTYPort>,
    path: PathBuf,
}

impl SerialPort {
    /// Opens the tty and sets it to `baud_rate`.
    pub fn open(path: impl AsRef<Path>, baud_rate: BaudRate) -> Result<Self, Error> {
        let path = path.as_ref();
        let port = serialport::new(path.to_string_lossy(), baud_rate.into())
            .open_native()
            .map_err(|error| Error::port("open", error))?;
        tracing::debug!(path = %path.display(), ?baud_rate, "opened serial port");

        Ok(Self {
            port: Mutex::new(port),
            path: path.to_owned(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the current line rate in bits per second.
    pub fn raw_baud_rate(&self) -> Result<u32, Error> {
        self.port
            .lock()
            .baud_rate()
            .map_err(|error| Error::port("baud_rate", error))
    }

    /// Returns the current line rate.
    ///
    /// `None` if the port is set to a rate we don't have a [`BaudRate`] for.
    pub fn baud_rate(&self) -> Result<Option<BaudRate>, Error> {
        Ok(BaudRate::try_from(self.raw_baud_rate()?).ok())
    }

    pub(crate) fn set_raw_baud_rate(&self, baud_rate: u32) -> Result<(), Error> {
        self.port
            .lock()
            .set_baud_rate(baud_rate)
            .map_err(|error| Error::port("set_baud_rate", error))?;
        tracing::debug!(baud_rate, "set baud rate");
        Ok(())
    }

    pub fn set_baud_rate(&self, baud_rate: BaudRate) -> Result<(), Error> {
        self.set_raw_baud_rate(baud_rate.into())
    }

    /// Blocks until all queued output has been transmitted.
    pub fn drain(&self) -> Result<(), Error> {
        self.port
            .lock()
            .flush()
            .map_err(|error| Error::serial("flush", error))
    }

    /// Discards output that was queued but not transmitted.
    pub fn discard_output(&self) -> Result<(), Error> {
        self.port
            .lock()
            .clear(ClearBuffer::Output)
            .map_err(|error| Error::port("clear", error))
    }

    /// Drain, then discard whatever is left in the write buffer.
    pub fn settle(&self) -> Result<(), Error> {
        self.drain()?;
        self.discard_output()
    }

    /// Puts the tty in exclusive mode.
    pub fn set_exclusive(&self) -> Result<(), Error> {
        self.port
            .lock()
            .set_exclusive(true)
            .map_err(|error| Error::port("set_exclusive", error))
    }

    pub fn driver_control(&self, command: DriverCommand) -> Result<(), Error> {
        let value: i32 = command.value();
        let port = self.port.lock();
        let ret = unsafe {
            libc::ioctl(
                port.as_raw_fd(),
                REG_CURRENT_TASK as _,
                &value as *const i32,
            )
        };
        tracing::trace!(?command, ret, "REG_CURRENT_TASK");
        cvt(ret).map_err(|error| Error::serial("REG_CURRENT_TASK", error))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;
    use serialport::TTYPort;

    use crate::{
        BaudRate,
        DriverCommand,
        Error,
        SerialPort,
    };

    fn pseudo_terminal() -> (TTYPort, SerialPort) {
        let (master, slave) = TTYPort::pair().unwrap();
        let serial = SerialPort {
            port: Mutex::new(slave),
            path: "pty".into(),
        };
        (master, serial)
    }

    #[test]
    fn it_sets_and_reads_back_the_baud_rate() {
        let (_master, serial) = pseudo_terminal();
        serial.set_baud_rate(BaudRate::B9600).unwrap();
        assert_eq!(serial.baud_rate().unwrap(), Some(BaudRate::B9600));
        serial.set_raw_baud_rate(115200).unwrap();
        assert_eq!(serial.raw_baud_rate().unwrap(), 115200);
    }

    #[test]
    fn settle_returns_on_an_idle_line() {
        let (_master, serial) = pseudo_terminal();
        serial.settle().unwrap();
    }

    #[test]
    fn baud_rates_convert_both_ways() {
        for rate in [9600, 19200, 38400, 57600, 115200, 230400, 460800, 921600] {
            let baud_rate = BaudRate::try_from(rate).unwrap();
            assert_eq!(u32::from(baud_rate), rate);
        }
        assert!(matches!(
            BaudRate::try_from(1234),
            Err(Error::UnsupportedBaudRate(1234))
        ));
    }

    #[test]
    fn driver_commands_match_the_driver() {
        assert_eq!(DriverCommand::RegisterTask.value(), 0);
        assert_eq!(DriverCommand::StopTransmit.value(), 100);
        assert_eq!(DriverCommand::StartTransmit.value(), 101);
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn ioctl_number_matches_the_driver() {
        assert_eq!(super::REG_CURRENT_TASK, 0x4008_6161);
    }
}
