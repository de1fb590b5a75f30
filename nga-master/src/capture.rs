use std::{
    ffi::{
        c_int,
        c_void,
    },
    io,
    os::fd::{
        AsRawFd,
        FromRawFd,
        OwnedFd,
    },
    sync::Arc,
    thread::{
        self,
        JoinHandle,
    },
    time::Duration,
};

use tokio_util::sync::CancellationToken;

use crate::{
    Coordination,
    Discovery,
    Error,
    FilterProgram,
    sys::{
        cvt,
        cvt_size,
        interface_name,
        retry_interrupted,
    },
    wire::announce::Announce,
};

/// Reads time out after this long, so the idle counter and shutdown are
/// serviced on a quiet link.
pub const RECEIVE_TIMEOUT: Duration = Duration::from_micros(5_001_000);

const RECEIVE_BUFFER_SIZE: usize = 2048;

/// Pause after a failed read, so a broken socket doesn't spin.
const ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// `sll_pkttype` of frames we sent ourselves.
const PACKET_OUTGOING: u8 = 4;

/// A raw `AF_PACKET` socket bound to the SLIP interface.
#[derive(Debug)]
pub struct PacketSocket {
    fd: OwnedFd,
    interface: String,
    ifindex: c_int,
}

impl PacketSocket {
    fn new(interface: &str) -> Result<Self, Error> {
        let name = interface_name(interface).ok_or_else(|| {
            Error::InterfaceName {
                name: interface.to_owned(),
            }
        })?;

        let fd = cvt(unsafe {
            libc::socket(
                libc::AF_PACKET,
                libc::SOCK_RAW | libc::SOCK_CLOEXEC,
                eth_p_all().into(),
            )
        })
        .map_err(|error| Error::capture("socket", interface, error))?;
        // SAFETY: we just created this fd and nothing else owns it.
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        let ifindex = unsafe { libc::if_nametoindex(name.as_ptr()) };
        tracing::debug!(interface, ifindex, "if_nametoindex");
        if ifindex == 0 {
            return Err(Error::capture(
                "if_nametoindex",
                interface,
                io::Error::last_os_error(),
            ));
        }

        Ok(Self {
            fd,
            interface: interface.to_owned(),
            ifindex: ifindex as c_int,
        })
    }

    /// Opens the capture socket.
    ///
    /// Binds to `interface`, puts the interface into promiscuous mode,
    /// attaches `filter` and sets the receive timeout. Any failure here is
    /// fatal for the master.
    pub fn open(interface: &str, filter: FilterProgram) -> Result<Self, Error> {
        let socket = Self::new(interface)?;

        socket.bind()?;
        socket.set_promiscuous()?;
        socket.bind_to_device()?;
        socket.attach_filter(filter)?;
        socket.set_receive_timeout(RECEIVE_TIMEOUT)?;

        tracing::info!(interface, ?filter, "capture socket ready");
        Ok(socket)
    }

    /// Opens a socket that is only used to send raw frames on `interface`.
    pub fn open_sender(interface: &str) -> Result<Self, Error> {
        Self::new(interface)
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    fn link_address(&self) -> libc::sockaddr_ll {
        // SAFETY: sockaddr_ll is plain old data
        let mut address: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
        address.sll_family = libc::AF_PACKET as u16;
        address.sll_protocol = eth_p_all();
        address.sll_ifindex = self.ifindex;
        address
    }

    fn bind(&self) -> Result<(), Error> {
        let address = self.link_address();
        cvt(unsafe {
            libc::bind(
                self.fd.as_raw_fd(),
                &address as *const libc::sockaddr_ll as *const libc::sockaddr,
                size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        })
        .map_err(|error| Error::capture("bind", &self.interface, error))?;
        Ok(())
    }

    fn ifreq(&self) -> libc::ifreq {
        // SAFETY: ifreq is plain old data
        let mut ifreq: libc::ifreq = unsafe { std::mem::zeroed() };
        if let Some(name) = interface_name(&self.interface) {
            ifreq.ifr_name = name;
        }
        ifreq
    }

    fn set_promiscuous(&self) -> Result<(), Error> {
        let mut ifreq = self.ifreq();

        cvt(unsafe {
            libc::ioctl(
                self.fd.as_raw_fd(),
                libc::SIOCGIFFLAGS as _,
                &mut ifreq as *mut libc::ifreq,
            )
        })
        .map_err(|error| Error::capture("SIOCGIFFLAGS", &self.interface, error))?;

        // SAFETY: SIOCGIFFLAGS filled in the flags member
        unsafe {
            ifreq.ifr_ifru.ifru_flags |= libc::IFF_PROMISC as libc::c_short;
        }

        cvt(unsafe {
            libc::ioctl(
                self.fd.as_raw_fd(),
                libc::SIOCSIFFLAGS as _,
                &ifreq as *const libc::ifreq,
            )
        })
        .map_err(|error| Error::capture("SIOCSIFFLAGS", &self.interface, error))?;

        tracing::debug!(interface = %self.interface, "promiscuous mode on");
        Ok(())
    }

    fn setsockopt(
        &self,
        operation: &'static str,
        name: c_int,
        value: *const c_void,
        length: usize,
    ) -> Result<(), Error> {
        cvt(unsafe {
            libc::setsockopt(
                self.fd.as_raw_fd(),
                libc::SOL_SOCKET,
                name,
                value,
                length as libc::socklen_t,
            )
        })
        .map_err(|error| Error::capture(operation, &self.interface, error))?;
        Ok(())
    }

    fn bind_to_device(&self) -> Result<(), Error> {
        let ifreq = self.ifreq();
        // name including the nul terminator
        let length = self.interface.len() + 1;
        self.setsockopt(
            "SO_BINDTODEVICE",
            libc::SO_BINDTODEVICE,
            ifreq.ifr_name.as_ptr().cast(),
            length,
        )
    }

    fn attach_filter(&self, filter: FilterProgram) -> Result<(), Error> {
        let instructions = filter.instructions();
        let program = libc::sock_fprog {
            len: instructions.len() as u16,
            // the kernel copies the program and never writes to it
            filter: instructions.as_ptr().cast_mut(),
        };
        self.setsockopt(
            "SO_ATTACH_FILTER",
            libc::SO_ATTACH_FILTER,
            (&program as *const libc::sock_fprog).cast(),
            size_of::<libc::sock_fprog>(),
        )
    }

    fn set_receive_timeout(&self, timeout: Duration) -> Result<(), Error> {
        let timeval = libc::timeval {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_usec: timeout.subsec_micros() as libc::suseconds_t,
        };
        self.setsockopt(
            "SO_RCVTIMEO",
            libc::SO_RCVTIMEO,
            (&timeval as *const libc::timeval).cast(),
            size_of::<libc::timeval>(),
        )
    }

    /// Receives one frame.
    ///
    /// Returns `None` if the receive timeout expired.
    pub fn recv(&self, buffer: &mut [u8]) -> io::Result<Option<Received>> {
        // SAFETY: sockaddr_ll is plain old data
        let mut address: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
        let mut address_length = size_of::<libc::sockaddr_ll>() as libc::socklen_t;

        let result = retry_interrupted(|| {
            cvt_size(unsafe {
                libc::recvfrom(
                    self.fd.as_raw_fd(),
                    buffer.as_mut_ptr().cast(),
                    buffer.len(),
                    0,
                    (&mut address as *mut libc::sockaddr_ll).cast(),
                    &mut address_length,
                )
            })
        });

        match result {
            Ok(0) => Ok(None),
            Ok(length) => {
                Ok(Some(Received {
                    length,
                    outgoing: address.sll_pkttype == PACKET_OUTGOING,
                }))
            }
            Err(error)
                if matches!(
                    error.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                ) =>
            {
                Ok(None)
            }
            Err(error) => Err(error),
        }
    }

    /// Sends a raw frame out of the interface.
    pub fn send(&self, frame: &[u8]) -> Result<(), Error> {
        let address = self.link_address();
        let sent = cvt_size(unsafe {
            libc::sendto(
                self.fd.as_raw_fd(),
                frame.as_ptr().cast(),
                frame.len(),
                0,
                (&address as *const libc::sockaddr_ll).cast(),
                size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        })?;
        tracing::trace!(interface = %self.interface, sent, "sendto");

        if sent != frame.len() {
            return Err(Error::ShortWrite {
                sent,
                expected: frame.len(),
            });
        }
        Ok(())
    }
}

fn eth_p_all() -> u16 {
    (libc::ETH_P_ALL as u16).to_be()
}

/// Result of a successful [`PacketSocket::recv`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Received {
    pub length: usize,
    /// We sent this frame ourselves.
    pub outgoing: bool,
}

/// What the capture loop made of a frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameEvent {
    /// Our own transmission. Ignored.
    Outgoing,
    /// Any other inbound frame. Marks the end of a response.
    Inbound,
    /// An inbound device announce, and what happened to it.
    Announce(Discovery),
}

/// Applies one captured frame to the shared state.
pub(crate) fn handle_frame(shared: &Coordination, received: Received, frame: &[u8]) -> FrameEvent {
    if received.outgoing {
        tracing::trace!(length = frame.len(), "outgoing frame");
        return FrameEvent::Outgoing;
    }

    shared.inbound_frame();
    shared.reset_idle_reads();

    if frame.len() >= 4 {
        let ip_length = u16::from_be_bytes([frame[2], frame[3]]);
        tracing::debug!(length = frame.len(), ip_length, "inbound frame");
    }

    match Announce::decode(frame) {
        Ok(announce) => {
            let discovery = shared.post_announce(announce);
            match discovery {
                Discovery::Posted => {
                    tracing::debug!(
                        address = %announce.ip_suffix,
                        serial_number = %announce.serial_number,
                        "announce"
                    );
                }
                _ => {
                    tracing::warn!(
                        address = %announce.ip_suffix,
                        ?discovery,
                        "mailbox busy. dropping announce"
                    );
                }
            }
            FrameEvent::Announce(discovery)
        }
        Err(_) => FrameEvent::Inbound,
    }
}

/// Spawns the capture thread.
///
/// The thread runs until `shutdown` is cancelled, which is checked after every
/// read. Failed reads count as idle reads.
pub fn spawn_capture_thread(
    socket: PacketSocket,
    shared: Arc<Coordination>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    thread::spawn(move || {
        capture_thread(socket, shared, shutdown);
    })
}

fn capture_thread(socket: PacketSocket, shared: Arc<Coordination>, shutdown: CancellationToken) {
    let _guard = tracing::debug_span!("capture thread", interface = %socket.interface).entered();
    tracing::debug!("capture thread spawned");

    let mut buffer = [0u8; RECEIVE_BUFFER_SIZE];

    while !shutdown.is_cancelled() {
        match socket.recv(&mut buffer) {
            Ok(Some(received)) => {
                let frame = &buffer[..received.length.min(buffer.len())];
                handle_frame(&shared, received, frame);
            }
            Ok(None) => {
                let idle_reads = shared.record_idle_read();
                tracing::trace!(idle_reads, "capture idle");
            }
            Err(error) => {
                let idle_reads = shared.record_idle_read();
                tracing::error!(?error, idle_reads, "capture socket error");
                thread::sleep(ERROR_BACKOFF);
            }
        }
    }

    tracing::debug!("capture thread exiting");
}

#[cfg(test)]
mod tests {
    use std::{
        fs::File,
        os::fd::OwnedFd,
        sync::Arc,
        thread,
        time::Duration,
    };

    use tokio_util::sync::CancellationToken;

    use crate::{
        Coordination,
        Discovery,
        FrameEvent,
        IpSuffix,
        SerialNumber,
        capture::{
            PacketSocket,
            Received,
            handle_frame,
            spawn_capture_thread,
        },
        wire::announce::{
            ANNOUNCE_LENGTH,
            Announce,
        },
    };

    const INBOUND: Received = Received {
        length: 0,
        outgoing: false,
    };

    const OUTGOING: Received = Received {
        length: 0,
        outgoing: true,
    };

    fn announce_frame(octet3: u8, octet4: u8) -> [u8; ANNOUNCE_LENGTH] {
        let mut frame = [0; ANNOUNCE_LENGTH];
        frame[0] = 0x45;
        frame[3] = ANNOUNCE_LENGTH as u8;
        Announce {
            ip_suffix: IpSuffix::new(octet3, octet4),
            serial_number: SerialNumber::from_str_padded("SN0001"),
        }
        .encode(&mut frame);
        frame
    }

    #[test]
    fn outgoing_frames_are_ignored() {
        let shared = Coordination::new();
        let _guard = shared.arm();
        let event = handle_frame(&shared, OUTGOING, &announce_frame(10, 20));
        assert_eq!(event, FrameEvent::Outgoing);
        assert!(!shared.poll_flags().frame_ended);
        assert!(!shared.is_announce_pending());
    }

    #[test]
    fn inbound_frames_end_a_response() {
        let shared = Coordination::new();
        let guard = shared.arm();
        shared.record_idle_read();
        let event = handle_frame(&shared, INBOUND, &[0x45, 0, 0, 32, 0, 0]);
        assert_eq!(event, FrameEvent::Inbound);
        assert!(guard.flags().frame_ended);
        assert!(!guard.flags().response_started);
        assert_eq!(shared.idle_reads(), 0);
    }

    #[test]
    fn it_posts_announces() {
        let shared = Coordination::new();
        let event = handle_frame(&shared, INBOUND, &announce_frame(10, 20));
        assert_eq!(event, FrameEvent::Announce(Discovery::Posted));
        let announce = shared.take_announce().unwrap();
        assert_eq!(announce.ip_suffix, IpSuffix::new(10, 20));
    }

    #[test]
    fn second_announce_is_dropped_while_mailbox_is_pending() {
        let shared = Coordination::new();
        let frame = announce_frame(10, 20);
        assert_eq!(
            handle_frame(&shared, INBOUND, &frame),
            FrameEvent::Announce(Discovery::Posted)
        );
        assert_eq!(
            handle_frame(&shared, INBOUND, &frame),
            FrameEvent::Announce(Discovery::MailboxBusy)
        );
        assert!(shared.take_announce().is_some());
        assert!(shared.take_announce().is_none());
    }

    #[test]
    fn frames_without_marker_are_not_announces() {
        let shared = Coordination::new();
        let mut frame = announce_frame(10, 20);
        frame[28] = 0;
        assert_eq!(handle_frame(&shared, INBOUND, &frame), FrameEvent::Inbound);
        assert!(!shared.is_announce_pending());
    }

    #[test]
    fn capture_thread_survives_receive_errors() {
        // recvfrom on a file that isn't a socket always fails with ENOTSOCK
        let socket = PacketSocket {
            fd: OwnedFd::from(File::open("/dev/null").unwrap()),
            interface: "null".to_owned(),
            ifindex: 0,
        };
        let shared = Arc::new(Coordination::new());
        let shutdown = CancellationToken::new();

        let thread = spawn_capture_thread(socket, shared.clone(), shutdown.clone());
        thread::sleep(Duration::from_millis(350));

        assert!(!thread.is_finished());
        assert!(shared.idle_reads() >= 2);

        shutdown.cancel();
        thread.join().unwrap();
    }
}
