//! Frame boundary notifications from the SLIP driver.
//!
//! The driver raises a real-time signal whenever it sees a SLIP frame
//! delimiter on the wire, and puts an integer in the signal's payload: `0` for
//! the start of a frame, anything else for its end. The signal goes to
//! whichever thread registered itself with [`DriverCommand::RegisterTask`].
//!
//! Instead of a signal handler, a dedicated thread waits for the signal with
//! `sigtimedwait`. For this to work the signal must be blocked in every thread
//! of the process, so [`block_frame_signal`] has to be called before any other
//! thread (including the tokio runtime) is started.

use std::{
    ffi::c_int,
    io,
    sync::{
        Arc,
        mpsc,
    },
    thread::{
        self,
        JoinHandle,
    },
};

use tokio_util::sync::CancellationToken;

use crate::{
    Coordination,
    DriverCommand,
    Error,
    SerialPort,
};

/// Default frame boundary signal (`SIGRTMIN + 10` with glibc).
pub const DEFAULT_FRAME_SIGNAL: c_int = 44;

/// How often the notifier thread checks whether it should shut down.
const WAIT_TIMEOUT: libc::timespec = libc::timespec {
    tv_sec: 1,
    tv_nsec: 0,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameBoundary {
    /// The driver saw the start of a frame.
    Start,
    /// The driver saw the end of a frame.
    End,
}

impl FrameBoundary {
    pub fn from_payload(payload: i32) -> Self {
        if payload == 0 { Self::Start } else { Self::End }
    }
}

fn signal_set(signal: c_int) -> libc::sigset_t {
    // SAFETY: sigset_t is plain old data, and sigemptyset initializes it anyway
    let mut set: libc::sigset_t = unsafe { std::mem::zeroed() };
    unsafe {
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, signal);
    }
    set
}

fn check_realtime_signal(signal: c_int) -> Result<(), Error> {
    let min = libc::SIGRTMIN();
    let max = libc::SIGRTMAX();
    if (min..=max).contains(&signal) {
        Ok(())
    }
    else {
        Err(Error::NotRealtimeSignal { signal, min, max })
    }
}

/// Blocks the frame boundary signal in the calling thread.
///
/// Threads inherit the signal mask, so calling this from `main` before
/// spawning anything blocks it process-wide.
pub fn block_frame_signal(signal: c_int) -> Result<(), Error> {
    check_realtime_signal(signal)?;

    let set = signal_set(signal);
    let ret = unsafe { libc::pthread_sigmask(libc::SIG_BLOCK, &set, std::ptr::null_mut()) };
    tracing::debug!(signal, ret, "pthread_sigmask");
    if ret != 0 {
        return Err(io::Error::from_raw_os_error(ret).into());
    }

    Ok(())
}

/// Extracts the `sival_int` member of a `sigval`.
fn payload(value: libc::sigval) -> i32 {
    let raw = value.sival_ptr as usize;
    // the int overlaps the high half of the pointer on 64 bit big-endian
    #[cfg(all(target_endian = "big", target_pointer_width = "64"))]
    let raw = raw >> 32;
    raw as u32 as i32
}

/// Spawns the notifier thread.
///
/// The thread registers itself with the driver through `serial`, then applies
/// every frame boundary signal to `shared` until `shutdown` is cancelled.
/// Returns once the registration is done, or with the error if it failed.
pub fn spawn_notifier_thread(
    signal: c_int,
    serial: Arc<SerialPort>,
    shared: Arc<Coordination>,
    shutdown: CancellationToken,
) -> Result<JoinHandle<()>, Error> {
    check_realtime_signal(signal)?;

    let (registered_sender, registered_receiver) = mpsc::sync_channel(1);

    let join_handle = thread::spawn(move || {
        let _guard = tracing::debug_span!("notifier thread", signal).entered();

        let result = serial.driver_control(DriverCommand::RegisterTask);
        let registered = result.is_ok();
        let _ = registered_sender.send(result);

        if registered {
            notifier_thread(signal, &shared, &shutdown);
        }
    });

    registered_receiver
        .recv()
        .map_err(|_| Error::BlockingTaskDead)??;

    tracing::debug!(signal, "registered for frame boundary signals");
    Ok(join_handle)
}

fn notifier_thread(signal: c_int, shared: &Coordination, shutdown: &CancellationToken) {
    tracing::debug!("notifier thread spawned");

    let set = signal_set(signal);

    while !shutdown.is_cancelled() {
        // SAFETY: siginfo_t is plain old data
        let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
        let ret = unsafe { libc::sigtimedwait(&set, &mut info, &WAIT_TIMEOUT) };

        if ret == -1 {
            let error = io::Error::last_os_error();
            match error.raw_os_error() {
                Some(libc::EAGAIN) | Some(libc::EINTR) => continue,
                _ => {
                    tracing::error!(?error, "sigtimedwait failed");
                    break;
                }
            }
        }

        let boundary = FrameBoundary::from_payload(payload(unsafe { info.si_value() }));
        let applied = shared.frame_boundary(boundary);
        tracing::trace!(?boundary, applied, "frame boundary");
    }

    tracing::debug!("notifier thread exiting");
}

#[cfg(test)]
mod tests {
    use std::{
        sync::Arc,
        thread,
        time::{
            Duration,
            Instant,
        },
    };

    use tokio_util::sync::CancellationToken;

    use crate::{
        Coordination,
        Error,
        FrameBoundary,
        block_frame_signal,
        notifier::{
            notifier_thread,
            payload,
        },
    };

    #[test]
    fn zero_payload_is_frame_start() {
        assert_eq!(FrameBoundary::from_payload(0), FrameBoundary::Start);
        assert_eq!(FrameBoundary::from_payload(1), FrameBoundary::End);
        assert_eq!(FrameBoundary::from_payload(-1), FrameBoundary::End);
    }

    #[test]
    fn only_realtime_signals_are_accepted() {
        assert!(matches!(
            block_frame_signal(libc::SIGINT),
            Err(Error::NotRealtimeSignal {
                signal: libc::SIGINT,
                ..
            })
        ));
    }

    #[cfg(target_endian = "little")]
    #[test]
    fn payload_is_the_int_member() {
        let value = libc::sigval {
            sival_ptr: 7usize as *mut libc::c_void,
        };
        assert_eq!(payload(value), 7);
    }

    #[cfg(all(target_os = "linux", target_env = "gnu", target_endian = "little"))]
    #[test]
    fn queued_signals_mark_response_start_and_end() {
        use std::os::unix::thread::JoinHandleExt;

        let signal = libc::SIGRTMIN() + 10;
        // the notifier thread inherits the mask from this one
        block_frame_signal(signal).unwrap();

        let shared = Arc::new(Coordination::new());
        let shutdown = CancellationToken::new();
        let guard = shared.arm();

        let thread = thread::spawn({
            let shared = shared.clone();
            let shutdown = shutdown.clone();
            move || notifier_thread(signal, &shared, &shutdown)
        });

        for payload in [0usize, 5] {
            let value = libc::sigval {
                sival_ptr: payload as *mut libc::c_void,
            };
            let ret = unsafe { libc::pthread_sigqueue(thread.as_pthread_t(), signal, value) };
            assert_eq!(ret, 0);
        }

        let deadline = Instant::now() + Duration::from_secs(2);
        while !guard.flags().is_complete() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(guard.flags().response_started);
        assert!(guard.flags().frame_ended);

        drop(guard);
        shutdown.cancel();
        thread.join().unwrap();
    }
}
