use std::sync::atomic::{
    AtomicBool,
    AtomicU64,
    Ordering,
};

use parking_lot::Mutex;
use tokio::sync::{
    Notify,
    futures::Notified,
};

use crate::{
    Discovery,
    FrameBoundary,
    wire::announce::Announce,
};

/// State shared between the capture thread, the notifier thread and the
/// poller.
///
/// Every field has a single writer (and the poller as the only one clearing
/// the response flags), so plain atomics are enough:
///
/// | field              | set by                  | cleared by |
/// |--------------------|-------------------------|------------|
/// | `response_started` | notifier                | poller     |
/// | `frame_ended`      | notifier, capture       | poller     |
/// | `poll_armed`       | poller                  | poller     |
/// | `mailbox`          | capture (if empty)      | poller     |
///
/// The response flags only mean something while a poll is armed. Arming
/// clears them.
#[derive(Debug, Default)]
pub struct Coordination {
    response_started: AtomicBool,
    frame_ended: AtomicBool,
    poll_armed: AtomicBool,

    /// single slot discovery mailbox
    mailbox: Mutex<Option<Announce>>,

    /// number of capture reads that timed out without data. diagnostic only.
    idle_reads: AtomicU64,

    /// notified whenever one of the response flags is set
    changed: Notify,
}

impl Coordination {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms the response flags for one device poll.
    ///
    /// Stale flags from a previous poll are cleared before arming. The poll
    /// is disarmed when the returned guard is dropped.
    pub fn arm(&self) -> PollGuard<'_> {
        self.response_started.store(false, Ordering::Release);
        self.frame_ended.store(false, Ordering::Release);
        self.poll_armed.store(true, Ordering::Release);
        PollGuard { shared: self }
    }

    pub fn is_armed(&self) -> bool {
        self.poll_armed.load(Ordering::Acquire)
    }

    pub fn poll_flags(&self) -> PollFlags {
        PollFlags {
            response_started: self.response_started.load(Ordering::Acquire),
            frame_ended: self.frame_ended.load(Ordering::Acquire),
        }
    }

    /// Applies a frame delimiter reported by the SLIP driver.
    ///
    /// This is ignored unless a poll is armed. Returns whether the boundary
    /// was applied.
    ///
    /// Called from the notifier thread. Must not block or allocate.
    pub fn frame_boundary(&self, boundary: FrameBoundary) -> bool {
        if !self.is_armed() {
            return false;
        }

        match boundary {
            FrameBoundary::Start => self.response_started.store(true, Ordering::Release),
            FrameBoundary::End => self.frame_ended.store(true, Ordering::Release),
        }
        self.changed.notify_waiters();
        true
    }

    /// Marks the end of an inbound frame seen by the capture socket.
    ///
    /// This corroborates the driver's end of frame signal, but arrives later.
    pub fn inbound_frame(&self) {
        self.frame_ended.store(true, Ordering::Release);
        self.changed.notify_waiters();
    }

    /// Returns a future that completes the next time a response flag is set.
    ///
    /// To not miss a notification, create (and enable) this before checking
    /// the flags.
    pub fn changed(&self) -> Notified<'_> {
        self.changed.notified()
    }

    /// Hands an announce to the poller, unless the mailbox is still occupied.
    ///
    /// Returns either [`Discovery::Posted`] or [`Discovery::MailboxBusy`].
    pub fn post_announce(&self, announce: Announce) -> Discovery {
        let mut mailbox = self.mailbox.lock();
        if mailbox.is_some() {
            Discovery::MailboxBusy
        }
        else {
            *mailbox = Some(announce);
            Discovery::Posted
        }
    }

    /// Takes the pending announce out of the mailbox, clearing it.
    pub fn take_announce(&self) -> Option<Announce> {
        self.mailbox.lock().take()
    }

    pub fn is_announce_pending(&self) -> bool {
        self.mailbox.lock().is_some()
    }

    pub(crate) fn record_idle_read(&self) -> u64 {
        self.idle_reads.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn reset_idle_reads(&self) {
        self.idle_reads.store(0, Ordering::Relaxed);
    }

    /// Number of consecutive capture reads that timed out.
    pub fn idle_reads(&self) -> u64 {
        self.idle_reads.load(Ordering::Relaxed)
    }
}

/// Snapshot of the response flags.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PollFlags {
    pub response_started: bool,
    pub frame_ended: bool,
}

impl PollFlags {
    /// A response is only complete if we saw it start. An end marker alone
    /// might be left over from something else.
    pub fn is_complete(&self) -> bool {
        self.response_started && self.frame_ended
    }
}

/// An armed device poll. Disarms on drop.
#[derive(Debug)]
pub struct PollGuard<'a> {
    shared: &'a Coordination,
}

impl PollGuard<'_> {
    pub fn flags(&self) -> PollFlags {
        self.shared.poll_flags()
    }
}

impl Drop for PollGuard<'_> {
    fn drop(&mut self) {
        self.shared.poll_armed.store(false, Ordering::Release);
    }
}
