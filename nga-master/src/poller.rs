use std::{
    pin::pin,
    sync::Arc,
    time::Duration,
};

use tokio::time::{
    Instant,
    timeout_at,
};
use tokio_util::sync::CancellationToken;

use crate::{
    Coordination,
    DeviceRecord,
    DeviceTable,
    Discovery,
    Link,
    PollerConfig,
    wire::{
        POLL_LENGTH,
        encode_poll,
        topology::{
            Timestamp,
            TopologyMessage,
        },
    },
};

/// How one device poll ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PollOutcome {
    /// The device started and finished a response.
    Responded { elapsed: Duration },
    /// The device started responding, but the response didn't end in time.
    ResponseTimeout { elapsed: Duration },
    /// The device didn't start responding in time.
    Silent { elapsed: Duration },
}

impl PollOutcome {
    /// Time spent waiting, measured from when the poll left the serial line.
    pub fn elapsed(&self) -> Duration {
        match self {
            Self::Responded { elapsed }
            | Self::ResponseTimeout { elapsed }
            | Self::Silent { elapsed } => *elapsed,
        }
    }
}

/// Summary of one poll round.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RoundReport {
    pub polled: usize,
    pub responded: usize,
    pub timed_out: usize,
    pub silent: usize,
    /// Polls that couldn't be sent. The device is still waited for.
    pub send_errors: usize,
}

impl RoundReport {
    fn record(&mut self, outcome: PollOutcome) {
        self.polled += 1;
        match outcome {
            PollOutcome::Responded { .. } => self.responded += 1,
            PollOutcome::ResponseTimeout { .. } => self.timed_out += 1,
            PollOutcome::Silent { .. } => self.silent += 1,
        }
    }
}

/// Owns the device table and drives the protocol.
///
/// Every [`step`][Self::step] drains the discovery mailbox, broadcasts the
/// topology if it's due, and then polls every known device once, in
/// discovery order.
#[derive(Debug)]
pub struct Poller<L> {
    config: PollerConfig,
    shared: Arc<Coordination>,
    link: L,
    table: DeviceTable,
    last_topology: Option<Instant>,
}

impl<L: Link> Poller<L> {
    pub fn new(config: PollerConfig, shared: Arc<Coordination>, link: L) -> Self {
        Self {
            config,
            shared,
            link,
            table: DeviceTable::new(),
            last_topology: None,
        }
    }

    pub fn table(&self) -> &DeviceTable {
        &self.table
    }

    /// Moves a pending announce from the mailbox into the device table.
    ///
    /// The mailbox is cleared whatever the outcome. Returns `None` if nothing
    /// was pending.
    pub fn drain_discovery(&mut self) -> Option<Discovery> {
        let announce = self.shared.take_announce()?;
        let discovery = self.table.insert(announce.into());

        match discovery {
            Discovery::Accepted { slot } => {
                tracing::info!(
                    slot,
                    address = %announce.ip_suffix,
                    serial_number = %announce.serial_number,
                    devices = self.table.len(),
                    "new device"
                );
            }
            Discovery::Duplicate { slot } => {
                tracing::trace!(slot, address = %announce.ip_suffix, "known device");
            }
            Discovery::CapacityExhausted => {
                tracing::warn!(
                    address = %announce.ip_suffix,
                    "device table full. dropping announce"
                );
            }
            Discovery::Posted | Discovery::MailboxBusy => {}
        }

        Some(discovery)
    }

    /// Broadcasts the topology message, if the last one is older than the
    /// topology interval, and waits for the settle delay afterwards.
    ///
    /// Returns whether a broadcast was made.
    pub async fn broadcast_topology_if_due(&mut self) -> bool {
        let now = Instant::now();
        let due = self
            .last_topology
            .is_none_or(|last| now.duration_since(last) > self.config.topology_interval);
        if !due {
            return false;
        }
        self.last_topology = Some(now);

        let message =
            TopologyMessage::from_table(&self.table, Timestamp::now(), self.config.mqtt_port);
        let datagram = message.to_vec();

        match self.link.transmit(&datagram).await {
            Ok(()) => {
                tracing::info!(
                    bytes = datagram.len(),
                    devices = message.devices.len(),
                    "topology broadcast"
                );
            }
            Err(error) => {
                tracing::warn!(?error, "topology broadcast failed");
            }
        }

        tokio::time::sleep(self.config.settle_delay).await;
        true
    }

    /// Polls a single device and waits for its response.
    pub async fn poll_device(&mut self, record: DeviceRecord) -> (PollOutcome, bool) {
        let mut datagram = Vec::with_capacity(POLL_LENGTH);
        encode_poll(record.ip_suffix, &mut datagram);

        let _guard = self.shared.arm();

        let sent = match self.link.transmit(&datagram).await {
            Ok(()) => true,
            Err(error) => {
                tracing::warn!(address = %record.ip_suffix, ?error, "poll failed");
                false
            }
        };

        let outcome = wait_for_response(
            &self.shared,
            self.config.idle_poll,
            self.config.max_response,
        )
        .await;
        tracing::debug!(address = %record.ip_suffix, ?outcome, "polled");

        (outcome, sent)
    }

    /// Polls every known device once, in table order.
    pub async fn poll_round(&mut self) -> RoundReport {
        let mut report = RoundReport::default();

        // the table can't change during a round, only the poller inserts
        let records: Vec<DeviceRecord> = self.table.iter().map(|(_, record)| *record).collect();

        for record in records {
            let (outcome, sent) = self.poll_device(record).await;
            report.record(outcome);
            if !sent {
                report.send_errors += 1;
            }
        }

        report
    }

    /// Runs one iteration of the poll loop.
    pub async fn step(&mut self) -> RoundReport {
        if self.config.legacy_poll {
            if let Err(error) = self.link.start_transmitter().await {
                tracing::warn!(?error, "failed to start tty");
            }
        }

        self.drain_discovery();
        self.broadcast_topology_if_due().await;
        let report = self.poll_round().await;
        tracing::trace!(?report, "poll round");

        if self.config.legacy_poll {
            if let Err(error) = self.link.legacy_poll().await {
                tracing::warn!(?error, "legacy poll failed");
            }
        }
        else if report.polled == 0 {
            // nothing to wait for, don't spin
            tokio::time::sleep(self.config.idle_poll).await;
        }

        report
    }

    /// Runs the poll loop until `shutdown` is cancelled.
    pub async fn run(mut self, shutdown: CancellationToken) {
        tracing::debug!(config = ?self.config, "poller running");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.step() => {}
            }
        }

        tracing::debug!(devices = self.table.len(), "poller stopped");
    }
}

/// Waits for the response to an armed poll.
///
/// The device gets `idle_poll` to start responding. Once it started, the
/// deadline moves to `max_response` after the poll. Returns early once the
/// response ended.
async fn wait_for_response(
    shared: &Coordination,
    idle_poll: Duration,
    max_response: Duration,
) -> PollOutcome {
    let start = Instant::now();
    let idle_deadline = start + idle_poll;
    let response_deadline = start + max_response;

    loop {
        // register for notifications before looking at the flags
        let mut changed = pin!(shared.changed());
        changed.as_mut().enable();

        let flags = shared.poll_flags();
        if flags.is_complete() {
            return PollOutcome::Responded {
                elapsed: start.elapsed(),
            };
        }

        let deadline = if flags.response_started {
            response_deadline
        }
        else {
            idle_deadline
        };

        if timeout_at(deadline, changed).await.is_ok() {
            continue;
        }

        // a response might have started right at the deadline
        let flags = shared.poll_flags();
        let elapsed = start.elapsed();
        if flags.is_complete() {
            return PollOutcome::Responded { elapsed };
        }
        else if flags.response_started {
            if Instant::now() >= response_deadline {
                return PollOutcome::ResponseTimeout { elapsed };
            }
        }
        else {
            return PollOutcome::Silent { elapsed };
        }
    }
}
