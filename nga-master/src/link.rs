use std::{
    net::{
        Ipv4Addr,
        SocketAddr,
    },
    sync::Arc,
};

use tokio::net::UdpSocket;

use crate::{
    DriverCommand,
    Error,
    LinkConfig,
    PacketSocket,
    SerialPort,
    legacy::legacy_poll_serial,
};

/// The transmit side of the SLIP link, as seen by the [`Poller`][crate::Poller].
///
/// Nothing sent here gets a direct reply. Responses are observed through the
/// capture and notifier threads.
pub trait Link {
    /// Broadcasts a datagram, and waits until it has left the serial line.
    fn transmit(&mut self, datagram: &[u8]) -> impl Future<Output = Result<(), Error>> + Send;

    /// Starts the tty transmitter in the driver.
    fn start_transmitter(&mut self) -> impl Future<Output = Result<(), Error>> + Send;

    /// Runs a legacy 9600 baud poll.
    fn legacy_poll(&mut self) -> impl Future<Output = Result<(), Error>> + Send;
}

/// UDP over the kernel's SLIP interface.
#[derive(Debug)]
pub struct SlipLink {
    socket: UdpSocket,
    destination: SocketAddr,
    serial: Arc<SerialPort>,
    legacy_sender: Option<Arc<PacketSocket>>,
}

impl SlipLink {
    pub async fn bind(config: &LinkConfig, serial: Arc<SerialPort>) -> Result<Self, Error> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        socket.set_broadcast(true)?;
        tracing::debug!(
            local = ?socket.local_addr(),
            destination = %config.broadcast,
            "bound broadcast socket"
        );

        Ok(Self {
            socket,
            destination: config.broadcast,
            serial,
            legacy_sender: None,
        })
    }

    /// Enables the legacy poll, sending its frame through `sender`.
    pub fn with_legacy_sender(mut self, sender: PacketSocket) -> Self {
        self.legacy_sender = Some(Arc::new(sender));
        self
    }

    /// Runs a blocking serial port operation off the runtime.
    async fn blocking<F>(&self, f: F) -> Result<(), Error>
    where
        F: FnOnce(&SerialPort) -> Result<(), Error> + Send + 'static,
    {
        let serial = self.serial.clone();
        tokio::task::spawn_blocking(move || f(&serial))
            .await
            .map_err(|_| Error::BlockingTaskDead)?
    }
}

/// Runs `settle` whatever happened to the send, then reports the send error
/// first.
///
/// Part of a failed datagram may still be in the tty buffer.
async fn settle_after_send(
    sent: Result<(), Error>,
    settle: impl Future<Output = Result<(), Error>>,
) -> Result<(), Error> {
    let settled = settle.await;
    sent?;
    settled
}

impl Link for SlipLink {
    async fn transmit(&mut self, datagram: &[u8]) -> Result<(), Error> {
        let sent = match self.socket.send_to(datagram, self.destination).await {
            Ok(sent) if sent == datagram.len() => Ok(()),
            Ok(sent) => {
                Err(Error::ShortWrite {
                    sent,
                    expected: datagram.len(),
                })
            }
            Err(error) => Err(error.into()),
        };

        settle_after_send(sent, self.blocking(|serial| serial.settle())).await
    }

    async fn start_transmitter(&mut self) -> Result<(), Error> {
        self.blocking(|serial| serial.driver_control(DriverCommand::StartTransmit))
            .await
    }

    async fn legacy_poll(&mut self) -> Result<(), Error> {
        let Some(sender) = self.legacy_sender.clone()
        else {
            tracing::warn!("legacy poll requested, but no sender configured");
            return Ok(());
        };

        self.blocking(move |serial| legacy_poll_serial(serial, &sender))
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use crate::{
        Error,
        link::settle_after_send,
    };

    #[tokio::test]
    async fn it_settles_after_a_failed_send() {
        let settled = Cell::new(false);
        let result = settle_after_send(
            Err(Error::ShortWrite {
                sent: 10,
                expected: 20,
            }),
            async {
                settled.set(true);
                Ok(())
            },
        )
        .await;
        assert!(settled.get());
        assert!(matches!(
            result,
            Err(Error::ShortWrite {
                sent: 10,
                expected: 20
            })
        ));
    }

    #[tokio::test]
    async fn settle_errors_are_reported_after_a_good_send() {
        let result = settle_after_send(Ok(()), async { Err(Error::BlockingTaskDead) }).await;
        assert!(matches!(result, Err(Error::BlockingTaskDead)));
    }
}
