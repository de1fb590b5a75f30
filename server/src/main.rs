use std::{
    net::SocketAddr,
    path::PathBuf,
    sync::Arc,
};

use clap::Parser;
use color_eyre::eyre::Error;
use nga_master::{
    BaudRate,
    Coordination,
    FilterProgram,
    LinkConfig,
    PacketSocket,
    Poller,
    PollerConfig,
    SerialPort,
    SlipLink,
    block_frame_signal,
    spawn_capture_thread,
    spawn_notifier_thread,
};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Parser)]
struct Args {
    /// SLIP network interface
    #[clap(short, long, env = "NGA_INTERFACE", default_value = "sl0")]
    interface: String,

    /// tty the SLIP interface is attached to
    #[clap(short, long, env = "NGA_SERIAL_PORT", default_value = "/dev/ttyUSB0")]
    serial_port: PathBuf,

    #[clap(short, long, env = "NGA_BAUD_RATE", default_value = "115200")]
    baud_rate: u32,

    /// Where topology broadcasts and polls are sent to
    #[clap(long, env = "NGA_BROADCAST", default_value = "169.254.255.255:30000")]
    broadcast: SocketAddr,

    /// MQTT port advertised to devices
    #[clap(long, env = "NGA_MQTT_PORT", default_value = "1883")]
    mqtt_port: u16,

    /// Real-time signal the SLIP driver raises on frame boundaries
    #[clap(long, env = "NGA_FRAME_SIGNAL", default_value = "44")]
    frame_signal: i32,

    #[clap(long, default_value = "4s")]
    topology_interval: humantime::Duration,

    /// Pause after a topology broadcast
    #[clap(long, default_value = "500ms")]
    settle_delay: humantime::Duration,

    /// How long a device gets to start responding
    #[clap(long, default_value = "150ms")]
    idle_poll: humantime::Duration,

    /// How long a started response may take, measured from the poll
    #[clap(long, default_value = "600ms")]
    max_response: humantime::Duration,

    /// Only capture IPv4 frames that aren't TCP
    #[clap(long)]
    ipv4_only: bool,

    /// Also poll legacy 9600 baud devices after every round
    #[clap(long)]
    legacy_poll: bool,
}

impl Args {
    fn link_config(&self) -> Result<LinkConfig, Error> {
        Ok(LinkConfig {
            interface: self.interface.clone(),
            serial_port: self.serial_port.clone(),
            baud_rate: BaudRate::try_from(self.baud_rate)?,
            broadcast: self.broadcast,
            frame_signal: self.frame_signal,
            filter: if self.ipv4_only {
                FilterProgram::Ipv4Only
            }
            else {
                FilterProgram::PassAll
            },
        })
    }

    fn poller_config(&self) -> PollerConfig {
        PollerConfig {
            topology_interval: self.topology_interval.into(),
            settle_delay: self.settle_delay.into(),
            idle_poll: self.idle_poll.into(),
            max_response: self.max_response.into(),
            mqtt_port: self.mqtt_port,
            legacy_poll: self.legacy_poll,
        }
    }
}

fn main() -> Result<(), Error> {
    let _ = dotenvy::dotenv();
    color_eyre::install()?;
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let link_config = args.link_config()?;
    let poller_config = args.poller_config();

    // every thread spawned from here on inherits the blocked signal
    block_frame_signal(link_config.frame_signal)?;

    let shutdown = CancellationToken::new();
    let shared = Arc::new(Coordination::new());

    let capture = PacketSocket::open(&link_config.interface, link_config.filter)?;
    let capture_thread = spawn_capture_thread(capture, shared.clone(), shutdown.clone());

    let serial = Arc::new(SerialPort::open(
        &link_config.serial_port,
        link_config.baud_rate,
    )?);
    tracing::info!(
        path = %serial.path().display(),
        baud_rate = ?serial.baud_rate()?,
        "serial port ready"
    );

    let notifier_thread = spawn_notifier_thread(
        link_config.frame_signal,
        serial.clone(),
        shared.clone(),
        shutdown.clone(),
    )?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    let result = runtime.block_on(async {
        let mut link = SlipLink::bind(&link_config, serial).await?;
        if poller_config.legacy_poll {
            link = link.with_legacy_sender(PacketSocket::open_sender(&link_config.interface)?);
        }

        tokio::spawn({
            let shutdown = shutdown.clone();
            async move {
                match tokio::signal::ctrl_c().await {
                    Ok(()) => {
                        tracing::info!("shutting down");
                        shutdown.cancel();
                    }
                    Err(error) => tracing::error!(?error, "can't listen for ctrl-c"),
                }
            }
        });

        Poller::new(poller_config, shared, link)
            .run(shutdown.clone())
            .await;

        Ok::<(), Error>(())
    });

    // the threads notice this within their read timeouts
    shutdown.cancel();
    for (name, thread) in [("capture", capture_thread), ("notifier", notifier_thread)] {
        if thread.join().is_err() {
            tracing::error!(thread = name, "thread panicked");
        }
    }

    result
}
