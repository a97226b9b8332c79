//! nl-echo: a netlink echo responder
//!
//! Binds one endpoint on a netlink protocol and answers every inbound
//! message with a fixed greeting, addressed back to the sender's port id.
//!
//! Transports:
//! - `netlink`: Linux `AF_NETLINK` socket (runs until Ctrl-C)
//! - `loopback`: in-memory transport, stdin lines become inbound messages

use nl_echo::config::{Config, TransportKind};
use nl_echo::transport::LoopbackTransport;
use nl_echo::{EchoResponder, InboundMessage, PeerId};
use std::io::BufRead;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    info!(
        transport = ?config.transport,
        protocol_id = config.protocol_id,
        port_id = config.port_id,
        reply = %config.reply,
        "Starting nl-echo"
    );

    match config.transport {
        TransportKind::Netlink => run_netlink(config),
        TransportKind::Loopback => run_loopback(config),
    }
}

/// Serve a netlink endpoint until Ctrl-C.
#[cfg(target_os = "linux")]
fn run_netlink(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    use nl_echo::transport::NetlinkTransport;

    let transport = NetlinkTransport::new(
        config.port_id,
        config.recv_buffer_size,
        config.max_message_size,
    );
    let responder = EchoResponder::with_reply(transport, config.protocol_id, config.reply);
    responder.start()?;

    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?
        .block_on(tokio::signal::ctrl_c())?;

    info!("Shutdown requested");
    responder.stop();
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn run_netlink(_config: Config) -> Result<(), Box<dyn std::error::Error>> {
    Err(Box::new(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "netlink transport is only available on Linux",
    )))
}

/// Feed stdin lines to a responder on an in-memory transport and print the
/// replies.
fn run_loopback(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let transport = LoopbackTransport::with_max_message_size(config.max_message_size);
    let responder =
        EchoResponder::with_reply(transport.clone(), config.protocol_id, config.reply);
    responder.start()?;

    let sender = PeerId(config.peer);
    for line in std::io::stdin().lock().lines() {
        let line = line?;
        transport.deliver(config.protocol_id, InboundMessage::new(sender, line));

        for reply in transport.take_sent() {
            println!(
                "{} <- {}",
                reply.dest,
                String::from_utf8_lossy(&reply.payload)
            );
        }
    }

    responder.stop();
    Ok(())
}
