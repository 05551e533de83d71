//! UDP control listener.
//!
//! Commands arrive as ASCII datagrams on a best-effort socket. Two classes
//! exist: advisory position updates (`"p <count>"`) and dump requests
//! (`"<count>"`). The socket is bound once and the receive loop observes the
//! shutdown channel between datagrams, so teardown never depends on one more
//! packet arriving.

use crate::error::{AppResult, TriggerError};
use crate::state::DumpState;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Maximum accepted command payload in bytes.
pub const MAX_COMMAND_LEN: usize = 1024;

/// First character of an advisory command.
pub const ADVISORY_MARKER: char = 'p';

/// A parsed control command, in raw command counts (unscaled).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    /// Update the advisory position counter.
    Advisory(u64),
    /// Request a dump around the given position.
    Dump(u64),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("empty command")]
    Empty,
    #[error("invalid advisory payload {0:?}")]
    BadAdvisory(String),
    #[error("invalid dump position {0:?}")]
    BadPosition(String),
}

/// Parse one datagram payload.
///
/// Trailing NULs and whitespace are stripped; senders historically padded
/// their buffers.
pub fn parse_command(text: &str) -> Result<ControlCommand, CommandError> {
    let text = text.trim_matches(|c: char| c == '\0' || c.is_whitespace());
    if text.is_empty() {
        return Err(CommandError::Empty);
    }
    if let Some(rest) = text.strip_prefix(ADVISORY_MARKER) {
        let arg = rest.trim();
        return arg
            .parse::<u64>()
            .map(ControlCommand::Advisory)
            .map_err(|_| CommandError::BadAdvisory(text.to_string()));
    }
    text.parse::<u64>()
        .map(ControlCommand::Dump)
        .map_err(|_| CommandError::BadPosition(text.to_string()))
}

/// Listener task for the control socket.
pub struct ControlListener {
    socket: UdpSocket,
    state: Arc<DumpState>,
    scale: u64,
    shutdown: watch::Receiver<bool>,
}

impl ControlListener {
    /// Bind the control socket. The bind happens exactly once; a failure
    /// here is a setup failure.
    pub async fn bind(
        addr: SocketAddr,
        state: Arc<DumpState>,
        scale: u64,
        shutdown: watch::Receiver<bool>,
    ) -> AppResult<Self> {
        let socket = UdpSocket::bind(addr).await?;
        info!(%addr, "control listener bound");
        Ok(Self {
            socket,
            state,
            scale,
            shutdown,
        })
    }

    /// Address the socket actually bound to (relevant with port 0).
    pub fn local_addr(&self) -> AppResult<SocketAddr> {
        self.socket
            .local_addr()
            .map_err(|e| TriggerError::Control(e.to_string()))
    }

    /// Receive and apply commands until shutdown is signalled.
    pub async fn run(self) -> AppResult<()> {
        let Self {
            socket,
            state,
            scale,
            mut shutdown,
        } = self;
        let mut buf = vec![0u8; MAX_COMMAND_LEN];

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                received = socket.recv_from(&mut buf) => {
                    match received {
                        Ok((len, peer)) => handle_datagram(&state, scale, &buf[..len], peer),
                        // Transient receive errors are absorbed; the socket
                        // stays bound.
                        Err(err) => warn!(%err, "control receive failed"),
                    }
                }
            }
        }

        debug!("control listener exiting");
        Ok(())
    }
}

fn handle_datagram(state: &DumpState, scale: u64, payload: &[u8], peer: SocketAddr) {
    state.record_command();
    let text = String::from_utf8_lossy(payload);
    match parse_command(&text) {
        Ok(ControlCommand::Advisory(count)) => {
            let position = count.saturating_mul(scale);
            state.set_advisory(position);
            info!(position, %peer, "advisory position updated");
        }
        Ok(ControlCommand::Dump(count)) => {
            let target = count.saturating_mul(scale);
            match state.try_arm(target) {
                Ok(()) => info!(target, %peer, "dump armed"),
                Err(armed) => {
                    error!(rejected = target, armed, %peer, "dump already pending, command dropped");
                }
            }
        }
        Err(err) => warn!(%err, %peer, "ignoring malformed control datagram"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn parses_dump_command() {
        assert_eq!(parse_command("17"), Ok(ControlCommand::Dump(17)));
        assert_eq!(parse_command("  42 \n"), Ok(ControlCommand::Dump(42)));
    }

    #[test]
    fn parses_advisory_with_and_without_space() {
        assert_eq!(parse_command("p 5"), Ok(ControlCommand::Advisory(5)));
        assert_eq!(parse_command("p5"), Ok(ControlCommand::Advisory(5)));
    }

    #[test]
    fn strips_nul_padding() {
        assert_eq!(parse_command("9\0\0\0"), Ok(ControlCommand::Dump(9)));
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(parse_command(""), Err(CommandError::Empty)));
        assert!(matches!(
            parse_command("dump now"),
            Err(CommandError::BadPosition(_))
        ));
        assert!(matches!(
            parse_command("p umpkin"),
            Err(CommandError::BadAdvisory(_))
        ));
        assert!(matches!(
            parse_command("-3"),
            Err(CommandError::BadPosition(_))
        ));
    }

    #[tokio::test]
    async fn listener_applies_commands_and_shuts_down() {
        let state = Arc::new(DumpState::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let listener = ControlListener::bind(
            "127.0.0.1:0".parse().expect("addr"),
            Arc::clone(&state),
            4,
            shutdown_rx,
        )
        .await
        .expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let task = tokio::spawn(listener.run());

        let client = UdpSocket::bind("127.0.0.1:0").await.expect("client bind");
        client.send_to(b"p 3", addr).await.expect("send advisory");
        client.send_to(b"9", addr).await.expect("send dump");
        client.send_to(b"11", addr).await.expect("send second dump");
        client.send_to(b"junk", addr).await.expect("send junk");

        // Give the listener a beat to drain the socket.
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(state.advisory(), 12);
        assert!(state.pending());
        assert_eq!(state.target(), 36);
        assert_eq!(state.trigger_count(), 4);

        shutdown_tx.send(true).expect("signal shutdown");
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("listener exits promptly")
            .expect("join")
            .expect("listener result");
    }
}
