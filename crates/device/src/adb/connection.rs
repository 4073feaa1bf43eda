//! Reconnecting TCP session to the reload daemon behind one tunnel
//!
//! ```text
//! Disconnected --start--> Connecting --ok--> Connected
//!      ^                      |                  |
//!      +---- retry delay -----+---- peer closed -+
//! ```
//!
//! The cycle only ends when [`DaemonConnection::stop`] is called.

use super::tunnel::Tunnel;
use bytes::{Bytes, BytesMut};
use devbridge_core::error::retry::RetryPolicy;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// What a daemon connection reports to its owner
#[derive(Debug, Clone)]
pub enum DaemonEvent {
    /// A session is live; `writer` sends bytes to the daemon
    Connected {
        tunnel: Tunnel,
        writer: mpsc::UnboundedSender<Bytes>,
    },
    /// Bytes received from the daemon
    Data { tunnel: Tunnel, data: Bytes },
    /// A live session ended; `terminal` when no retry follows
    Disconnected { tunnel: Tunnel, terminal: bool },
}

impl DaemonEvent {
    pub fn tunnel(&self) -> &Tunnel {
        match self {
            DaemonEvent::Connected { tunnel, .. }
            | DaemonEvent::Data { tunnel, .. }
            | DaemonEvent::Disconnected { tunnel, .. } => tunnel,
        }
    }
}

/// Owner handle for one reconnecting daemon session
#[derive(Debug)]
pub struct DaemonConnection {
    tunnel: Tunnel,
    stop: watch::Sender<bool>,
    state: watch::Receiver<ConnectionState>,
    task: JoinHandle<()>,
}

impl DaemonConnection {
    /// Start connecting to the local end of `tunnel`
    pub fn start(tunnel: Tunnel, policy: RetryPolicy, events: mpsc::UnboundedSender<DaemonEvent>) -> Self {
        let (stop, stop_rx) = watch::channel(false);
        let (state_tx, state) = watch::channel(ConnectionState::Disconnected);
        let task = tokio::spawn(run(tunnel.clone(), policy, events, stop_rx, state_tx));
        Self {
            tunnel,
            stop,
            state,
            task,
        }
    }

    /// Fixed reconnect delay, retrying forever
    pub fn reconnect_policy(delay: Duration) -> RetryPolicy {
        RetryPolicy::fixed(delay)
    }

    pub fn tunnel(&self) -> &Tunnel {
        &self.tunnel
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Tear down the live session, if any, and stop retrying
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        if let Err(e) = self.task.await {
            warn!(tunnel = %self.tunnel.key(), "Daemon connection task failed: {}", e);
        }
    }
}

enum SessionEnd {
    Stopped,
    Lost,
}

async fn run(
    tunnel: Tunnel,
    policy: RetryPolicy,
    events: mpsc::UnboundedSender<DaemonEvent>,
    mut stop: watch::Receiver<bool>,
    state: watch::Sender<ConnectionState>,
) {
    let address = tunnel.local_address();
    let mut attempt: u32 = 0;

    loop {
        if *stop.borrow() {
            break;
        }

        state.send_replace(ConnectionState::Connecting);
        let connected = tokio::select! {
            connected = TcpStream::connect(&address) => connected,
            _ = stop.changed() => break,
        };

        match connected {
            Ok(stream) => {
                attempt = 0;
                state.send_replace(ConnectionState::Connected);
                info!(tunnel = %tunnel.key(), "Connected to daemon");

                let end = serve(stream, &tunnel, &events, &mut stop).await;
                let terminal = matches!(end, SessionEnd::Stopped);
                let _ = events.send(DaemonEvent::Disconnected {
                    tunnel: tunnel.clone(),
                    terminal,
                });
                if terminal {
                    break;
                }
                info!(tunnel = %tunnel.key(), "Daemon connection lost");
            }
            Err(e) => {
                debug!(tunnel = %tunnel.key(), "Daemon connect failed: {}", e);
            }
        }

        state.send_replace(ConnectionState::Disconnected);
        attempt = attempt.saturating_add(1);

        tokio::select! {
            _ = tokio::time::sleep(policy.delay_for_attempt(attempt)) => {}
            _ = stop.changed() => break,
        }
    }

    state.send_replace(ConnectionState::Disconnected);
    debug!(tunnel = %tunnel.key(), "Daemon connection stopped");
}

async fn serve(
    stream: TcpStream,
    tunnel: &Tunnel,
    events: &mpsc::UnboundedSender<DaemonEvent>,
    stop: &mut watch::Receiver<bool>,
) -> SessionEnd {
    let (mut reader, mut writer) = stream.into_split();
    let (writer_tx, mut outgoing) = mpsc::unbounded_channel::<Bytes>();
    let _ = events.send(DaemonEvent::Connected {
        tunnel: tunnel.clone(),
        writer: writer_tx,
    });

    let mut buffer = BytesMut::with_capacity(4096);
    loop {
        tokio::select! {
            _ = stop.changed() => {
                let _ = writer.shutdown().await;
                return SessionEnd::Stopped;
            }
            read = reader.read_buf(&mut buffer) => match read {
                Ok(0) => return SessionEnd::Lost,
                Ok(_) => {
                    let _ = events.send(DaemonEvent::Data {
                        tunnel: tunnel.clone(),
                        data: buffer.split().freeze(),
                    });
                }
                Err(e) => {
                    warn!(tunnel = %tunnel.key(), "Daemon read failed: {}", e);
                    return SessionEnd::Lost;
                }
            },
            Some(data) = outgoing.recv() => {
                if let Err(e) = writer.write_all(&data).await {
                    warn!(tunnel = %tunnel.key(), "Daemon write failed: {}", e);
                    return SessionEnd::Lost;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    async fn wait_for(state: &mut watch::Receiver<ConnectionState>, wanted: ConnectionState) {
        timeout(WAIT, state.wait_for(|s| *s == wanted))
            .await
            .expect("state never reached")
            .unwrap();
    }

    async fn next_event(events: &mut mpsc::UnboundedReceiver<DaemonEvent>) -> DaemonEvent {
        timeout(WAIT, events.recv()).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_connects_and_relays_bytes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let tunnel = Tunnel::new("emulator-5554", port, 13592);
        let (events_tx, mut events) = mpsc::unbounded_channel();

        let connection = DaemonConnection::start(
            tunnel.clone(),
            DaemonConnection::reconnect_policy(Duration::from_millis(20)),
            events_tx,
        );
        let (mut daemon, _) = listener.accept().await.unwrap();

        let writer = match next_event(&mut events).await {
            DaemonEvent::Connected { tunnel: t, writer } => {
                assert_eq!(t, tunnel);
                writer
            }
            other => panic!("unexpected event {:?}", other),
        };
        assert_eq!(connection.state(), ConnectionState::Connected);

        daemon.write_all(b"hello").await.unwrap();
        match next_event(&mut events).await {
            DaemonEvent::Data { data, .. } => assert_eq!(&data[..], b"hello"),
            other => panic!("unexpected event {:?}", other),
        }

        writer.send(Bytes::from_static(b"reload")).unwrap();
        let mut buf = [0u8; 6];
        daemon.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"reload");

        connection.stop().await;
        match next_event(&mut events).await {
            DaemonEvent::Disconnected { terminal, .. } => assert!(terminal),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_reconnects_after_peer_closes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (events_tx, mut events) = mpsc::unbounded_channel();

        let connection = DaemonConnection::start(
            Tunnel::new("A", port, 13592),
            DaemonConnection::reconnect_policy(Duration::from_millis(20)),
            events_tx,
        );

        let (first, _) = listener.accept().await.unwrap();
        assert!(matches!(next_event(&mut events).await, DaemonEvent::Connected { .. }));
        drop(first);
        match next_event(&mut events).await {
            DaemonEvent::Disconnected { terminal, .. } => assert!(!terminal),
            other => panic!("unexpected event {:?}", other),
        }

        let (_second, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
        assert!(matches!(next_event(&mut events).await, DaemonEvent::Connected { .. }));
        connection.stop().await;
    }

    #[tokio::test]
    async fn test_retries_until_daemon_listens() {
        // Reserve a port, then free it so the first attempts are refused
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        let (events_tx, mut events) = mpsc::unbounded_channel();
        let connection = DaemonConnection::start(
            Tunnel::new("A", port, 13592),
            DaemonConnection::reconnect_policy(Duration::from_millis(20)),
            events_tx,
        );
        let mut state = connection.watch_state();
        wait_for(&mut state, ConnectionState::Disconnected).await;

        let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
        let (_daemon, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
        assert!(matches!(next_event(&mut events).await, DaemonEvent::Connected { .. }));
        wait_for(&mut state, ConnectionState::Connected).await;

        connection.stop().await;
    }

    #[tokio::test]
    async fn test_stop_while_disconnected_ends_quietly() {
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        let (events_tx, mut events) = mpsc::unbounded_channel();
        let connection = DaemonConnection::start(
            Tunnel::new("A", port, 13592),
            DaemonConnection::reconnect_policy(Duration::from_secs(60)),
            events_tx,
        );
        timeout(WAIT, connection.stop()).await.unwrap();
        assert!(events.try_recv().is_err());
    }
}
