use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::broker::{BrokerChannel, BrokerConnection, Connector};
use crate::error::AmqpError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ConnectionStatus::Connecting,
            2 => ConnectionStatus::Connected,
            _ => ConnectionStatus::Disconnected,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            ConnectionStatus::Disconnected => 0,
            ConnectionStatus::Connecting => 1,
            ConnectionStatus::Connected => 2,
        }
    }
}

/// Reported by a connection's failure callback. `generation` identifies the
/// connection it came from, so late reports about a replaced connection
/// can't tear down its successor.
#[derive(Debug)]
struct FailureSignal {
    generation: u64,
    reason: String,
}

struct ConnectionState {
    connection: Option<Arc<dyn BrokerConnection>>,
    generation: u64,
}

/// Owns the single broker connection of the process and hands out channels
/// on it. Connecting is serialized, so concurrent callers share one
/// connection. Failures reported by the broker are handled by a supervisor
/// task that drops the dead connection and tries to open a new one.
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    state: Mutex<ConnectionState>,
    status: AtomicU8,
    disposed: AtomicBool,
    failures: mpsc::UnboundedSender<FailureSignal>,
    supervisor: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    /// Must be called from within a tokio runtime, it spawns the supervisor.
    pub fn new(connector: Arc<dyn Connector>) -> Arc<Self> {
        let (failures, signals) = mpsc::unbounded_channel();

        let manager = Arc::new(Self {
            connector,
            state: Mutex::new(ConnectionState {
                connection: None,
                generation: 0,
            }),
            status: AtomicU8::new(ConnectionStatus::Disconnected.as_u8()),
            disposed: AtomicBool::new(false),
            failures,
            supervisor: std::sync::Mutex::new(None),
        });

        let handle = tokio::spawn(supervise(Arc::downgrade(&manager), signals));
        match manager.supervisor.lock() {
            Ok(mut supervisor) => *supervisor = Some(handle),
            Err(_) => handle.abort(),
        }

        manager
    }

    pub fn status(&self) -> ConnectionStatus {
        ConnectionStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    /// Connects if there is no live connection. Idempotent.
    pub async fn ensure_connected(&self) -> Result<(), AmqpError> {
        self.connection().await.map(|_| ())
    }

    /// Opens a channel on the shared connection, connecting first if needed.
    pub async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        let connection = self.connection().await?;
        connection.create_channel().await
    }

    /// Closes the connection and stops the supervisor. Only the first call
    /// does anything.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Ok(mut supervisor) = self.supervisor.lock() {
            if let Some(handle) = supervisor.take() {
                handle.abort();
            }
        }

        let connection = self.state.lock().await.connection.take();
        if let Some(connection) = connection {
            if let Err(err) = connection.close().await {
                warn!(error = %err, "failed to close broker connection");
            }
        }
        self.set_status(ConnectionStatus::Disconnected);
        info!("broker connection disposed");
    }

    async fn connection(&self) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(AmqpError::Disposed);
        }

        let mut state = self.state.lock().await;
        if let Some(connection) = &state.connection {
            if connection.is_connected() {
                return Ok(connection.clone());
            }
        }

        self.set_status(ConnectionStatus::Connecting);
        info!("connecting to broker");

        let connection = match self.connector.connect().await {
            Ok(connection) => connection,
            Err(err) => {
                state.connection = None;
                self.set_status(ConnectionStatus::Disconnected);
                metrics::counter!("amqp_connection_failures").increment(1);
                error!(error = %err, "broker connection could not be opened");
                return Err(AmqpError::ConnectionUnavailable(err.to_string()));
            }
        };

        if self.disposed.load(Ordering::SeqCst) {
            if let Err(err) = connection.close().await {
                debug!(error = %err, "failed to close connection opened during dispose");
            }
            return Err(AmqpError::Disposed);
        }

        state.generation += 1;
        let generation = state.generation;
        let failures = self.failures.clone();
        connection.on_failure(Box::new(move |reason| {
            if let Err(err) = failures.send(FailureSignal { generation, reason }) {
                debug!(generation, reason = %err.0.reason, "connection manager gone, ignoring failure");
            }
        }));

        state.connection = Some(connection.clone());
        self.set_status(ConnectionStatus::Connected);
        metrics::counter!("amqp_connections_opened").increment(1);
        info!(generation, "broker connection established");

        Ok(connection)
    }

    async fn handle_failure(&self, signal: FailureSignal) {
        if self.disposed.load(Ordering::SeqCst) {
            return;
        }

        {
            let mut state = self.state.lock().await;
            if signal.generation != state.generation || state.connection.is_none() {
                debug!(
                    generation = signal.generation,
                    current = state.generation,
                    "ignoring failure of a replaced connection"
                );
                return;
            }
            state.connection = None;
            self.set_status(ConnectionStatus::Disconnected);
        }

        metrics::counter!("amqp_connection_lost").increment(1);
        warn!(reason = %signal.reason, "broker connection lost, reconnecting");

        if let Err(err) = self.ensure_connected().await {
            warn!(error = %err, "reconnect failed, next caller will retry");
        }
    }

    fn set_status(&self, status: ConnectionStatus) {
        self.status.store(status.as_u8(), Ordering::SeqCst);
    }
}

async fn supervise(
    manager: Weak<ConnectionManager>,
    mut signals: mpsc::UnboundedReceiver<FailureSignal>,
) {
    while let Some(signal) = signals.recv().await {
        let Some(manager) = manager.upgrade() else {
            break;
        };
        manager.handle_failure(signal).await;
    }
}
