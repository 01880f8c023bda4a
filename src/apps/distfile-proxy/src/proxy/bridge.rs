//! Hand-off queue that turns connections pushed by the CONNECT hijacker into
//! "accepted" connections for the TLS-terminating server.
//!
//! Producers are the per-connection tasks of the plain HTTP server; the
//! single consumer is the TLS accept loop. The queue is either unbounded or
//! bounded, and a bounded queue either blocks producers or rejects the
//! connection when full. Connections are never dropped silently: a rejected
//! connection is handed back to the caller, and anything still queued when
//! the bridge closes is logged as it is discarded.

use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("listener bridge is closed")]
    Closed,

    #[error("listener bridge queue is full")]
    Full,
}

/// A push that did not make it into the queue. The connection is returned so
/// the caller decides how to close it.
#[derive(Debug)]
pub struct Rejected<C> {
    pub conn: C,
    pub reason: BridgeError,
}

/// What a bounded bridge does when its queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Wait for the consumer to make room.
    #[default]
    Block,
    /// Hand the connection back immediately.
    Reject,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BridgeConfig {
    /// Queue capacity; `None` means unbounded.
    pub capacity: Option<usize>,
    pub overflow: OverflowPolicy,
}

enum Sender<C> {
    Bounded(mpsc::Sender<C>, OverflowPolicy),
    Unbounded(mpsc::UnboundedSender<C>),
}

enum Receiver<C> {
    Bounded(mpsc::Receiver<C>),
    Unbounded(mpsc::UnboundedReceiver<C>),
}

impl<C> Receiver<C> {
    async fn recv(&mut self) -> Option<C> {
        match self {
            Receiver::Bounded(rx) => rx.recv().await,
            Receiver::Unbounded(rx) => rx.recv().await,
        }
    }

    fn try_recv(&mut self) -> Option<C> {
        match self {
            Receiver::Bounded(rx) => rx.try_recv().ok(),
            Receiver::Unbounded(rx) => rx.try_recv().ok(),
        }
    }

    fn close(&mut self) {
        match self {
            Receiver::Bounded(rx) => rx.close(),
            Receiver::Unbounded(rx) => rx.close(),
        }
    }
}

pub struct ListenerBridge<C> {
    tx: Sender<C>,
    rx: Mutex<Receiver<C>>,
    closed: CancellationToken,
}

impl<C: Send + 'static> ListenerBridge<C> {
    pub fn new(config: BridgeConfig) -> Self {
        let (tx, rx) = match config.capacity {
            Some(capacity) => {
                let (tx, rx) = mpsc::channel(capacity.max(1));
                (
                    Sender::Bounded(tx, config.overflow),
                    Receiver::Bounded(rx),
                )
            }
            None => {
                let (tx, rx) = mpsc::unbounded_channel();
                (Sender::Unbounded(tx), Receiver::Unbounded(rx))
            }
        };
        Self {
            tx,
            rx: Mutex::new(rx),
            closed: CancellationToken::new(),
        }
    }

    pub fn unbounded() -> Self {
        Self::new(BridgeConfig::default())
    }

    /// Queues a connection for the consumer. Never waits for the consumer to
    /// be inside `accept`; a bounded queue with [`OverflowPolicy::Block`]
    /// waits only for free capacity.
    pub async fn push(&self, conn: C) -> Result<(), Rejected<C>> {
        if self.closed.is_cancelled() {
            return Err(Rejected {
                conn,
                reason: BridgeError::Closed,
            });
        }

        let result = match &self.tx {
            Sender::Unbounded(tx) => tx.send(conn).map_err(|e| Rejected {
                conn: e.0,
                reason: BridgeError::Closed,
            }),
            Sender::Bounded(tx, OverflowPolicy::Reject) => tx.try_send(conn).map_err(|e| match e {
                mpsc::error::TrySendError::Full(conn) => Rejected {
                    conn,
                    reason: BridgeError::Full,
                },
                mpsc::error::TrySendError::Closed(conn) => Rejected {
                    conn,
                    reason: BridgeError::Closed,
                },
            }),
            Sender::Bounded(tx, OverflowPolicy::Block) => {
                let permit = tokio::select! {
                    _ = self.closed.cancelled() => None,
                    permit = tx.reserve() => permit.ok(),
                };
                match permit {
                    Some(permit) => {
                        permit.send(conn);
                        Ok(())
                    }
                    None => Err(Rejected {
                        conn,
                        reason: BridgeError::Closed,
                    }),
                }
            }
        };

        if result.is_ok() {
            debug!("Connection queued on listener bridge");
        }
        result
    }

    /// Waits for the next pushed connection, in push order. Returns
    /// [`BridgeError::Closed`] once the bridge has been closed, including
    /// for callers already waiting.
    pub async fn accept(&self) -> Result<C, BridgeError> {
        if self.closed.is_cancelled() {
            return Err(BridgeError::Closed);
        }
        let mut rx = tokio::select! {
            _ = self.closed.cancelled() => return Err(BridgeError::Closed),
            rx = self.rx.lock() => rx,
        };
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(BridgeError::Closed),
            conn = rx.recv() => conn.ok_or(BridgeError::Closed),
        }
    }

    /// Closes the bridge. Idempotent. Pending and future `accept` calls
    /// return [`BridgeError::Closed`]; queued connections are dropped, which
    /// closes them.
    pub async fn close(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();

        let mut rx = self.rx.lock().await;
        rx.close();
        let mut discarded = 0usize;
        while let Some(conn) = rx.try_recv() {
            drop(conn);
            discarded += 1;
        }
        if discarded > 0 {
            warn!(
                "Listener bridge closed with {} queued connection(s); closing them",
                discarded
            );
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}
