//! Heartbeat coordinator: the keepalive loop bound to one gateway connection.
//!
//! Each cycle arms a fresh acknowledgement slot, sends HEARTBEAT with the
//! session's current sequence, then waits for [`Heartbeat::ack`] for at most
//! `min(ack_timeout, interval / 2)`. A missed ack ends the loop and signals
//! [`Heartbeat::expired`]; the session then reconnects with resume.
//!
//! An instance runs at most once: Idle -> Running -> Stopped.

use async_trait::async_trait;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::{GatewayError, HeartbeatError};
use crate::gateway::protocol::GatewayPayload;
use crate::gateway::session::SharedSession;

/// Where outbound payloads go (the connection's socket half, or a recorder in tests).
#[async_trait]
pub trait PayloadSink: Send + Sync {
    async fn send(&self, payload: &GatewayPayload) -> Result<(), GatewayError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatState {
    Idle,
    Running,
    Stopped,
}

type AckSlot = Arc<Mutex<Option<oneshot::Sender<()>>>>;

pub struct Heartbeat {
    sink: Arc<dyn PayloadSink>,
    session: SharedSession,
    ack_timeout: Duration,
    state: HeartbeatState,
    pending: AckSlot,
    expired: Arc<Notify>,
    task: Option<JoinHandle<()>>,
}

impl Heartbeat {
    pub fn new(sink: Arc<dyn PayloadSink>, session: SharedSession, ack_timeout: Duration) -> Self {
        Self {
            sink,
            session,
            ack_timeout,
            state: HeartbeatState::Idle,
            pending: Arc::new(Mutex::new(None)),
            expired: Arc::new(Notify::new()),
            task: None,
        }
    }

    pub fn state(&self) -> HeartbeatState {
        self.state
    }

    /// Start the loop. The first heartbeat goes out immediately.
    pub fn start(&mut self, interval: Duration) -> Result<(), HeartbeatError> {
        match self.state {
            HeartbeatState::Idle => {}
            HeartbeatState::Running => return Err(HeartbeatError::AlreadyStarted),
            HeartbeatState::Stopped => return Err(HeartbeatError::Stopped),
        }
        let window = self.ack_timeout.min(interval / 2);
        log::debug!("heartbeat every {:?}, ack window {:?}", interval, window);
        self.task = Some(tokio::spawn(beat_loop(
            self.sink.clone(),
            self.session.clone(),
            self.pending.clone(),
            self.expired.clone(),
            interval,
            window,
        )));
        self.state = HeartbeatState::Running;
        Ok(())
    }

    /// Resolve the outstanding wait. An ack with nothing outstanding is ignored.
    pub fn ack(&self) {
        let tx = self.pending.lock().unwrap_or_else(PoisonError::into_inner).take();
        match tx {
            Some(tx) => {
                let _ = tx.send(());
            }
            None => log::debug!("heartbeat ack with no beat outstanding"),
        }
    }

    /// Send one heartbeat now, outside the schedule.
    pub async fn force_beat(&self) -> Result<(), GatewayError> {
        if self.state == HeartbeatState::Stopped {
            return Err(HeartbeatError::Stopped.into());
        }
        log::debug!("heartbeat requested by gateway");
        self.sink
            .send(&GatewayPayload::heartbeat(self.session.sequence()))
            .await
    }

    /// Completes once the loop has given up on a missing ack (or a failed send).
    pub async fn expired(&self) {
        self.expired.notified().await
    }

    /// Cancel the loop and wait for it to be gone. No heartbeat is sent after this returns.
    pub async fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
        }
        self.pending.lock().unwrap_or_else(PoisonError::into_inner).take();
        self.state = HeartbeatState::Stopped;
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn beat_loop(
    sink: Arc<dyn PayloadSink>,
    session: SharedSession,
    pending: AckSlot,
    expired: Arc<Notify>,
    interval: Duration,
    window: Duration,
) {
    loop {
        let (tx, rx) = oneshot::channel();
        *pending.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx);

        let sent_at = Instant::now();
        if let Err(e) = sink.send(&GatewayPayload::heartbeat(session.sequence())).await {
            log::warn!("heartbeat send failed: {}", e);
            expired.notify_one();
            return;
        }

        match tokio::time::timeout(window, rx).await {
            Ok(Ok(())) => {}
            _ => {
                log::warn!("heartbeat not acknowledged within {:?}", window);
                expired.notify_one();
                return;
            }
        }
        tokio::time::sleep_until(sent_at + interval).await;
    }
}
