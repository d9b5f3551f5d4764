//! Per-source event lanes.
//!
//! Every source chat gets one queue drained by one task, so events from a
//! source are handled in arrival order while different sources run
//! concurrently. A failed event is logged and the lane moves on.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::error::RelayError;
use crate::relay::events::{EventReport, RelayEvent};
use crate::relay::orchestrator::Relay;
use crate::types::ChatId;

struct Lane {
    tx: mpsc::Sender<RelayEvent>,
    handle: JoinHandle<()>,
}

/// Routes events into per-source lanes, creating lanes on first use.
pub struct LaneRouter {
    relay: Arc<Relay>,
    capacity: usize,
    lanes: RwLock<HashMap<ChatId, Lane>>,
    reports: Option<mpsc::UnboundedSender<EventReport>>,
}

impl LaneRouter {
    /// `capacity` bounds each lane's backlog.
    ///
    /// When a lane is full, [`LaneRouter::submit`] for that source waits until
    /// the lane drains. Submits for other sources never wait on it, but a
    /// caller that awaits the blocked submit stalls along with it.
    pub fn new(relay: Arc<Relay>, capacity: usize) -> Self {
        Self {
            relay,
            capacity: capacity.max(1),
            lanes: RwLock::new(HashMap::new()),
            reports: None,
        }
    }

    /// Also publish every successful event report on `tx`.
    pub fn with_reports(mut self, tx: mpsc::UnboundedSender<EventReport>) -> Self {
        self.reports = Some(tx);
        self
    }

    /// Queue an event on its source's lane, waiting while that lane is full.
    pub async fn submit(&self, event: RelayEvent) -> Result<(), RelayError> {
        let chat = event.source_chat();
        let tx = self.lane(chat).await;
        tx.send(event).await.map_err(|_| RelayError::Closed)
    }

    async fn lane(&self, chat: ChatId) -> mpsc::Sender<RelayEvent> {
        if let Some(lane) = self.lanes.read().await.get(&chat) {
            if !lane.tx.is_closed() {
                return lane.tx.clone();
            }
        }

        let mut lanes = self.lanes.write().await;
        if let Some(lane) = lanes.get(&chat) {
            if !lane.tx.is_closed() {
                return lane.tx.clone();
            }
        }

        let (tx, rx) = mpsc::channel(self.capacity);
        let handle = tokio::spawn(run_lane(
            chat,
            rx,
            Arc::clone(&self.relay),
            self.reports.clone(),
        ));
        lanes.insert(
            chat,
            Lane {
                tx: tx.clone(),
                handle,
            },
        );
        info!(source = chat, "Opened source lane");
        tx
    }

    /// Number of open lanes.
    pub async fn lanes(&self) -> usize {
        self.lanes.read().await.len()
    }

    /// Close every lane and wait for queued events to drain.
    pub async fn shutdown(&self) {
        let lanes: Vec<Lane> = self.lanes.write().await.drain().map(|(_, l)| l).collect();
        for lane in lanes {
            drop(lane.tx);
            if let Err(e) = lane.handle.await {
                error!(error = %e, "Lane task failed");
            }
        }
    }
}

async fn run_lane(
    chat: ChatId,
    mut rx: mpsc::Receiver<RelayEvent>,
    relay: Arc<Relay>,
    reports: Option<mpsc::UnboundedSender<EventReport>>,
) {
    while let Some(event) = rx.recv().await {
        match relay.handle(&event).await {
            Ok(report) => {
                if let Some(ref tx) = reports {
                    let _ = tx.send(report);
                }
            }
            Err(e) => error!(
                source = chat,
                kind = %event.kind(),
                error = %e,
                "Event failed; awaiting redelivery"
            ),
        }
    }
    info!(source = chat, "Source lane closed");
}
