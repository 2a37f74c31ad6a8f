// src/queue.rs
//! In-process FIFO queues between pipeline stages. Each queue is
//! FIFO-per-producer; consumers suspend on `recv` until work arrives or the
//! sending side is dropped at shutdown.

use tokio::sync::{mpsc, oneshot};

/// Content submitted for moderation.
#[derive(Debug, Clone)]
pub struct ModerationRequest {
    pub subscription_id: Option<i64>,
    pub title: String,
    pub body: String,
    pub url: String,
}

/// Outcome of a moderation classification.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ModerationDecision {
    pub allowed: bool,
    pub categories: Vec<String>,
    pub reason: String,
}

/// A unit of work on the moderation queue. The reply channel makes the call
/// synchronous from the submitter's perspective.
pub struct ModerationJob {
    pub request: ModerationRequest,
    pub reply: oneshot::Sender<ModerationDecision>,
}

/// An approved item handed to the insight extractor.
#[derive(Debug, Clone)]
pub struct InsightJob {
    pub item_id: i64,
    pub subscription_id: i64,
}

/// Compact notification pushed to the dispatch aggregator.
#[derive(Debug, Clone)]
pub struct DispatchNotice {
    pub insight_id: i64,
    pub subscription_id: i64,
    pub owner: String,
    pub score: f64,
    pub summary: String,
}

pub struct Queues {
    pub moderation_tx: mpsc::UnboundedSender<ModerationJob>,
    pub moderation_rx: mpsc::UnboundedReceiver<ModerationJob>,
    pub insight_tx: mpsc::UnboundedSender<InsightJob>,
    pub insight_rx: mpsc::UnboundedReceiver<InsightJob>,
    pub dispatch_tx: mpsc::UnboundedSender<DispatchNotice>,
    pub dispatch_rx: mpsc::UnboundedReceiver<DispatchNotice>,
}

impl Queues {
    pub fn new() -> Self {
        let (moderation_tx, moderation_rx) = mpsc::unbounded_channel();
        let (insight_tx, insight_rx) = mpsc::unbounded_channel();
        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();
        Self {
            moderation_tx,
            moderation_rx,
            insight_tx,
            insight_rx,
            dispatch_tx,
            dispatch_rx,
        }
    }
}

impl Default for Queues {
    fn default() -> Self {
        Self::new()
    }
}
