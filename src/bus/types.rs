use crate::core::types::{
    Decision, DecisionOutcome, LedgerUpdate, PerformanceSnapshot, SentimentReading,
    ThresholdUpdate, TradeBatch,
};
use anyhow::Result;
use async_trait::async_trait;
use std::fmt::Debug;
use std::sync::Arc;
use tokio::sync::broadcast;

// ---------- Topic trait (broadcast semantics) ----------
#[async_trait::async_trait]
pub trait Topic<T>: Sync + Send + 'static {
    /// Publish a message to all subscribers.
    async fn publish(&self, msg: T) -> Result<()>;

    /// Subscribe to the stream (each subscriber has an independent cursor).
    fn subscribe(&self) -> broadcast::Receiver<Arc<T>>;
}

// ---------- Concrete broadcast topic ----------
// --- Broadcast topic: 1->N fanout (lossy under lag). Wrap payloads in Arc<T> to avoid Clone on T.
pub struct BroadcastTopic<T: Clone + Send + Sync + 'static> {
    tx: broadcast::Sender<Arc<T>>,
}

impl<T: Clone + Send + Sync + 'static> BroadcastTopic<T> {
    pub fn with_capacity(cap: usize) -> Self {
        let (tx, _rx) = broadcast::channel(cap);
        Self { tx }
    }
}

#[async_trait]
impl<T: Debug + Clone + Send + Sync + 'static> Topic<T> for BroadcastTopic<T> {
    async fn publish(&self, msg: T) -> Result<()> {
        // Non-blocking; errors only when no receivers (we can ignore or log)
        let _ = self.tx.send(Arc::new(msg));
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<Arc<T>> {
        self.tx.subscribe()
    }
}

#[derive(Clone)]
pub struct Bus {
    pub sentiment_readings: Arc<dyn Topic<SentimentReading>>,
    pub trade_batches: Arc<dyn Topic<TradeBatch>>,
    pub ledger_updates: Arc<dyn Topic<LedgerUpdate>>,
    pub decisions: Arc<dyn Topic<Decision>>,
    pub outcomes: Arc<dyn Topic<DecisionOutcome>>,
    pub threshold_updates: Arc<dyn Topic<ThresholdUpdate>>,
    pub performance: Arc<dyn Topic<PerformanceSnapshot>>,
}

impl Bus {
    pub fn new() -> Self {
        let cap = 1024;

        Self {
            sentiment_readings: Arc::new(BroadcastTopic::<SentimentReading>::with_capacity(cap)),
            trade_batches: Arc::new(BroadcastTopic::<TradeBatch>::with_capacity(cap)),
            ledger_updates: Arc::new(BroadcastTopic::<LedgerUpdate>::with_capacity(cap)),
            decisions: Arc::new(BroadcastTopic::<Decision>::with_capacity(cap)),
            outcomes: Arc::new(BroadcastTopic::<DecisionOutcome>::with_capacity(cap)),
            threshold_updates: Arc::new(BroadcastTopic::<ThresholdUpdate>::with_capacity(cap)),
            performance: Arc::new(BroadcastTopic::<PerformanceSnapshot>::with_capacity(cap)),
        }
    }
}
