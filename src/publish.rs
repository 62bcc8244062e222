use crate::config::Config;
use crate::error::NoUpdateKind;
use crate::pipeline::CycleOutcome;
use crate::reading::CorrectedReading;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::Client;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant, MissedTickBehavior};

/// Receives the outcome of every polling cycle.
#[async_trait]
pub trait ReadingSink: Send + Sync {
    async fn publish(&self, outcome: &CycleOutcome);
}

#[derive(Debug, Default)]
pub struct PollStats {
    pub cycles: AtomicU64,
    pub updates: AtomicU64,
    pub source_failures: AtomicU64,
    pub stale_readings: AtomicU64,
    pub insane_readings: AtomicU64,
    pub last_cycle_unix_ms: AtomicU64,
    pub last_update_unix_ms: AtomicU64,
    pub last_error: Mutex<Option<String>>,
}

impl PollStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_error(&self, err: impl Into<String>) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = Some(err.into());
        }
    }

    pub fn clear_error(&self) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = None;
        }
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            cycles: self.cycles.load(Ordering::Relaxed),
            updates: self.updates.load(Ordering::Relaxed),
            source_failures: self.source_failures.load(Ordering::Relaxed),
            stale_readings: self.stale_readings.load(Ordering::Relaxed),
            insane_readings: self.insane_readings.load(Ordering::Relaxed),
            last_cycle_at: unix_ms_to_time(self.last_cycle_unix_ms.load(Ordering::Relaxed)),
            last_update_at: unix_ms_to_time(self.last_update_unix_ms.load(Ordering::Relaxed)),
            last_error: self.last_error.lock().ok().and_then(|guard| guard.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub cycles: u64,
    pub updates: u64,
    pub source_failures: u64,
    pub stale_readings: u64,
    pub insane_readings: u64,
    pub last_cycle_at: Option<DateTime<Utc>>,
    pub last_update_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

fn unix_ms_to_time(ms: u64) -> Option<DateTime<Utc>> {
    if ms == 0 {
        return None;
    }
    Utc.timestamp_millis_opt(ms as i64).single()
}

/// Latest published value plus cycle counters, shared with the HTTP surface.
#[derive(Debug, Default)]
pub struct LatestReading {
    latest: RwLock<Option<CorrectedReading>>,
    stats: PollStats,
}

impl LatestReading {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn stats(&self) -> &PollStats {
        &self.stats
    }

    /// Last reading, but only while `observed_at + window` has not passed.
    pub fn current(&self, now: DateTime<Utc>, window: Duration) -> Option<CorrectedReading> {
        let window = chrono::Duration::from_std(window).ok()?;
        let guard = self.latest.read().ok()?;
        guard
            .as_ref()
            .filter(|reading| reading.observed_at + window >= now)
            .cloned()
    }
}

#[async_trait]
impl ReadingSink for LatestReading {
    async fn publish(&self, outcome: &CycleOutcome) {
        let now_ms = Utc::now().timestamp_millis() as u64;
        self.stats.cycles.fetch_add(1, Ordering::Relaxed);
        self.stats.last_cycle_unix_ms.store(now_ms, Ordering::Relaxed);

        match outcome {
            CycleOutcome::Updated(reading) => {
                if let Ok(mut guard) = self.latest.write() {
                    *guard = Some(reading.clone());
                }
                self.stats.updates.fetch_add(1, Ordering::Relaxed);
                self.stats.last_update_unix_ms.store(now_ms, Ordering::Relaxed);
                self.stats.clear_error();
            }
            CycleOutcome::NoUpdate(reason) => {
                let counter = match reason.kind() {
                    NoUpdateKind::AllSourcesFailed => &self.stats.source_failures,
                    NoUpdateKind::StaleReading => &self.stats.stale_readings,
                    NoUpdateKind::InsaneReading => &self.stats.insane_readings,
                };
                counter.fetch_add(1, Ordering::Relaxed);
                self.stats.record_error(reason.to_string());
            }
        }
    }
}

/// One entry of a feed batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum FeedEvent {
    Reading(CorrectedReading),
    /// Emitted when the unit stops producing usable readings, and again when
    /// the cause changes.
    NoUpdate {
        kind: NoUpdateKind,
        reason: String,
        at: DateTime<Utc>,
    },
}

/// What was last forwarded, so repeated polls of the same state stay local.
#[derive(Debug, Default)]
struct ForwardState {
    last_observed_at: Option<DateTime<Utc>>,
    last_no_update: Option<NoUpdateKind>,
}

impl ForwardState {
    /// Units refresh their sample far less often than they are polled; a
    /// reading is forwarded only when its sample time moves forward.
    fn admit(&mut self, outcome: &CycleOutcome, now: DateTime<Utc>) -> Option<FeedEvent> {
        match outcome {
            CycleOutcome::Updated(reading) => {
                self.last_no_update = None;
                if self
                    .last_observed_at
                    .is_some_and(|last| reading.observed_at <= last)
                {
                    return None;
                }
                self.last_observed_at = Some(reading.observed_at);
                Some(FeedEvent::Reading(reading.clone()))
            }
            CycleOutcome::NoUpdate(reason) => {
                let kind = reason.kind();
                if self.last_no_update == Some(kind) {
                    return None;
                }
                self.last_no_update = Some(kind);
                Some(FeedEvent::NoUpdate {
                    kind,
                    reason: reason.to_string(),
                    at: now,
                })
            }
        }
    }
}

/// Forwards new samples and outage transitions to a downstream ingest
/// endpoint in batches.
pub struct FeedPublisher {
    tx: mpsc::Sender<FeedEvent>,
    state: Mutex<ForwardState>,
}

#[derive(Debug, Clone)]
struct FeedTarget {
    url: String,
    token: Option<String>,
}

#[derive(Serialize)]
struct FeedPayload<'a> {
    items: &'a [FeedEvent],
}

impl FeedPublisher {
    pub fn new(config: &Config) -> Option<Self> {
        let target = FeedTarget {
            url: config.feed_url.clone()?,
            token: config.feed_token.clone(),
        };
        let (tx, rx) = mpsc::channel(config.feed_queue.max(1));
        let batch_size = config.feed_batch_size.max(1);
        let flush_interval = config.feed_flush_interval();

        tokio::spawn(run_feed(rx, target, batch_size, flush_interval));

        Some(Self::from_sender(tx))
    }

    fn from_sender(tx: mpsc::Sender<FeedEvent>) -> Self {
        Self {
            tx,
            state: Mutex::new(ForwardState::default()),
        }
    }

    fn enqueue(&self, event: FeedEvent) {
        if let Err(err) = self.tx.try_send(event) {
            tracing::warn!(error=%err, "feed queue full; dropping event");
        }
    }
}

#[async_trait]
impl ReadingSink for FeedPublisher {
    async fn publish(&self, outcome: &CycleOutcome) {
        let event = match self.state.lock() {
            Ok(mut state) => state.admit(outcome, Utc::now()),
            Err(_) => return,
        };
        if let Some(event) = event {
            self.enqueue(event);
        }
    }
}

/// Drains the queue, posting whenever `batch_size` events are buffered or
/// `flush_interval` has passed since the last tick. The first tick is one
/// interval after start.
async fn run_feed(
    mut rx: mpsc::Receiver<FeedEvent>,
    target: FeedTarget,
    batch_size: usize,
    flush_interval: Duration,
) {
    let client = Client::new();
    let mut ticker = tokio::time::interval_at(Instant::now() + flush_interval, flush_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut buffer: Vec<FeedEvent> = Vec::with_capacity(batch_size);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(err) = flush_feed(&client, &target, &mut buffer).await {
                    tracing::warn!(error=%err, url = %target.url, "feed flush failed");
                }
            }
            msg = rx.recv() => {
                let Some(event) = msg else {
                    if let Err(err) = flush_feed(&client, &target, &mut buffer).await {
                        tracing::warn!(error=%err, url = %target.url, "final feed flush failed");
                    }
                    break;
                };
                buffer.push(event);
                if buffer.len() >= batch_size {
                    if let Err(err) = flush_feed(&client, &target, &mut buffer).await {
                        tracing::warn!(error=%err, url = %target.url, "feed flush failed");
                    }
                }
            }
        }
    }

    tracing::debug!("feed forwarder stopped");
}

/// Posts the buffered events as `{"items": [...]}` and clears the buffer,
/// whether or not the POST succeeds.
async fn flush_feed(
    client: &Client,
    target: &FeedTarget,
    buffer: &mut Vec<FeedEvent>,
) -> Result<(), reqwest::Error> {
    if buffer.is_empty() {
        return Ok(());
    }

    let items = std::mem::take(buffer);
    let mut request = client.post(&target.url).json(&FeedPayload { items: &items });
    if let Some(token) = target.token.as_deref() {
        request = request.header("X-Purple-Feed-Token", token);
    }

    let response = request.send().await?;
    if !response.status().is_success() {
        tracing::warn!(status=%response.status(), batch = items.len(), "feed returned non-success");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aqi::Category;
    use crate::endpoint::{SourceId, SourceRole};
    use crate::error::{NoUpdate, SourceFailure};
    use axum::extract::State;
    use axum::http::HeaderMap;
    use axum::routing::post;
    use axum::{Json, Router};
    use tokio::net::TcpListener;

    fn corrected(observed_at: DateTime<Utc>) -> CorrectedReading {
        CorrectedReading {
            source: SourceId {
                role: SourceRole::Proxy,
                host: "proxy1".to_string(),
                port: 8000,
            },
            observed_at,
            pm2_5_epa: 22.25,
            aqi: 72,
            aqi_color: 0xFFFF00,
            category: Category::Moderate,
            channel_a_aqi: None,
            channel_b_aqi: None,
            pm1_0: None,
            pm10_0: None,
            temperature_f: 70.0,
            humidity: 50.0,
        }
    }

    #[tokio::test]
    async fn latest_reading_honours_publish_window() {
        let sink = LatestReading::new();
        let observed = Utc::now() - chrono::Duration::seconds(60);
        sink.publish(&CycleOutcome::Updated(corrected(observed))).await;

        let now = Utc::now();
        assert!(sink.current(now, Duration::from_secs(120)).is_some());
        assert!(sink.current(now, Duration::from_secs(30)).is_none());
    }

    #[tokio::test]
    async fn no_update_keeps_previous_value_and_counts_reason() {
        let sink = LatestReading::new();
        let now = Utc::now();
        sink.publish(&CycleOutcome::Updated(corrected(now))).await;
        sink.publish(&CycleOutcome::NoUpdate(NoUpdate::AllSourcesFailed(
            SourceFailure { failures: vec![] },
        )))
        .await;

        let snapshot = sink.stats().snapshot();
        assert_eq!(snapshot.cycles, 2);
        assert_eq!(snapshot.updates, 1);
        assert_eq!(snapshot.source_failures, 1);
        assert_eq!(
            snapshot.last_error.as_deref(),
            Some("all sources failed: no enabled sources")
        );
        assert_eq!(
            sink.current(now, Duration::from_secs(120)).map(|r| r.aqi),
            Some(72)
        );
    }

    fn stale(age_secs: f64) -> CycleOutcome {
        CycleOutcome::NoUpdate(NoUpdate::StaleReading {
            source: corrected(Utc::now()).source,
            observed_at: Utc::now(),
            age_secs,
            max_age_secs: 120.0,
        })
    }

    #[tokio::test]
    async fn feed_forwards_new_samples_and_outage_transitions() {
        let (tx, mut rx) = mpsc::channel(16);
        let feed = FeedPublisher::from_sender(tx);
        let first = Utc::now() - chrono::Duration::seconds(30);
        let second = Utc::now();

        feed.publish(&CycleOutcome::Updated(corrected(first))).await;
        // Same sample polled again before the unit refreshed.
        feed.publish(&CycleOutcome::Updated(corrected(first))).await;
        feed.publish(&stale(200.0)).await;
        feed.publish(&stale(215.0)).await;
        feed.publish(&CycleOutcome::NoUpdate(NoUpdate::AllSourcesFailed(
            SourceFailure { failures: vec![] },
        )))
        .await;
        feed.publish(&CycleOutcome::Updated(corrected(second))).await;
        feed.publish(&stale(200.0)).await;
        drop(feed);

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        let summary: Vec<String> = events
            .iter()
            .map(|event| match event {
                FeedEvent::Reading(reading) => format!("reading@{}", reading.observed_at),
                FeedEvent::NoUpdate { kind, .. } => format!("{kind:?}"),
            })
            .collect();
        assert_eq!(
            summary,
            vec![
                format!("reading@{first}"),
                "StaleReading".to_string(),
                "AllSourcesFailed".to_string(),
                format!("reading@{second}"),
                "StaleReading".to_string(),
            ]
        );
    }

    #[test]
    fn feed_events_are_tagged() {
        let reading = serde_json::to_value(FeedEvent::Reading(corrected(Utc::now()))).unwrap();
        assert_eq!(reading["event"], "reading");
        assert_eq!(reading["aqi"], 72);

        let at = Utc::now();
        let outage = serde_json::to_value(FeedEvent::NoUpdate {
            kind: NoUpdateKind::InsaneReading,
            reason: "channels disagree".to_string(),
            at,
        })
        .unwrap();
        assert_eq!(outage["event"], "no_update");
        assert_eq!(outage["kind"], "insane_reading");
    }

    struct FeedSink {
        url: String,
        bodies: mpsc::UnboundedReceiver<(Option<String>, serde_json::Value)>,
    }

    async fn capture(
        State(tx): State<mpsc::UnboundedSender<(Option<String>, serde_json::Value)>>,
        headers: HeaderMap,
        Json(body): Json<serde_json::Value>,
    ) -> &'static str {
        let token = headers
            .get("X-Purple-Feed-Token")
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let _ = tx.send((token, body));
        "ok"
    }

    async fn feed_sink() -> FeedSink {
        let (tx, bodies) = mpsc::unbounded_channel();
        let app = Router::new().route("/ingest", post(capture)).with_state(tx);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        FeedSink {
            url: format!("http://{addr}/ingest"),
            bodies,
        }
    }

    fn reading_event(offset_secs: i64) -> FeedEvent {
        FeedEvent::Reading(corrected(Utc::now() + chrono::Duration::seconds(offset_secs)))
    }

    #[tokio::test(start_paused = true)]
    async fn full_batch_is_posted_without_waiting_for_the_interval() {
        let mut sink = feed_sink().await;
        let (tx, rx) = mpsc::channel(8);
        let target = FeedTarget {
            url: sink.url.clone(),
            token: Some("secret".to_string()),
        };
        for offset in 0..3 {
            tx.try_send(reading_event(offset)).unwrap();
        }
        tokio::spawn(run_feed(rx, target, 2, Duration::from_secs(3600)));

        let (token, body) = sink.bodies.recv().await.unwrap();
        assert_eq!(token.as_deref(), Some("secret"));
        let items = body["items"].as_array().unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0]["event"], "reading");
        assert_eq!(items[0]["source"]["host"], "proxy1");

        // The odd one out waits for the ticker.
        let (_, body) = sink.bodies.recv().await.unwrap();
        assert_eq!(body["items"].as_array().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn partial_batch_is_posted_on_the_interval() {
        let mut sink = feed_sink().await;
        let (tx, rx) = mpsc::channel(8);
        let target = FeedTarget {
            url: sink.url.clone(),
            token: None,
        };
        let started = Instant::now();
        tx.try_send(reading_event(0)).unwrap();
        tokio::spawn(run_feed(rx, target, 10, Duration::from_secs(5)));

        let (token, body) = sink.bodies.recv().await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert!(token.is_none());
        assert_eq!(body["items"].as_array().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn closing_the_queue_flushes_what_is_left() {
        let mut sink = feed_sink().await;
        let (tx, rx) = mpsc::channel(8);
        let target = FeedTarget {
            url: sink.url.clone(),
            token: None,
        };
        tx.try_send(reading_event(0)).unwrap();
        drop(tx);
        run_feed(rx, target, 10, Duration::from_secs(3600)).await;

        let (_, body) = sink.bodies.recv().await.unwrap();
        assert_eq!(body["items"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn empty_buffer_is_not_posted() {
        let client = Client::new();
        let target = FeedTarget {
            url: "http://127.0.0.1:9/ingest".to_string(),
            token: None,
        };
        // Nothing listens here; an attempted request would fail.
        flush_feed(&client, &target, &mut Vec::new()).await.unwrap();
    }
}
