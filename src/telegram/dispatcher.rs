// =============================================================================
// Telegram Dispatcher — multi-queue, rate-limit-aware notification sender
// =============================================================================
//
// One independent FIFO queue per purpose (`order`, `price-alert-binance`,
// `price-alert-bybit`, `monitor`, ...), each with its own global pacing
// clock and 429 backoff state. Per-chat pacing is a single `Throttle`
// shared across every queue, per spec §4.9's "a chat must not be hammered
// by two clients" requirement.
// =============================================================================

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::TelegramConfig;
use crate::util::Throttle;

#[derive(Debug, Clone)]
struct QueueItem {
    chat_id: i64,
    text: String,
}

enum SendOutcome {
    Success,
    RateLimited { retry_after_secs: Option<u64> },
    PermanentReject,
    Transient,
}

struct PurposeQueue {
    items: Mutex<VecDeque<QueueItem>>,
    global_backoff_until: Mutex<Option<Instant>>,
    consecutive_429: AtomicU32,
    last_activity: Mutex<Instant>,
    /// Last time this queue (client) sent anything, gating `min_gap_global_ms`.
    last_sent: Mutex<Option<Instant>>,
    bot_token: String,
}

impl PurposeQueue {
    fn new(bot_token: String) -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            global_backoff_until: Mutex::new(None),
            consecutive_429: AtomicU32::new(0),
            last_activity: Mutex::new(Instant::now()),
            last_sent: Mutex::new(None),
            bot_token,
        }
    }

    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    fn backed_off(&self) -> bool {
        match *self.global_backoff_until.lock() {
            Some(until) => Instant::now() < until,
            None => false,
        }
    }

    /// Per-client global pacing (spec §4.9): one message per `min_gap` for
    /// this queue, independent of which chat it targets.
    fn globally_paced(&self, min_gap: Duration) -> bool {
        match *self.last_sent.lock() {
            Some(last) if last.elapsed() < min_gap => true,
            _ => false,
        }
    }

    fn mark_sent(&self) {
        *self.last_sent.lock() = Some(Instant::now());
    }
}

/// Sends human-readable alerts and order notifications without blocking
/// producers or tripping Telegram's own rate limits.
pub struct TelegramDispatcher {
    http: reqwest::Client,
    queues: DashMap<String, Arc<PurposeQueue>>,
    default_token: String,
    chat_pacing: Throttle<i64>,
    config: TelegramConfig,
}

impl TelegramDispatcher {
    pub fn new(default_token: String, config: TelegramConfig) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(config.send_timeout_secs))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            queues: DashMap::new(),
            default_token,
            chat_pacing: Throttle::new(),
            config,
        }
    }

    /// Enqueue a message for `purpose`'s queue, creating it on first use.
    pub fn enqueue(&self, purpose: &str, chat_id: i64, text: String) {
        let queue = self
            .queues
            .entry(purpose.to_string())
            .or_insert_with(|| Arc::new(PurposeQueue::new(self.default_token.clone())))
            .value()
            .clone();
        queue.touch();
        queue.items.lock().push_back(QueueItem { chat_id, text });
    }

    /// One pass over every queue: attempt to drain a single message from
    /// each queue that isn't backed off, gated by per-chat pacing. Intended
    /// to be called repeatedly by [`run_dispatch_loop`].
    async fn tick(&self) {
        let purposes: Vec<String> = self.queues.iter().map(|e| e.key().clone()).collect();
        for purpose in purposes {
            let Some(queue) = self.queues.get(&purpose).map(|e| e.clone()) else { continue };
            if queue.backed_off() {
                continue;
            }
            if queue.globally_paced(Duration::from_millis(self.config.min_gap_global_ms)) {
                continue;
            }

            let next = {
                let mut items = queue.items.lock();
                items.front().cloned()
            };
            let Some(item) = next else { continue };

            if !self.chat_pacing.try_pass(item.chat_id, Duration::from_millis(self.config.per_chat_min_gap_ms)) {
                continue;
            }

            // Pop only after chat pacing admits the send, so a chat-paced
            // item stays at the front for the next tick instead of being
            // silently dropped.
            {
                let mut items = queue.items.lock();
                items.pop_front();
            }
            queue.touch();
            queue.mark_sent();

            match self.send(&queue.bot_token, item.chat_id, &item.text).await {
                SendOutcome::Success => {
                    queue.consecutive_429.store(0, Ordering::SeqCst);
                    debug!(purpose = %purpose, chat_id = item.chat_id, "telegram message sent");
                }
                SendOutcome::RateLimited { retry_after_secs } => {
                    let count = queue.consecutive_429.fetch_add(1, Ordering::SeqCst) + 1;
                    let escalation = count.min(self.config.consecutive_429_cap) as u64;
                    let base_ms = retry_after_secs.unwrap_or(1) * 1000 + self.config.backoff_safety_buffer_ms;
                    let backoff = Duration::from_millis(base_ms * escalation);
                    *queue.global_backoff_until.lock() = Some(Instant::now() + backoff);
                    warn!(purpose = %purpose, backoff_ms = backoff.as_millis(), consecutive = count, "telegram 429, backing off queue");
                    queue.items.lock().push_front(item);
                }
                SendOutcome::PermanentReject => {
                    warn!(purpose = %purpose, chat_id = item.chat_id, "telegram permanently rejected message, discarding");
                }
                SendOutcome::Transient => {
                    let backoff = Duration::from_millis(self.config.transient_backoff_ms);
                    *queue.global_backoff_until.lock() = Some(Instant::now() + backoff);
                    warn!(purpose = %purpose, "telegram transient error, requeueing at front");
                    queue.items.lock().push_front(item);
                }
            }
        }
    }

    async fn send(&self, token: &str, chat_id: i64, text: &str) -> SendOutcome {
        let url = format!("https://api.telegram.org/bot{token}/sendMessage");
        let body = serde_json::json!({ "chat_id": chat_id, "text": text });

        match self.http.post(&url).json(&body).send().await {
            Ok(resp) => {
                let status = resp.status().as_u16();
                let parsed: serde_json::Value = resp.json().await.unwrap_or(serde_json::Value::Null);
                classify_response(status, &parsed)
            }
            Err(e) => {
                warn!(error = %e, "telegram request failed at transport level");
                SendOutcome::Transient
            }
        }
    }

    /// Drop queues that are empty and have been idle longer than
    /// `queue_max_idle_ms`, and reap per-chat pacing entries idle longer
    /// than `chat_max_idle_ms`.
    fn sweep_idle(&self) {
        let queue_idle = Duration::from_millis(self.config.queue_max_idle_ms);
        self.queues.retain(|_, q| {
            let empty = q.items.lock().is_empty();
            let idle = q.last_activity.lock().elapsed() > queue_idle;
            !(empty && idle)
        });

        let chat_idle = Duration::from_millis(self.config.chat_max_idle_ms);
        let reaped = self.chat_pacing.reap_idle(chat_idle);
        if reaped > 0 {
            debug!(reaped, "telegram per-chat pacing entries reaped");
        }
    }

    pub fn queue_depth(&self, purpose: &str) -> usize {
        self.queues.get(purpose).map(|q| q.items.lock().len()).unwrap_or(0)
    }
}

fn classify_response(status: u16, body: &serde_json::Value) -> SendOutcome {
    if status == 200 && body.get("ok").and_then(|v| v.as_bool()).unwrap_or(false) {
        return SendOutcome::Success;
    }
    if status == 429 {
        let retry_after_secs = body
            .get("parameters")
            .and_then(|p| p.get("retry_after"))
            .and_then(|v| v.as_u64());
        return SendOutcome::RateLimited { retry_after_secs };
    }
    if status == 400 || status == 403 {
        return SendOutcome::PermanentReject;
    }
    SendOutcome::Transient
}

/// Background task driving every queue's drain loop. A short fixed tick
/// (driven by `per_chat_min_gap_ms`'s rough order of magnitude, floored at
/// 50 ms) keeps latency low without busy-spinning.
pub async fn run_dispatch_loop(dispatcher: Arc<TelegramDispatcher>) {
    let tick_period = Duration::from_millis(50);
    let mut sweep_counter: u32 = 0;
    let mut interval = tokio::time::interval(tick_period);
    loop {
        interval.tick().await;
        dispatcher.tick().await;

        sweep_counter += 1;
        if sweep_counter >= 200 {
            sweep_counter = 0;
            dispatcher.sweep_idle();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> TelegramConfig {
        TelegramConfig {
            min_gap_global_ms: 1000,
            per_chat_min_gap_ms: 3000,
            queue_max_idle_ms: 1_800_000,
            chat_max_idle_ms: 21_600_000,
            backoff_safety_buffer_ms: 5000,
            consecutive_429_cap: 5,
            send_timeout_secs: 10,
            transient_backoff_ms: 5000,
        }
    }

    #[test]
    fn classify_success() {
        let body = serde_json::json!({ "ok": true });
        assert!(matches!(classify_response(200, &body), SendOutcome::Success));
    }

    #[test]
    fn classify_rate_limited_extracts_retry_after() {
        let body = serde_json::json!({ "ok": false, "parameters": { "retry_after": 2 } });
        match classify_response(429, &body) {
            SendOutcome::RateLimited { retry_after_secs } => assert_eq!(retry_after_secs, Some(2)),
            _ => panic!("expected rate limited"),
        }
    }

    #[test]
    fn classify_permanent_rejects() {
        let body = serde_json::json!({ "ok": false });
        assert!(matches!(classify_response(400, &body), SendOutcome::PermanentReject));
        assert!(matches!(classify_response(403, &body), SendOutcome::PermanentReject));
    }

    #[test]
    fn classify_other_is_transient() {
        let body = serde_json::json!({ "ok": false });
        assert!(matches!(classify_response(500, &body), SendOutcome::Transient));
    }

    #[tokio::test]
    async fn enqueue_tracks_queue_depth() {
        let dispatcher = TelegramDispatcher::new("token".into(), config());
        dispatcher.enqueue("order", 1, "hi".into());
        dispatcher.enqueue("order", 2, "there".into());
        assert_eq!(dispatcher.queue_depth("order"), 2);
        assert_eq!(dispatcher.queue_depth("monitor"), 0);
    }

    #[test]
    fn global_pacing_blocks_until_gap_elapses() {
        let queue = PurposeQueue::new("token".into());
        // Never sent yet -> not paced.
        assert!(!queue.globally_paced(Duration::from_millis(50)));
        queue.mark_sent();
        assert!(queue.globally_paced(Duration::from_millis(50)));
        std::thread::sleep(Duration::from_millis(60));
        assert!(!queue.globally_paced(Duration::from_millis(50)));
    }

    #[test]
    fn s5_429_storm_backoff_matches_spec_example() {
        // retry_after=2s, consecutive_count=2 => (2000+5000)*2 = 14000ms.
        let retry_after_secs = 2u64;
        let count = 2u64;
        let backoff_ms = (retry_after_secs * 1000 + 5000) * count;
        assert_eq!(backoff_ms, 14_000);
    }
}
