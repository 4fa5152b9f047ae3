//! Sliding-window request and token limiter shared by the workers of one client

use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

const WINDOW: Duration = Duration::from_secs(60);

/// Per-minute request and token budget
///
/// `rpm == 0` or `tpm == 0` disables that half of the limit.
pub struct RateLimiter {
    requests_per_minute: u32,
    tokens_per_minute: u32,
    last_requests: Mutex<VecDeque<Instant>>,
    token_usage: Mutex<VecDeque<(Instant, u32)>>,
}

impl RateLimiter {
    pub fn new(requests_per_minute: u32, tokens_per_minute: u32) -> Self {
        Self {
            requests_per_minute,
            tokens_per_minute,
            last_requests: Mutex::new(VecDeque::new()),
            token_usage: Mutex::new(VecDeque::new()),
        }
    }

    /// Wait until both budgets allow another request, then count it
    pub async fn acquire(&self) {
        loop {
            if let Some(wait) = self.token_wait().await {
                tracing::debug!("Token budget exhausted, waiting {:?}", wait);
                tokio::time::sleep(wait).await;
                continue;
            }

            let mut last = self.last_requests.lock().await;
            let now = Instant::now();
            prune(&mut *last, now, |t| *t);

            if self.requests_per_minute > 0 && last.len() >= self.requests_per_minute as usize {
                let wait = last
                    .front()
                    .map(|oldest| WINDOW.saturating_sub(now.duration_since(*oldest)))
                    .unwrap_or_default()
                    + Duration::from_millis(10);
                drop(last);
                tracing::debug!("Request budget exhausted, waiting {:?}", wait);
                tokio::time::sleep(wait).await;
                continue;
            }

            last.push_back(now);
            return;
        }
    }

    /// Time until the oldest token entry leaves the window, if over budget
    async fn token_wait(&self) -> Option<Duration> {
        if self.tokens_per_minute == 0 {
            return None;
        }
        let mut usage = self.token_usage.lock().await;
        let now = Instant::now();
        prune(&mut *usage, now, |(t, _)| *t);

        let used: u64 = usage.iter().map(|(_, n)| *n as u64).sum();
        if used < self.tokens_per_minute as u64 {
            return None;
        }
        usage
            .front()
            .map(|(oldest, _)| WINDOW.saturating_sub(now.duration_since(*oldest)) + Duration::from_millis(10))
    }

    /// Record token usage for rate limiting
    pub async fn record_tokens(&self, tokens: u32) {
        if tokens == 0 {
            return;
        }
        let mut usage = self.token_usage.lock().await;
        let now = Instant::now();
        prune(&mut *usage, now, |(t, _)| *t);
        usage.push_back((now, tokens));
    }

    /// Tokens recorded in the last minute
    pub async fn current_token_usage(&self) -> u32 {
        let mut usage = self.token_usage.lock().await;
        prune(&mut *usage, Instant::now(), |(t, _)| *t);
        usage.iter().map(|(_, t)| t).sum()
    }
}

fn prune<T>(entries: &mut VecDeque<T>, now: Instant, at: impl Fn(&T) -> Instant) {
    while let Some(front) = entries.front() {
        if now.duration_since(at(front)) > WINDOW {
            entries.pop_front();
        } else {
            break;
        }
    }
}
