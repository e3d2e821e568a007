use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

/// Token bucket refilled by a background task; paces outbound requests.
pub struct RateLimiter {
    sem: Arc<Semaphore>,
}

impl Clone for RateLimiter {
    fn clone(&self) -> Self { RateLimiter { sem: self.sem.clone() } }
}

impl RateLimiter {
    /// Must be called from within a tokio runtime.
    pub fn new(tokens_per_sec: u32) -> Self {
        let sem = Arc::new(Semaphore::new(1));
        let sem_bg = Arc::downgrade(&sem);
        let interval_ms = (1000u32 / tokens_per_sec.max(1)) as u64;
        tokio::spawn(async move {
            let mut t = tokio::time::interval(Duration::from_millis(interval_ms.max(1)));
            t.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            t.tick().await;
            loop {
                t.tick().await;
                // stop refilling once every limiter handle is gone
                let Some(sem) = sem_bg.upgrade() else { break };
                if sem.available_permits() == 0 {
                    sem.add_permits(1);
                }
            }
        });
        RateLimiter { sem }
    }

    pub async fn acquire(&self) {
        if let Ok(permit) = self.sem.acquire().await {
            permit.forget();
        }
    }
}
