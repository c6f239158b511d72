//! Cancellable timers that post events into the connection queue.
//!
//! Each slot stamps the events it posts with a generation number and bumps
//! it on every cancel or re-arm, so an event already queued by a timer
//! that was cancelled afterwards is recognised as stale and dropped.

use std::time::Duration;

use tokio::{sync::mpsc, task::JoinHandle, time};

#[derive(Debug, Default)]
pub struct TimerSlot {
    handle: Option<JoinHandle<()>>,
    generation: u64,
}

impl TimerSlot {
    /// Fire `event` once after `delay`, replacing whatever was armed.
    pub fn arm_once<E, F>(&mut self, delay: Duration, tx: mpsc::Sender<E>, event: F)
    where
        E: Send + 'static,
        F: FnOnce(u64) -> E + Send + 'static,
    {
        self.cancel();
        let generation = self.generation;
        self.handle = Some(tokio::spawn(async move {
            time::sleep(delay).await;
            let _ = tx.send(event(generation)).await;
        }));
    }

    /// Fire `event` repeatedly; `next_delay` is asked before every wait.
    pub fn arm_repeating<E, D, F>(&mut self, next_delay: D, tx: mpsc::Sender<E>, event: F)
    where
        E: Send + 'static,
        D: Fn() -> Duration + Send + 'static,
        F: Fn(u64) -> E + Send + 'static,
    {
        self.cancel();
        let generation = self.generation;
        self.handle = Some(tokio::spawn(async move {
            loop {
                time::sleep(next_delay()).await;
                if tx.send(event(generation)).await.is_err() {
                    break;
                }
            }
        }));
    }

    /// Idempotent; cancelling an unarmed or already fired slot is a no-op.
    pub fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
        self.generation += 1;
    }

    pub fn is_armed(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.handle.is_some() && self.generation == generation
    }
}

impl Drop for TimerSlot {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancelled_timer_never_fires() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut slot = TimerSlot::default();
        slot.arm_once(Duration::from_millis(20), tx.clone(), |g| g);
        slot.cancel();
        slot.cancel();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(rx.try_recv().is_err());
        assert!(!slot.is_armed());
    }

    #[tokio::test]
    async fn rearm_makes_previous_generation_stale() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut slot = TimerSlot::default();
        slot.arm_once(Duration::from_millis(5), tx.clone(), |g| g);
        let first = rx.recv().await.unwrap();
        assert!(slot.is_current(first));

        slot.arm_once(Duration::from_millis(5), tx, |g| g);
        assert!(!slot.is_current(first));
        let second = rx.recv().await.unwrap();
        assert!(slot.is_current(second));
    }

    #[tokio::test]
    async fn repeating_timer_keeps_firing_until_cancelled() {
        let (tx, mut rx) = mpsc::channel(16);
        let mut slot = TimerSlot::default();
        slot.arm_repeating(|| Duration::from_millis(5), tx, |g| g);
        let a = rx.recv().await.unwrap();
        let b = rx.recv().await.unwrap();
        assert_eq!(a, b);
        slot.cancel();
        assert!(!slot.is_current(a));
    }
}
