use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// A periodic task with a single cancel handle.
///
/// The first tick fires one `period` after spawning. Ticks missed while the
/// runtime was busy are skipped, not replayed. `cancel` is idempotent, and
/// dropping the task cancels it.
pub struct RepeatingTask {
    task: JoinHandle<()>,
}

impl RepeatingTask {
    /// Calls `on_tick` every `period` until it returns `false` or the task is
    /// cancelled.
    pub fn spawn<F>(period: Duration, mut on_tick: F) -> Self
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let task = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut interval = tokio::time::interval_at(start, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                if !on_tick() {
                    return;
                }
            }
        });
        Self { task }
    }

    pub fn cancel(&self) {
        self.task.abort();
    }

    /// True once cancelled or stopped by its callback.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for RepeatingTask {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn settle() {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_every_period_until_cancelled() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let task = RepeatingTask::spawn(Duration::from_secs(5), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            true
        });

        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 0, "no immediate tick");

        tokio::time::sleep(Duration::from_secs(11)).await;
        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 2);

        task.cancel();
        task.cancel();
        tokio::time::sleep(Duration::from_secs(30)).await;
        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert!(task.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn callback_can_stop_the_task() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let task = RepeatingTask::spawn(Duration::from_secs(1), move || {
            counter.fetch_add(1, Ordering::SeqCst) < 2
        });
        tokio::time::sleep(Duration::from_secs(10)).await;
        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert!(task.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_cancels() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let task = RepeatingTask::spawn(Duration::from_secs(1), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            true
        });
        drop(task);
        tokio::time::sleep(Duration::from_secs(5)).await;
        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
