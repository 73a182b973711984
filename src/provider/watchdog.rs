//! One-shot stop watchdog.
//!
//! Armed when an operation is asked to stop. If the device never sends the
//! result that completes the stop, the watchdog fires and forces the
//! provider back to `Idle`. Every arm or disarm bumps a generation number;
//! a firing whose generation is no longer current does nothing.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;

#[derive(Debug, Default)]
pub(crate) struct Watchdog {
    generation: u64,
    task: Option<JoinHandle<()>>,
}

impl Watchdog {
    /// Arm (or re-arm) the watchdog.
    ///
    /// `on_fire` receives the generation this arming was issued with; pass
    /// it back to [`fire`](Self::fire) to check it is still current.
    /// Must be called from within a tokio runtime.
    pub fn arm<F, Fut>(&mut self, timeout: Duration, on_fire: F)
    where
        F: FnOnce(u64) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.disarm();
        let generation = self.generation;
        self.task = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            on_fire(generation).await;
        }));
    }

    /// Cancel a pending firing.
    pub fn disarm(&mut self) {
        self.generation = self.generation.wrapping_add(1);
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    /// Consume a firing. Returns `false` for a stale generation.
    pub fn fire(&mut self, generation: u64) -> bool {
        if self.task.is_none() || generation != self.generation {
            return false;
        }
        // The firing task is finishing on its own.
        self.task = None;
        self.generation = self.generation.wrapping_add(1);
        true
    }

    pub fn is_armed(&self) -> bool {
        self.task.is_some()
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
