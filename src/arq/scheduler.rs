use async_trait::async_trait;
use std::future::Future;
use std::sync::{Mutex, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio::{select, time};
use tracing::{debug, trace};

/// The periodic work of a reliability protocol: requesting missing messages, flushing deferred
///  acks, probing stalled connections and reaping idle ones
#[async_trait]
pub trait Retransmitter: Send + Sync + 'static {
    async fn trigger_xmit(&self);
}

/// A periodic background task, stopped explicitly or when its owner is dropped
pub struct PeriodicTask {
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl PeriodicTask {
    /// Calls `f` every `interval`, starting one interval from now. The task ends when it is
    ///  stopped, or when `f` returns `false`, which is how a task holding a `Weak` reference to
    ///  its owner notices that the owner is gone.
    pub fn spawn<F, Fut>(name: &'static str, interval: Duration, mut f: F) -> PeriodicTask
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = bool> + Send,
    {
        let (shutdown, mut shutdown_recv) = oneshot::channel();

        let handle = tokio::spawn(async move {
            let mut ticks = time::interval(interval);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticks.tick().await;

            loop {
                select! {
                    _ = ticks.tick() => {
                        trace!("periodic task {}", name);
                        if !f().await {
                            debug!("owner of periodic task {} is gone, stopping", name);
                            break;
                        }
                    }
                    _ = &mut shutdown_recv => {
                        debug!("stopping periodic task {}", name);
                        break;
                    }
                }
            }
        });

        PeriodicTask {
            shutdown: Mutex::new(Some(shutdown)),
            handle: Mutex::new(Some(handle)),
        }
    }

    /// runs `trigger_xmit` every `interval` for as long as the retransmitter is alive
    pub fn spawn_retransmitter<R: Retransmitter>(name: &'static str, interval: Duration, retransmitter: Weak<R>) -> PeriodicTask {
        PeriodicTask::spawn(name, interval, move || {
            let retransmitter = retransmitter.upgrade();
            async move {
                match retransmitter {
                    Some(r) => {
                        r.trigger_xmit().await;
                        true
                    }
                    None => false,
                }
            }
        })
    }

    pub fn is_running(&self) -> bool {
        self.handle.lock().unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Signals the task to stop. A run that is in progress completes.
    pub fn stop(&self) {
        if let Some(shutdown) = self.shutdown.lock().unwrap_or_else(|e| e.into_inner()).take() {
            let _ = shutdown.send(());
        }
    }

    /// stops the task and waits for it to finish
    pub async fn stop_and_wait(&self) {
        self.stop();
        let handle = self.handle.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.stop();
    }
}
