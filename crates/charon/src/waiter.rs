//! Long-poll driver for one notification type.
//!
//! The loop keeps calling an update waiter, dedups states by their
//! identifier and hands genuinely new states to the update handler.  A
//! failed call sleeps out the remainder of the backoff interval and
//! retries; the loop itself never gives up.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::notifications::NotificationType;

/// Default sleep after a failed waiter call.
const DEFAULT_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
#[error("update waiter failed: {0}")]
pub struct WaiterError(pub String);

/// A source of state updates, typically a long-polling RPC call.  An
/// error means the call may simply be retried.
#[async_trait]
pub trait UpdateWaiter: Send + Sync + 'static {
    async fn wait_for_update(&self) -> Result<Value, WaiterError>;
}

/// Handler invoked (on the waiter task) for each state change.
pub type UpdateHandler = Arc<dyn Fn(Value) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Default)]
struct SharedState {
    current: Option<Value>,
    handler: Option<UpdateHandler>,
}

/// The waiter loop; owns the polling task between `start` and `stop`.
pub struct WaiterLoop {
    notification: Arc<dyn NotificationType>,
    waiter: Arc<dyn UpdateWaiter>,
    shared: Arc<StdMutex<SharedState>>,
    backoff: Duration,
    stop_tx: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<()>>,
}

impl WaiterLoop {
    pub fn new(notification: Arc<dyn NotificationType>, waiter: Arc<dyn UpdateWaiter>) -> Self {
        Self {
            notification,
            waiter,
            shared: Arc::new(StdMutex::new(SharedState::default())),
            backoff: DEFAULT_BACKOFF,
            stop_tx: None,
            task: None,
        }
    }

    pub fn type_name(&self) -> &str {
        self.notification.type_name()
    }

    pub fn notification(&self) -> &Arc<dyn NotificationType> {
        &self.notification
    }

    pub fn set_backoff(&mut self, backoff: Duration) {
        self.backoff = backoff;
    }

    /// Starts the polling task.  Must not already be running.
    pub fn start(&mut self) {
        assert!(self.task.is_none(), "waiter loop is already running");
        info!(type_name = self.type_name(), "starting waiter loop");

        self.shared.lock().expect("waiter state poisoned").current = None;
        let (stop_tx, stop_rx) = watch::channel(false);
        self.stop_tx = Some(stop_tx);

        self.task = Some(tokio::spawn(run_loop(
            Arc::clone(&self.notification),
            Arc::clone(&self.waiter),
            Arc::clone(&self.shared),
            self.backoff,
            stop_rx,
        )));
    }

    /// Stops the polling task and waits for it to finish.
    pub async fn stop(&mut self) {
        let Some(task) = self.task.take() else {
            return;
        };
        info!(type_name = self.type_name(), "stopping waiter loop");

        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(true);
        }
        let _ = task.await;
    }

    pub fn is_running(&self) -> bool {
        self.task.is_some()
    }

    /// The most recent state, if any update has been seen since start.
    pub fn current_state(&self) -> Option<Value> {
        self.shared
            .lock()
            .expect("waiter state poisoned")
            .current
            .clone()
    }

    pub fn set_update_handler(&self, handler: UpdateHandler) {
        self.shared.lock().expect("waiter state poisoned").handler = Some(handler);
    }

    pub fn clear_update_handler(&self) {
        self.shared.lock().expect("waiter state poisoned").handler = None;
    }
}

impl Drop for WaiterLoop {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            assert!(self.task.is_none(), "waiter loop dropped while running");
        }
    }
}

async fn run_loop(
    notification: Arc<dyn NotificationType>,
    waiter: Arc<dyn UpdateWaiter>,
    shared: Arc<StdMutex<SharedState>>,
    backoff: Duration,
    mut stop_rx: watch::Receiver<bool>,
) {
    loop {
        let started = Instant::now();

        let result = tokio::select! {
            _ = stop_rx.changed() => return,
            result = waiter.wait_for_update() => result,
        };

        let state = match result {
            Ok(state) => state,
            Err(e) => {
                warn!(error = %e, "long-polling call returned error");
                let remaining = backoff.saturating_sub(started.elapsed());
                if !remaining.is_zero() {
                    tokio::select! {
                        _ = stop_rx.changed() => return,
                        _ = tokio::time::sleep(remaining) => (),
                    }
                }
                continue;
            }
        };

        if state.is_null() {
            continue;
        }

        let handler = {
            let mut locked = shared.lock().expect("waiter state poisoned");

            let Some(new_id) = notification.extract_state_id(&state) else {
                warn!(
                    type_name = notification.type_name(),
                    "state with unextractable id, skipping"
                );
                continue;
            };

            if let Some(current) = &locked.current {
                if notification.extract_state_id(current).as_ref() == Some(&new_id) {
                    continue;
                }
            }

            debug!(type_name = notification.type_name(), id = %new_id, "new state id");
            locked.current = Some(state.clone());
            locked.handler.clone()
        };

        // The handler may block on a service round-trip; it must run
        // without the state lock held.
        if let Some(handler) = handler {
            handler(state).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifications::StateChangeNotification;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::{mpsc, Mutex as AsyncMutex};

    struct ChannelWaiter {
        rx: AsyncMutex<mpsc::UnboundedReceiver<Result<Value, WaiterError>>>,
    }

    #[async_trait]
    impl UpdateWaiter for ChannelWaiter {
        async fn wait_for_update(&self) -> Result<Value, WaiterError> {
            let mut rx = self.rx.lock().await;
            match rx.recv().await {
                Some(result) => result,
                None => std::future::pending().await,
            }
        }
    }

    fn channel_loop() -> (WaiterLoop, mpsc::UnboundedSender<Result<Value, WaiterError>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let waiter = Arc::new(ChannelWaiter {
            rx: AsyncMutex::new(rx),
        });
        let looper = WaiterLoop::new(Arc::new(StateChangeNotification), waiter);
        (looper, tx)
    }

    async fn wait_for_state(looper: &WaiterLoop, expected: &Value) {
        for _ in 0..100 {
            if looper.current_state().as_ref() == Some(expected) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("state never became {expected}");
    }

    #[tokio::test]
    async fn updates_replace_current_state() {
        let (mut looper, tx) = channel_loop();
        looper.start();
        assert_eq!(looper.current_state(), None);

        tx.send(Ok(json!("first"))).unwrap();
        wait_for_state(&looper, &json!("first")).await;

        tx.send(Ok(json!("second"))).unwrap();
        wait_for_state(&looper, &json!("second")).await;

        looper.stop().await;
    }

    #[tokio::test]
    async fn equal_state_ids_do_not_fire_handler_again() {
        let (mut looper, tx) = channel_loop();
        let hits = Arc::new(AtomicUsize::new(0));

        let counted = Arc::clone(&hits);
        looper.set_update_handler(Arc::new(move |_| {
            let counted = Arc::clone(&counted);
            Box::pin(async move {
                counted.fetch_add(1, Ordering::SeqCst);
            })
        }));

        looper.start();
        tx.send(Ok(json!("same"))).unwrap();
        tx.send(Ok(json!("same"))).unwrap();
        tx.send(Ok(json!("other"))).unwrap();
        wait_for_state(&looper, &json!("other")).await;
        looper.stop().await;

        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn null_states_are_ignored() {
        let (mut looper, tx) = channel_loop();
        looper.start();

        tx.send(Ok(Value::Null)).unwrap();
        tx.send(Ok(json!("real"))).unwrap();
        wait_for_state(&looper, &json!("real")).await;

        looper.stop().await;
    }

    #[tokio::test]
    async fn errors_back_off_and_retry() {
        let (mut looper, tx) = channel_loop();
        looper.set_backoff(Duration::from_millis(20));
        looper.start();

        tx.send(Err(WaiterError("boom".to_string()))).unwrap();
        tx.send(Ok(json!("after error"))).unwrap();
        wait_for_state(&looper, &json!("after error")).await;

        looper.stop().await;
    }

    #[tokio::test]
    async fn stop_cancels_a_blocked_wait() {
        let (mut looper, _tx) = channel_loop();
        looper.start();
        tokio::time::sleep(Duration::from_millis(20)).await;
        looper.stop().await;
        assert!(!looper.is_running());
    }
}
