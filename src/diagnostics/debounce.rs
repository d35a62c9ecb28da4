//! Latest-wins debounce queue
//!
//! Items submitted within the window collapse to the most recent one, which
//! is handed to the handler once the window passes without a new submission.
//! Each queue owns one task; dropping the queue stops it.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::trace;

#[async_trait]
pub trait DebounceHandler<T>: Send + Sync {
    async fn handle(&self, item: T);
}

enum Command<T> {
    Submit(T),
    Flush(oneshot::Sender<()>),
    Cancel,
}

pub struct DebounceQueue<T> {
    commands: mpsc::UnboundedSender<Command<T>>,
    task: JoinHandle<()>,
}

impl<T: Send + 'static> DebounceQueue<T> {
    pub fn new(window: Duration, handler: Arc<dyn DebounceHandler<T>>) -> Self {
        let (commands, receiver) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(window, handler, receiver));
        Self { commands, task }
    }

    /// Replace the pending item and restart the window
    pub fn submit(&self, item: T) {
        let _ = self.commands.send(Command::Submit(item));
    }

    /// Handle the pending item now; resolves once it has been handled
    pub async fn flush(&self) {
        let (ack, done) = oneshot::channel();
        if self.commands.send(Command::Flush(ack)).is_ok() {
            let _ = done.await;
        }
    }

    /// Drop the pending item
    pub fn cancel(&self) {
        let _ = self.commands.send(Command::Cancel);
    }
}

impl<T> Drop for DebounceQueue<T> {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run<T>(
    window: Duration,
    handler: Arc<dyn DebounceHandler<T>>,
    mut commands: mpsc::UnboundedReceiver<Command<T>>,
) where
    T: Send + 'static,
{
    let mut pending: Option<T> = None;
    let deadline = tokio::time::sleep(window);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Submit(item)) => {
                    pending = Some(item);
                    deadline.as_mut().reset(Instant::now() + window);
                }
                Some(Command::Flush(ack)) => {
                    if let Some(item) = pending.take() {
                        trace!("Debounce: flushing pending item");
                        handler.handle(item).await;
                    }
                    let _ = ack.send(());
                }
                Some(Command::Cancel) => {
                    pending = None;
                }
                None => break,
            },
            _ = &mut deadline, if pending.is_some() => {
                if let Some(item) = pending.take() {
                    handler.handle(item).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        items: Mutex<Vec<(u32, Instant)>>,
    }

    #[async_trait]
    impl DebounceHandler<u32> for Recorder {
        async fn handle(&self, item: u32) {
            self.items.lock().unwrap().push((item, Instant::now()));
        }
    }

    impl Recorder {
        fn values(&self) -> Vec<u32> {
            self.items.lock().unwrap().iter().map(|(v, _)| *v).collect()
        }
    }

    const WINDOW: Duration = Duration::from_millis(750);

    #[tokio::test(start_paused = true)]
    async fn test_burst_collapses_to_latest() {
        let recorder = Arc::new(Recorder::default());
        let queue = DebounceQueue::new(WINDOW, recorder.clone());
        let start = Instant::now();

        queue.submit(1);
        tokio::time::sleep(Duration::from_millis(300)).await;
        queue.submit(2);
        tokio::time::sleep(Duration::from_millis(300)).await;
        queue.submit(3);

        tokio::time::sleep(Duration::from_millis(700)).await;
        assert!(recorder.values().is_empty());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(recorder.values(), vec![3]);

        let (_, fired_at) = recorder.items.lock().unwrap()[0];
        assert_eq!(fired_at - start, Duration::from_millis(600) + WINDOW);
    }

    #[tokio::test(start_paused = true)]
    async fn test_separate_windows_fire_separately() {
        let recorder = Arc::new(Recorder::default());
        let queue = DebounceQueue::new(WINDOW, recorder.clone());

        queue.submit(1);
        tokio::time::sleep(Duration::from_secs(1)).await;
        queue.submit(2);
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(recorder.values(), vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_handles_immediately() {
        let recorder = Arc::new(Recorder::default());
        let queue = DebounceQueue::new(WINDOW, recorder.clone());

        queue.submit(7);
        queue.flush().await;
        assert_eq!(recorder.values(), vec![7]);

        // nothing left for the timer
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(recorder.values(), vec![7]);

        // flushing an empty queue is a no-op
        queue.flush().await;
        assert_eq!(recorder.values(), vec![7]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_drops_pending() {
        let recorder = Arc::new(Recorder::default());
        let queue = DebounceQueue::new(WINDOW, recorder.clone());

        queue.submit(1);
        queue.cancel();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(recorder.values().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_stops_queue() {
        let recorder = Arc::new(Recorder::default());
        let queue = DebounceQueue::new(WINDOW, recorder.clone());

        queue.submit(1);
        drop(queue);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(recorder.values().is_empty());
    }
}
