use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// A unit of work run against the worker-owned state.
pub type Task<S> = Box<dyn FnOnce(&mut S) -> anyhow::Result<()> + Send>;

/// Called on the worker thread when a task returns an error or panics.
pub type FailureHook = Box<dyn Fn(&str, &anyhow::Error) + Send>;

#[derive(Error, Debug)]
#[error("task queue worker has exited")]
pub struct QueueClosed;

struct Envelope<S> {
    label: String,
    task: Task<S>,
}

/// FIFO queue drained by exactly one dedicated OS thread.
///
/// The worker owns `S` outright, so tasks get `&mut S` without locking and
/// never overlap. `enqueue` never blocks and never reports queue depth back
/// as an error.
pub struct TaskQueue<S> {
    tx: mpsc::UnboundedSender<Envelope<S>>,
    depth: Arc<AtomicUsize>,
}

impl<S> Clone for TaskQueue<S> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            depth: self.depth.clone(),
        }
    }
}

impl<S: Send + 'static> TaskQueue<S> {
    /// Start the worker thread. `state` moves onto it for good.
    pub fn spawn(name: &str, mut state: S, on_failure: FailureHook) -> std::io::Result<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Envelope<S>>();
        let depth = Arc::new(AtomicUsize::new(0));
        let worker_depth = depth.clone();

        std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                tracing::info!("task worker started");
                while let Some(Envelope { label, task }) = rx.blocking_recv() {
                    worker_depth.fetch_sub(1, Ordering::AcqRel);
                    tracing::debug!(task = %label, "task started");

                    let outcome = panic::catch_unwind(AssertUnwindSafe(|| task(&mut state)));
                    match outcome {
                        Ok(Ok(())) => tracing::debug!(task = %label, "task finished"),
                        Ok(Err(err)) => {
                            tracing::error!(task = %label, error = %err, "task failed");
                            on_failure(&label, &err);
                        }
                        Err(payload) => {
                            let reason = panic_message(&*payload);
                            let err = anyhow::anyhow!("task panicked: {reason}");
                            tracing::error!(task = %label, error = %err, "task panicked");
                            on_failure(&label, &err);
                        }
                    }
                }
                tracing::info!("task worker exiting");
            })?;

        Ok(Self { tx, depth })
    }

    /// Append a task. Returns as soon as it is queued.
    pub fn enqueue<F>(&self, label: impl Into<String>, task: F) -> Result<(), QueueClosed>
    where
        F: FnOnce(&mut S) -> anyhow::Result<()> + Send + 'static,
    {
        self.depth.fetch_add(1, Ordering::AcqRel);
        self.tx
            .send(Envelope {
                label: label.into(),
                task: Box::new(task),
            })
            .map_err(|_| {
                self.depth.fetch_sub(1, Ordering::AcqRel);
                QueueClosed
            })
    }

    /// Tasks waiting to start.
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::oneshot;

    #[derive(Debug, PartialEq)]
    enum Event {
        Start(u32),
        End(u32),
    }

    fn quiet() -> FailureHook {
        Box::new(|_: &str, _: &anyhow::Error| {})
    }

    #[tokio::test]
    async fn test_fifo_one_at_a_time() {
        let queue = TaskQueue::spawn("test-worker", Vec::<Event>::new(), quiet()).unwrap();
        let (done_tx, done_rx) = oneshot::channel();

        for n in 1..=3u32 {
            queue
                .enqueue(format!("t{n}"), move |log: &mut Vec<Event>| {
                    log.push(Event::Start(n));
                    std::thread::sleep(Duration::from_millis(20));
                    log.push(Event::End(n));
                    Ok(())
                })
                .unwrap();
        }
        queue
            .enqueue("collect", move |log: &mut Vec<Event>| {
                let _ = done_tx.send(std::mem::take(log));
                Ok(())
            })
            .unwrap();

        let events = done_rx.await.unwrap();
        assert_eq!(
            events,
            vec![
                Event::Start(1),
                Event::End(1),
                Event::Start(2),
                Event::End(2),
                Event::Start(3),
                Event::End(3),
            ]
        );
    }

    #[tokio::test]
    async fn test_failures_do_not_stop_worker() {
        let failures = Arc::new(Mutex::new(Vec::<String>::new()));
        let seen = failures.clone();
        let hook: FailureHook = Box::new(move |label: &str, err: &anyhow::Error| {
            seen.lock().unwrap().push(format!("{label}: {err}"));
        });

        let queue = TaskQueue::spawn("test-worker", 0u32, hook).unwrap();
        queue.enqueue("errs", |_: &mut u32| Err(anyhow::anyhow!("bad input"))).unwrap();
        queue.enqueue("panics", |_: &mut u32| panic!("kaboom")).unwrap();

        let (tx, rx) = oneshot::channel();
        queue
            .enqueue("survivor", move |n: &mut u32| {
                *n += 1;
                let _ = tx.send(*n);
                Ok(())
            })
            .unwrap();

        assert_eq!(rx.await.unwrap(), 1);
        let failures = failures.lock().unwrap();
        assert_eq!(failures.len(), 2);
        assert_eq!(failures[0], "errs: bad input");
        assert!(failures[1].starts_with("panics: task panicked: kaboom"));
    }

    #[tokio::test]
    async fn test_enqueue_does_not_wait_for_running_task() {
        let queue = TaskQueue::spawn("test-worker", (), quiet()).unwrap();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        queue
            .enqueue("blocker", move |_: &mut ()| {
                let _ = release_rx.recv();
                Ok(())
            })
            .unwrap();

        // The worker is parked inside "blocker"; these must still return at once.
        for i in 0..100 {
            queue.enqueue(format!("n{i}"), |_: &mut ()| Ok(())).unwrap();
        }
        assert!(queue.depth() >= 100);

        release_tx.send(()).unwrap();
    }
}
