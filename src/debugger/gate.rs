use log::debug;
use std::sync::mpsc;
use std::thread::{self, JoinHandle, ThreadId};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Serialization gate for kernel trace requests.
///
/// The kernel routes trace requests by the identity of the tracing thread: every
/// request after the initial attach must originate from the same host thread.
/// The gate owns that thread and funnels every trace primitive through it as a
/// closure. Jobs execute strictly FIFO, the submitter blocks until its job is done.
///
/// Submitting a job from inside another job deadlocks by construction, so it is
/// rejected with a panic instead.
pub struct TraceGate {
    tx: Option<mpsc::Sender<Job>>,
    consumer: Option<JoinHandle<()>>,
    consumer_id: ThreadId,
}

impl TraceGate {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel::<Job>();
        let (id_tx, id_rx) = mpsc::channel();

        let consumer = thread::Builder::new()
            .name("gostalker-trace".to_string())
            .spawn(move || {
                id_tx.send(thread::current().id()).expect("gate owner alive");
                while let Ok(job) = rx.recv() {
                    job();
                }
                debug!(target: "gate", "trace gate consumer finished");
            })
            .expect("spawn trace gate thread");

        let consumer_id = id_rx.recv().expect("gate consumer started");

        Self {
            tx: Some(tx),
            consumer: Some(consumer),
            consumer_id,
        }
    }

    /// Execute `f` on the pinned trace thread and return its result.
    pub fn exec<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        assert_ne!(
            thread::current().id(),
            self.consumer_id,
            "trace primitive submitted from the trace thread itself"
        );

        let (reply_tx, reply_rx) = mpsc::sync_channel(1);
        let job: Job = Box::new(move || {
            let result = f();
            let _ = reply_tx.send(result);
        });
        self.tx
            .as_ref()
            .expect("gate is closed only on drop")
            .send(job)
            .expect("gate consumer alive");
        reply_rx.recv().expect("gate job completed")
    }

    /// Identifier of the pinned consumer thread.
    pub fn thread_id(&self) -> ThreadId {
        self.consumer_id
    }
}

impl Default for TraceGate {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TraceGate {
    fn drop(&mut self) {
        drop(self.tx.take());
        if let Some(consumer) = self.consumer.take() {
            let _ = consumer.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_jobs_run_on_one_pinned_thread() {
        let gate = TraceGate::new();
        let first = gate.exec(|| thread::current().id());
        for _ in 0..32 {
            let id = gate.exec(|| thread::current().id());
            assert_eq!(id, first);
        }
        assert_eq!(gate.thread_id(), first);
        assert_ne!(first, thread::current().id());
    }

    #[test]
    fn test_fifo_order() {
        let gate = TraceGate::new();
        let counter = Arc::new(AtomicUsize::new(0));
        for expected in 0..128 {
            let counter = counter.clone();
            let seen = gate.exec(move || counter.fetch_add(1, Ordering::SeqCst));
            assert_eq!(seen, expected);
        }
    }

    #[test]
    fn test_result_round_trip() {
        let gate = TraceGate::new();
        let value = gate.exec(|| vec![1_u8, 2, 3]);
        assert_eq!(value, vec![1, 2, 3]);
    }
}
