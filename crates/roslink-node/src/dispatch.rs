// Node-wide ordered callback execution queue.
//
// All subscriptions of a node enqueue here (multi-producer); `Node::spin`
// drains in strict enqueue order on its own task, so user callbacks never run
// on a connection worker or a coordinator loop.
use tokio::sync::mpsc;

pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

pub(crate) fn job_queue(depth: usize) -> (JobQueue, mpsc::Receiver<Job>) {
    let (tx, rx) = mpsc::channel(depth);
    (JobQueue { tx }, rx)
}

#[derive(Clone)]
pub(crate) struct JobQueue {
    tx: mpsc::Sender<Job>,
}

impl JobQueue {
    /// Enqueue one job, waiting if the queue is full. Returns false when the
    /// consumer side is gone.
    pub(crate) async fn push(&self, job: Job) -> bool {
        if self.tx.send(job).await.is_err() {
            return false;
        }
        metrics::counter!("roslink_dispatch_jobs_total").increment(1);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn jobs_run_in_enqueue_order() {
        let (queue, mut rx) = job_queue(8);
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        for index in 0..5 {
            let order = Arc::clone(&order);
            assert!(
                queue
                    .push(Box::new(move || order.lock().unwrap().push(index)))
                    .await
            );
        }
        for _ in 0..5 {
            let job = rx.recv().await.expect("job");
            job();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn push_reports_closed_consumer() {
        let (queue, rx) = job_queue(1);
        drop(rx);
        let ran = Arc::new(AtomicUsize::new(0));
        let ran_in_job = Arc::clone(&ran);
        let accepted = queue
            .push(Box::new(move || {
                ran_in_job.fetch_add(1, Ordering::Relaxed);
            }))
            .await;
        assert!(!accepted);
        assert_eq!(ran.load(Ordering::Relaxed), 0);
    }
}
