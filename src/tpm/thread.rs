//! TPM serializer — one worker thread owns the device
//!
//! Jobs are closures over `&mut dyn TpmUtility`, queued on an unbounded
//! channel and run strictly in order. Blocking callers wait on a oneshot;
//! async callers get their continuation spawned on their own runtime.

use super::{TpmUtility, TpmVersion};
use crate::error::{TokenError, TokenResult};
use futures::channel::oneshot;
use std::thread::JoinHandle;
use tokio::sync::mpsc;

type Job = Box<dyn FnOnce(&mut dyn TpmUtility) + Send>;

/// Owner of the TPM worker
pub struct TpmThread {
    sender: Option<mpsc::UnboundedSender<Job>>,
    worker: Option<JoinHandle<()>>,
    available: bool,
    version: Option<TpmVersion>,
}

impl TpmThread {
    /// Move `tpm` onto a new `tpm-worker` thread
    pub fn start(tpm: Box<dyn TpmUtility>) -> TokenResult<Self> {
        let available = tpm.is_tpm_available();
        let version = tpm.version();
        let (sender, mut receiver) = mpsc::unbounded_channel::<Job>();

        let worker = std::thread::Builder::new()
            .name("tpm-worker".into())
            .spawn(move || {
                let mut tpm = tpm;
                while let Some(job) = receiver.blocking_recv() {
                    job(tpm.as_mut());
                }
                // Device teardown happens here, after the queue drained
                drop(tpm);
                log::debug!("TPM worker stopped");
            })?;

        Ok(Self {
            sender: Some(sender),
            worker: Some(worker),
            available,
            version,
        })
    }

    pub fn is_tpm_available(&self) -> bool {
        self.available
    }

    pub fn version(&self) -> Option<TpmVersion> {
        self.version
    }

    /// Run `f` on the worker and wait for its result
    pub fn call<R, F>(&self, f: F) -> TokenResult<R>
    where
        F: FnOnce(&mut dyn TpmUtility) -> TokenResult<R> + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.submit(Box::new(move |tpm: &mut dyn TpmUtility| {
            let _ = tx.send(f(tpm));
        }))?;
        futures::executor::block_on(rx).map_err(|_| TokenError::tpm("worker stopped"))?
    }

    /// Run `f` on the worker and hand its result to `continuation` on the
    /// caller's tokio runtime. Fails fast outside a runtime.
    pub fn call_async<R, F, C>(&self, f: F, continuation: C) -> TokenResult<()>
    where
        F: FnOnce(&mut dyn TpmUtility) -> TokenResult<R> + Send + 'static,
        R: Send + 'static,
        C: FnOnce(TokenResult<R>) + Send + 'static,
    {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| TokenError::tpm("asynchronous call outside a runtime"))?;
        let (tx, rx) = oneshot::channel();
        self.submit(Box::new(move |tpm: &mut dyn TpmUtility| {
            let _ = tx.send(f(tpm));
        }))?;
        runtime.spawn(async move {
            let result = rx.await.unwrap_or_else(|_| Err(TokenError::tpm("worker stopped")));
            continuation(result);
        });
        Ok(())
    }

    /// Queue `f` without waiting
    pub fn post<F>(&self, f: F) -> TokenResult<()>
    where
        F: FnOnce(&mut dyn TpmUtility) + Send + 'static,
    {
        self.submit(Box::new(f))
    }

    fn submit(&self, job: Job) -> TokenResult<()> {
        let sender = self.sender.as_ref().ok_or_else(|| TokenError::tpm("worker stopped"))?;
        sender.send(job).map_err(|_| TokenError::tpm("worker stopped"))
    }
}

impl Drop for TpmThread {
    fn drop(&mut self) {
        // Closing the queue lets the worker finish pending jobs and exit
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            if worker.thread().id() == std::thread::current().id() {
                return;
            }
            if worker.join().is_err() {
                log::error!("TPM worker panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tpm::{SimulatedTpm, StubTpm};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn simulated() -> TpmThread {
        let mut tpm = SimulatedTpm::new(TpmVersion::V2_0, None);
        tpm.init().unwrap();
        TpmThread::start(Box::new(tpm)).unwrap()
    }

    #[test]
    fn test_blocking_call() {
        let thread = simulated();
        assert!(thread.is_tpm_available());
        let bytes = thread.call(|tpm| tpm.generate_random(24)).unwrap();
        assert_eq!(bytes.len(), 24);
    }

    #[test]
    fn test_errors_propagate() {
        let thread = TpmThread::start(Box::new(StubTpm)).unwrap();
        assert!(!thread.is_tpm_available());
        let result = thread.call(|tpm| tpm.generate_random(4));
        assert!(matches!(result, Err(TokenError::FunctionFailed(_))));
    }

    #[test]
    fn test_jobs_run_in_order() {
        let thread = simulated();
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        for i in 0..10 {
            let log = log.clone();
            thread.post(move |_| log.lock().push(i)).unwrap();
        }
        let log_ref = log.clone();
        let seen = thread.call(move |_| Ok(log_ref.lock().len())).unwrap();
        assert_eq!(seen, 10);
        assert_eq!(*log.lock(), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_concurrent_callers_never_overlap() {
        let thread = Arc::new(simulated());
        let in_flight = Arc::new(AtomicUsize::new(0));
        let overlaps = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let thread = thread.clone();
                let in_flight = in_flight.clone();
                let overlaps = overlaps.clone();
                std::thread::spawn(move || {
                    for _ in 0..20 {
                        let in_flight = in_flight.clone();
                        let overlaps = overlaps.clone();
                        thread
                            .call(move |tpm| {
                                if in_flight.fetch_add(1, Ordering::SeqCst) != 0 {
                                    overlaps.fetch_add(1, Ordering::SeqCst);
                                }
                                let out = tpm.generate_random(8);
                                in_flight.fetch_sub(1, Ordering::SeqCst);
                                out
                            })
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_async_outside_runtime_fails_fast() {
        let thread = simulated();
        let result = thread.call_async(|tpm| tpm.generate_random(4), |_| {});
        assert!(matches!(result, Err(TokenError::FunctionFailed(_))));
    }

    #[tokio::test]
    async fn test_async_continuation() {
        let thread = simulated();
        let (tx, rx) = tokio::sync::oneshot::channel();
        thread
            .call_async(
                |tpm| tpm.generate_random(16),
                move |result| {
                    let _ = tx.send(result);
                },
            )
            .unwrap();
        let bytes = rx.await.unwrap().unwrap();
        assert_eq!(bytes.len(), 16);
    }

    #[test]
    fn test_drop_drains_pending_jobs() {
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let thread = simulated();
            for _ in 0..5 {
                let counter = counter.clone();
                thread
                    .post(move |_| {
                        counter.fetch_add(1, Ordering::SeqCst);
                    })
                    .unwrap();
            }
        }
        assert_eq!(counter.load(Ordering::SeqCst), 5);
    }
}
