use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender};

use strata_base::header::ResourceHeader;
use strata_base::ResourceId;

use crate::resource_cache::CacheCore;

pub(crate) struct PayloadJob {
    pub core: Arc<CacheCore>,
    pub resource_id: ResourceId,
    pub path: PathBuf,
    pub header: ResourceHeader,
}

pub(crate) enum DecodeJob {
    Payload(PayloadJob),
}

// Thread that takes jobs out of the request channel until the finish channel
// is signalled.
struct DecodeWorkerThread {
    finish_tx: Sender<()>,
    join_handle: JoinHandle<()>,
}

impl DecodeWorkerThread {
    fn new(
        request_rx: Receiver<DecodeJob>,
        active_request_count: Arc<AtomicUsize>,
        thread_index: usize,
    ) -> Self {
        let (finish_tx, finish_rx) = crossbeam_channel::bounded(1);
        let join_handle = std::thread::Builder::new()
            .name("Decode Thread".into())
            .spawn(move || {
                profiling::register_thread!(&format!("DecodeWorkerThread {}", thread_index));
                loop {
                    crossbeam_channel::select! {
                        recv(request_rx) -> msg => {
                            match msg {
                                Ok(DecodeJob::Payload(job)) => {
                                    profiling::scope!("DecodeJob::Payload");
                                    log::trace!("start payload decode {:?}", job.resource_id);
                                    let core = job.core.clone();
                                    core.execute_decode(job);
                                    active_request_count.fetch_sub(1, Ordering::Release);
                                }
                                // Channel closed, the pool is going away.
                                Err(_) => return,
                            }
                        },
                        recv(finish_rx) -> _msg => {
                            return;
                        }
                    }
                }
            })
            .unwrap();

        DecodeWorkerThread {
            finish_tx,
            join_handle,
        }
    }
}

// Spawns N threads, proxies jobs to them, and kills the threads when the pool
// is dropped.
pub(crate) struct DecodePool {
    worker_threads: Vec<DecodeWorkerThread>,
    request_tx: Sender<DecodeJob>,
    active_request_count: Arc<AtomicUsize>,
}

impl DecodePool {
    pub fn new(thread_count: usize) -> Self {
        let (request_tx, request_rx) = crossbeam_channel::unbounded::<DecodeJob>();
        let active_request_count = Arc::new(AtomicUsize::new(0));

        let mut worker_threads = Vec::with_capacity(thread_count);
        for thread_index in 0..thread_count {
            let worker = DecodeWorkerThread::new(
                request_rx.clone(),
                active_request_count.clone(),
                thread_index,
            );
            worker_threads.push(worker);
        }

        DecodePool {
            worker_threads,
            request_tx,
            active_request_count,
        }
    }

    pub fn submit(
        &self,
        job: DecodeJob,
    ) {
        self.active_request_count.fetch_add(1, Ordering::Release);
        self.request_tx.send(job).unwrap();
    }

    pub fn active_request_count(&self) -> usize {
        self.active_request_count.load(Ordering::Acquire)
    }

    fn finish(&mut self) {
        for worker_thread in &self.worker_threads {
            let _ = worker_thread.finish_tx.send(());
        }

        for worker_thread in self.worker_threads.drain(..) {
            worker_thread.join_handle.join().unwrap();
        }
    }
}

impl Drop for DecodePool {
    fn drop(&mut self) {
        self.finish();
    }
}
