//! In-order command queues.
//!
//! Each queue is a dedicated worker thread fed over a channel. Commands
//! execute strictly in submission order; cross-queue ordering happens only
//! through event wait lists, matching the scheduling model the drivers are
//! written against. A failed command poisons the queue: later commands are
//! skipped with failed events, and `finish` surfaces the first failure.

use super::event::Event;
use super::program::Kernel;
use crate::error::Error;
use crate::error::Result;
use crossbeam_channel::Receiver;
use crossbeam_channel::Sender;
use crossbeam_channel::bounded;
use crossbeam_channel::unbounded;
use std::sync::Arc;
use std::thread::JoinHandle;

type Job = Box<dyn FnOnce() -> Result<()> + Send + 'static>;

enum Cmd {
    Task {
        wait: Vec<Event>,
        event: Event,
        job: Job,
    },
    Finish(Sender<Result<()>>),
    Shutdown,
}

pub struct Queue {
    label: String,
    tx: Sender<Cmd>,
    worker: Option<JoinHandle<()>>,
}

impl Queue {
    pub fn new(label: &str) -> Self {
        let (tx, rx) = unbounded::<Cmd>();
        let thread_label = label.to_string();
        let worker = std::thread::Builder::new()
            .name(thread_label.clone())
            .spawn(move || run_worker(rx, &thread_label))
            .expect("spawn queue worker");
        Self {
            label: label.to_string(),
            tx,
            worker: Some(worker),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Enqueue an arbitrary command. Returns its completion event.
    pub fn enqueue(
        &self,
        name: &str,
        wait: &[Event],
        job: impl FnOnce() -> Result<()> + Send + 'static,
    ) -> Result<Event> {
        let event = Event::new(name);
        self.tx
            .send(Cmd::Task {
                wait: wait.to_vec(),
                event: event.clone(),
                job: Box::new(job),
            })
            .map_err(|_| Error::Library(format!("queue '{}' is gone", self.label)))?;
        Ok(event)
    }

    /// Enqueue a kernel dispatch.
    pub fn enqueue_kernel(
        &self,
        kernel: &Arc<dyn Kernel>,
        gws: usize,
        lws: usize,
        scalars: &[u64],
        wait: &[Event],
    ) -> Result<Event> {
        let krnl = kernel.clone();
        let scalars = scalars.to_vec();
        self.enqueue(&format!("K: {}", kernel.name()), wait, move || {
            krnl.run(gws, lws, &scalars)
        })
    }

    /// Enqueue a barrier. Ordering within the queue is already strict;
    /// the barrier marks a synchronisation point whose event callers can
    /// hang dependencies on.
    pub fn barrier(&self) -> Result<Event> {
        self.enqueue("barrier", &[], || Ok(()))
    }

    /// Block until every enqueued command has run, surfacing the first
    /// failure if any occurred.
    pub fn finish(&self) -> Result<()> {
        let (ack_tx, ack_rx) = bounded(1);
        self.tx
            .send(Cmd::Finish(ack_tx))
            .map_err(|_| Error::Library(format!("queue '{}' is gone", self.label)))?;
        ack_rx
            .recv()
            .map_err(|_| Error::Library(format!("queue '{}' worker died", self.label)))?
    }
}

impl Drop for Queue {
    fn drop(&mut self) {
        let _ = self.tx.send(Cmd::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn run_worker(rx: Receiver<Cmd>, label: &str) {
    let mut first_error: Option<String> = None;
    while let Ok(cmd) = rx.recv() {
        match cmd {
            Cmd::Task { wait, event, job } => {
                if let Some(msg) = &first_error {
                    event.fail(&format!("skipped after earlier failure: {}", msg));
                    continue;
                }
                if let Err(e) = super::event::wait_all(&wait) {
                    let msg = e.to_string();
                    log::error!("{}: dependency failed before '{}': {}", label, event.name(), msg);
                    event.fail(&msg);
                    first_error = Some(msg);
                    continue;
                }
                event.begin();
                match job() {
                    Ok(()) => event.complete(),
                    Err(e) => {
                        let msg = e.to_string();
                        log::error!("{}: '{}' failed: {}", label, event.name(), msg);
                        event.fail(&msg);
                        first_error = Some(msg);
                    }
                }
            }
            Cmd::Finish(ack) => {
                let reply = match &first_error {
                    None => Ok(()),
                    Some(msg) => Err(Error::Library(msg.clone())),
                };
                let _ = ack.send(reply);
            }
            Cmd::Shutdown => break,
        }
    }
}
