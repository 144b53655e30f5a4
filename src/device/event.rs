use crate::error::Error;
use crate::error::Result;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::OnceLock;
use std::time::Instant;

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Nanoseconds since the process-wide device epoch. All event timestamps
/// share this clock so spans from different queues can be compared.
pub(crate) fn now_ns() -> u64 {
    EPOCH.get_or_init(Instant::now).elapsed().as_nanos() as u64
}

#[derive(Default)]
struct State {
    start: u64,
    end: u64,
    complete: bool,
    failure: Option<String>,
}

struct Core {
    name: String,
    state: Mutex<State>,
    done: Condvar,
}

/// Completion handle for one enqueued command. Carries the command name
/// and, once the command has run, its start/end instants.
#[derive(Clone)]
pub struct Event {
    core: Arc<Core>,
}

impl Event {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            core: Arc::new(Core {
                name: name.to_string(),
                state: Mutex::new(State::default()),
                done: Condvar::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.core.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub(crate) fn begin(&self) {
        self.lock().start = now_ns();
    }

    pub(crate) fn complete(&self) {
        let mut state = self.lock();
        state.end = now_ns();
        state.complete = true;
        self.core.done.notify_all();
    }

    pub(crate) fn fail(&self, message: &str) {
        let mut state = self.lock();
        state.end = now_ns();
        state.complete = true;
        state.failure = Some(message.to_string());
        self.core.done.notify_all();
    }

    /// Block until the command has finished, surfacing its failure if any.
    pub fn wait(&self) -> Result<()> {
        let mut state = self.lock();
        while !state.complete {
            state = self
                .core
                .done
                .wait(state)
                .unwrap_or_else(|p| p.into_inner());
        }
        match &state.failure {
            None => Ok(()),
            Some(msg) => Err(Error::Library(format!("{}: {}", self.core.name, msg))),
        }
    }

    /// Start/end instants in epoch nanoseconds, once complete.
    pub fn span(&self) -> Option<(u64, u64)> {
        let state = self.lock();
        state.complete.then_some((state.start, state.end))
    }

    /// Rewrite the recorded span, for timing tests that need fixed
    /// instants.
    #[cfg(test)]
    pub(crate) fn force_span(&self, start: u64, end: u64) {
        let mut state = self.lock();
        state.start = start;
        state.end = end;
        state.complete = true;
    }
}

/// Wait on a whole event list.
pub fn wait_all(events: &[Event]) -> Result<()> {
    for evt in events {
        evt.wait()?;
    }
    Ok(())
}
