//! Coroutine scheduler
//!
//! Keeps every live coroutine that is not currently running, a FIFO queue
//! of the ones ready to resume, and the completion queue that host worker
//! threads report into. Workers only ever touch the completion queue.

use crate::coroutine::{Coroutine, CoroutineState};
use crate::host::{AsyncJob, HostResult};
use crate::value::Slot;
use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::collections::{BTreeMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

/// One finished host job
#[derive(Debug)]
pub struct Completion {
    pub coroutine: u32,
    /// Host table entry that started the job
    pub host: u32,
    /// `Err` carries the panic message of a job that did not return
    pub outcome: std::result::Result<HostResult, String>,
}

/// Results of asynchronous host calls, handed from worker threads to the
/// interpreter thread in completion order
#[derive(Default)]
pub struct Completions {
    queue: Mutex<VecDeque<Completion>>,
    signal: Condvar,
}

impl Completions {
    pub fn push(&self, completion: Completion) {
        self.queue.lock().push_back(completion);
        self.signal.notify_one();
    }

    /// Everything completed so far, without blocking
    pub fn drain(&self) -> Vec<Completion> {
        self.queue.lock().drain(..).collect()
    }

    /// Block until at least one job has completed
    pub fn wait(&self) -> Vec<Completion> {
        let mut queue = self.queue.lock();
        while queue.is_empty() {
            self.signal.wait(&mut queue);
        }
        queue.drain(..).collect()
    }
}

pub struct Scheduler {
    coroutines: BTreeMap<u32, Coroutine>,
    ready: VecDeque<u32>,
    next_id: u32,
    pending_host: usize,
    completions: Arc<Completions>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            coroutines: BTreeMap::new(),
            ready: VecDeque::new(),
            next_id: 1,
            pending_host: 0,
            completions: Arc::new(Completions::default()),
        }
    }

    /// Reserve the id for a coroutine about to be created
    pub fn next_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Add a new coroutine at the back of the ready queue
    pub fn spawn(&mut self, coroutine: Coroutine) {
        tracing::trace!(id = coroutine.id, "spawned coroutine");
        self.ready.push_back(coroutine.id);
        self.coroutines.insert(coroutine.id, coroutine);
    }

    /// Take the next ready coroutine out of the table
    pub fn take_ready(&mut self) -> Option<Coroutine> {
        while let Some(id) = self.ready.pop_front() {
            if let Some(coroutine) = self.coroutines.remove(&id) {
                return Some(coroutine);
            }
        }
        None
    }

    /// Remove a parked coroutine from the table
    pub fn take(&mut self, id: u32) -> Option<Coroutine> {
        self.ready.retain(|&ready| ready != id);
        self.coroutines.remove(&id)
    }

    /// True while `id` names a coroutine that has not finished
    pub fn is_live(&self, id: u32) -> bool {
        self.coroutines.contains_key(&id)
    }

    pub fn is_empty(&self) -> bool {
        self.coroutines.is_empty()
    }

    pub fn len(&self) -> usize {
        self.coroutines.len()
    }

    pub fn pending_host(&self) -> usize {
        self.pending_host
    }

    /// Record that `waiter` must be woken when `target` finishes
    pub fn add_waiter(&mut self, target: u32, waiter: u32) {
        if let Some(coroutine) = self.coroutines.get_mut(&target) {
            coroutine.waiters.push(waiter);
        }
    }

    /// Put back a coroutine that suspended itself
    pub fn park(&mut self, coroutine: Coroutine) {
        tracing::trace!(id = coroutine.id, state = %coroutine.state, "coroutine suspended");
        self.coroutines.insert(coroutine.id, coroutine);
    }

    /// Retire a finished coroutine and wake every waiter whose wait set it
    /// emptied; the waiter resumes with the finished coroutine's id
    pub fn finish(&mut self, coroutine: Coroutine) {
        tracing::trace!(id = coroutine.id, "coroutine finished");
        for waiter in coroutine.waiters {
            let Some(entry) = self.coroutines.get_mut(&waiter) else { continue };
            entry.wait_set.retain(|&id| id != coroutine.id);
            if entry.wait_set.is_empty() && entry.state == CoroutineState::Awaiting {
                entry.push(Slot::int(coroutine.id as i64));
                self.ready.push_back(waiter);
            }
        }
    }

    /// Run `job` on a worker thread; its result comes back through the
    /// completion queue tagged with `coroutine`. A job that panics still
    /// reports back, so the waiting coroutine is never stranded.
    pub fn start_job(&mut self, coroutine: u32, host: u32, job: AsyncJob) {
        self.pending_host += 1;
        let completions = Arc::clone(&self.completions);
        tracing::debug!(coroutine, host, "starting async host job");
        std::thread::spawn(move || {
            let outcome = std::panic::catch_unwind(AssertUnwindSafe(job)).map_err(|payload| panic_message(&*payload));
            completions.push(Completion { coroutine, host, outcome });
        });
    }

    /// Completed host jobs; blocks when `block` is set and none are in yet
    pub fn completed(&mut self, block: bool) -> Vec<Completion> {
        let batch = if block { self.completions.wait() } else { self.completions.drain() };
        self.pending_host -= batch.len().min(self.pending_host);
        batch
    }

    /// Make a coroutine whose host call completed runnable again
    pub fn resume_after_host(&mut self, id: u32) -> Option<&mut Coroutine> {
        let coroutine = self.coroutines.get_mut(&id)?;
        if coroutine.state != CoroutineState::AwaitingHost {
            return None;
        }
        self.ready.push_back(id);
        Some(coroutine)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Coroutine> {
        self.coroutines.values()
    }

    pub fn slots(&self) -> impl Iterator<Item = &Slot> {
        self.coroutines.values().flat_map(|coroutine| coroutine.slots())
    }

    /// One line per blocked coroutine, for the deadlock diagnostic
    pub fn blocked_report(&self) -> String {
        self.coroutines
            .values()
            .map(|coroutine| match coroutine.state {
                CoroutineState::Awaiting => format!("#{} awaits {:?}", coroutine.id, coroutine.wait_set),
                state => format!("#{} is {}", coroutine.id, state),
            })
            .collect::<Vec<_>>()
            .join("; ")
    }

    /// Drop every coroutine, e.g. after a runtime error ended the run
    pub fn clear(&mut self) {
        self.coroutines.clear();
        self.ready.clear();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    let text = payload
        .downcast_ref::<&str>()
        .map(|text| text.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown cause".to_string());
    format!("worker thread panicked: {}", text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::host::HostTable;
    use crate::loader::compile_source;
    use crate::program::Program;
    use std::rc::Rc;

    fn program() -> Program {
        compile_source("sched.fer", "void Start() { }", Rc::new(HostTable::standard()), &EngineConfig::default()).unwrap()
    }

    fn spawn(scheduler: &mut Scheduler, program: &Program) -> u32 {
        let id = scheduler.next_id();
        scheduler.spawn(Coroutine::new(id, program, program.start, Vec::new(), Vec::new()).unwrap());
        id
    }

    #[test]
    fn test_ready_queue_is_fifo() {
        let program = program();
        let mut scheduler = Scheduler::new();
        let a = spawn(&mut scheduler, &program);
        let b = spawn(&mut scheduler, &program);
        assert_eq!((a, b), (1, 2));
        assert_eq!(scheduler.take_ready().map(|c| c.id), Some(1));
        assert_eq!(scheduler.take_ready().map(|c| c.id), Some(2));
        assert!(scheduler.take_ready().is_none());
    }

    #[test]
    fn test_finish_wakes_waiter_with_finished_id() {
        let program = program();
        let mut scheduler = Scheduler::new();
        let target = spawn(&mut scheduler, &program);
        let mut waiter = scheduler.take_ready().unwrap();
        assert_eq!(waiter.id, target);

        let other = spawn(&mut scheduler, &program);
        let mut finished = scheduler.take_ready().unwrap();
        assert_eq!(finished.id, other);

        waiter.state = CoroutineState::Awaiting;
        waiter.wait_set = vec![other];
        finished.waiters.push(waiter.id);
        scheduler.park(waiter);
        assert!(scheduler.take_ready().is_none());

        scheduler.finish(finished);
        let woken = scheduler.take_ready().unwrap();
        assert_eq!(woken.id, target);
        assert_eq!(woken.operands.last(), Some(&Slot::int(other as i64)));
        assert!(!scheduler.is_live(other));
    }

    #[test]
    fn test_async_job_completes_through_queue() {
        let mut scheduler = Scheduler::new();
        scheduler.start_job(7, 3, Box::new(|| HostResult::int(5)));
        assert_eq!(scheduler.pending_host(), 1);
        let batch = scheduler.completed(true);
        assert_eq!(batch.len(), 1);
        assert_eq!((batch[0].coroutine, batch[0].host), (7, 3));
        assert!(matches!(batch[0].outcome, Ok(HostResult::Scalar(5))));
        assert_eq!(scheduler.pending_host(), 0);
    }

    #[test]
    fn test_panicking_job_still_completes() {
        let mut scheduler = Scheduler::new();
        scheduler.start_job(2, 0, Box::new(|| -> HostResult { panic!("disk on fire") }));
        let batch = scheduler.completed(true);
        assert_eq!(batch.len(), 1);
        match &batch[0].outcome {
            Err(message) => assert!(message.contains("disk on fire"), "unexpected {}", message),
            Ok(result) => panic!("unexpected {:?}", result),
        }
        assert_eq!(scheduler.pending_host(), 0);
    }
}
