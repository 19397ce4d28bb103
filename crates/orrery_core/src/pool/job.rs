//! # Dispatch Jobs
//!
//! One job per `execute` / `invoke_on_all` call, shared by the master and
//! every slave for the duration of a single barrier round.
//!
//! ## Safety Note
//!
//! Jobs carry the caller's closure as a lifetime-erased pointer so slaves can
//! run borrowed work without `'static` bounds. Soundness rests on the
//! admission protocol below, not on the type system.
//!
//! ## Admission Protocol
//!
//! ```text
//! participant:  enter() ──► run blocks ──► leave()
//!                  │
//!                  └── refused once the job is sealed
//!
//! dispatcher:   seal_and_wait()  blocks until active == 0
//!               (closure borrow ends only after this returns)
//! ```

#![allow(unsafe_code)]

use std::ops::Range;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::{Condvar, Mutex};

use crate::sync::PanicPayload;

type BlockWork = dyn Fn(usize) + Sync;
type BroadcastAction = dyn Fn() + Sync;

enum Task {
    /// Fork-join over `[0, total)` in blocks of `block_size`.
    Blocks {
        work: *const BlockWork,
        total: usize,
        block_size: usize,
        num_blocks: usize,
        next_block: AtomicUsize,
    },
    /// One call per participant.
    Broadcast { action: *const BroadcastAction },
}

struct Participants {
    active: usize,
    sealed: bool,
}

/// Work shared by every thread taking part in one dispatch.
pub(crate) struct Job {
    task: Task,
    /// Set on dispose or on the first panic; remaining blocks are skipped.
    halted: AtomicBool,
    panic: Mutex<Option<PanicPayload>>,
    participants: Mutex<Participants>,
    idle: Condvar,
}

// SAFETY: The raw closure pointers refer to `Sync` closures and are only
// dereferenced between enter() and leave(); the dispatcher keeps the
// referents alive until seal_and_wait() observes no active participant.
unsafe impl Send for Job {}
// SAFETY: See above. Every other field is already Sync.
unsafe impl Sync for Job {}

impl Job {
    /// Creates a block-partitioned job over `[0, total)`.
    ///
    /// # Safety
    ///
    /// The caller must call [`Job::seal_and_wait`] before `work` goes out of
    /// scope.
    pub(crate) unsafe fn blocks<'a>(
        work: &'a (dyn Fn(usize) + Sync + 'a),
        total: usize,
        block_size: usize,
    ) -> Self {
        debug_assert!(block_size > 0);
        let work: *const (dyn Fn(usize) + Sync + 'a) = work;
        // SAFETY: Only the trait-object lifetime changes; the pointer is never
        // dereferenced after the caller's seal_and_wait().
        let work = unsafe {
            std::mem::transmute::<*const (dyn Fn(usize) + Sync + 'a), *const BlockWork>(work)
        };
        Self::with_task(Task::Blocks {
            work,
            total,
            block_size,
            num_blocks: total.div_ceil(block_size),
            next_block: AtomicUsize::new(0),
        })
    }

    /// Creates a job that runs `action` once on every participant.
    ///
    /// # Safety
    ///
    /// Same contract as [`Job::blocks`].
    pub(crate) unsafe fn broadcast<'a>(action: &'a (dyn Fn() + Sync + 'a)) -> Self {
        let action: *const (dyn Fn() + Sync + 'a) = action;
        // SAFETY: As in `blocks`.
        let action = unsafe {
            std::mem::transmute::<*const (dyn Fn() + Sync + 'a), *const BroadcastAction>(action)
        };
        Self::with_task(Task::Broadcast { action })
    }

    fn with_task(task: Task) -> Self {
        Self {
            task,
            halted: AtomicBool::new(false),
            panic: Mutex::new(None),
            participants: Mutex::new(Participants {
                active: 0,
                sealed: false,
            }),
            idle: Condvar::new(),
        }
    }

    /// Runs this thread's share of the job, capturing any panic.
    ///
    /// Returns immediately if the job was already sealed.
    pub(crate) fn participate(&self) {
        if !self.enter() {
            return;
        }
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| self.run())) {
            self.record_panic(payload);
        }
        self.leave();
    }

    /// Refuses new participants and blocks until the active ones have left.
    pub(crate) fn seal_and_wait(&self) {
        let mut participants = self.participants.lock();
        participants.sealed = true;
        while participants.active > 0 {
            self.idle.wait(&mut participants);
        }
    }

    /// Stops participants from claiming further blocks.
    pub(crate) fn halt(&self) {
        self.halted.store(true, Ordering::Release);
    }

    /// Whether the job was cut short by a halt or a panic.
    pub(crate) fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    /// First panic raised by a participant, if any.
    pub(crate) fn take_panic(&self) -> Option<PanicPayload> {
        self.panic.lock().take()
    }

    fn enter(&self) -> bool {
        let mut participants = self.participants.lock();
        if participants.sealed {
            return false;
        }
        participants.active += 1;
        true
    }

    fn leave(&self) {
        let mut participants = self.participants.lock();
        participants.active -= 1;
        if participants.active == 0 {
            self.idle.notify_all();
        }
    }

    fn record_panic(&self, payload: PanicPayload) {
        self.halt();
        let mut slot = self.panic.lock();
        if slot.is_none() {
            *slot = Some(payload);
        }
    }

    fn run(&self) {
        match &self.task {
            Task::Blocks {
                work,
                total,
                block_size,
                num_blocks,
                next_block,
            } => {
                // SAFETY: Called between enter() and leave(); the closure is
                // alive until the dispatcher's seal_and_wait() returns.
                let work = unsafe { &**work };
                while !self.is_halted() {
                    let block = next_block.fetch_add(1, Ordering::Relaxed);
                    if block >= *num_blocks {
                        break;
                    }
                    for index in block_range(block, *block_size, *total) {
                        work(index);
                    }
                }
            }
            Task::Broadcast { action } => {
                // SAFETY: As above.
                let action = unsafe { &**action };
                action();
            }
        }
    }
}

/// Element range of `block`, clamped to `total` without overflowing.
fn block_range(block: usize, block_size: usize, total: usize) -> Range<usize> {
    let start = block * block_size;
    start..start + block_size.min(total - start)
}
