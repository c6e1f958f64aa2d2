//! Adapter for code written against a fork-join runtime which invokes
//! outlined parallel regions ("microtasks") with a variable number of
//! pointer arguments.
//!
//! A [`Microtask`] pairs a function of fixed arity with its arguments.
//! [`fork_call`] runs it once per member of a team on the shared worker pool,
//! passing each invocation the team size and its thread number.

use crate::threading::worker_pool;

pub use crate::threading::{current_team_size, current_thread_num};

/// Opaque argument passed through to a microtask.
pub type TaskArg = *mut ();

/// A parallel region body together with its arguments.
///
/// Every function receives `(team_size, thread_num)` followed by the
/// arguments.
#[derive(Copy, Clone, Debug)]
pub enum Microtask {
    Args0(unsafe fn(usize, usize)),
    Args1(unsafe fn(usize, usize, TaskArg), [TaskArg; 1]),
    Args2(unsafe fn(usize, usize, TaskArg, TaskArg), [TaskArg; 2]),
    Args3(unsafe fn(usize, usize, TaskArg, TaskArg, TaskArg), [TaskArg; 3]),
    Args4(
        unsafe fn(usize, usize, TaskArg, TaskArg, TaskArg, TaskArg),
        [TaskArg; 4],
    ),
}

impl Microtask {
    /// Number of arguments passed after the team size and thread number.
    pub fn argc(&self) -> usize {
        match self {
            Microtask::Args0(_) => 0,
            Microtask::Args1(..) => 1,
            Microtask::Args2(..) => 2,
            Microtask::Args3(..) => 3,
            Microtask::Args4(..) => 4,
        }
    }
}

type Trampoline = unsafe fn(&Microtask, usize, usize);

unsafe fn invoke0(task: &Microtask, team_size: usize, thread_num: usize) {
    if let Microtask::Args0(f) = *task {
        f(team_size, thread_num)
    }
}

unsafe fn invoke1(task: &Microtask, team_size: usize, thread_num: usize) {
    if let Microtask::Args1(f, [a]) = *task {
        f(team_size, thread_num, a)
    }
}

unsafe fn invoke2(task: &Microtask, team_size: usize, thread_num: usize) {
    if let Microtask::Args2(f, [a, b]) = *task {
        f(team_size, thread_num, a, b)
    }
}

unsafe fn invoke3(task: &Microtask, team_size: usize, thread_num: usize) {
    if let Microtask::Args3(f, [a, b, c]) = *task {
        f(team_size, thread_num, a, b, c)
    }
}

unsafe fn invoke4(task: &Microtask, team_size: usize, thread_num: usize) {
    if let Microtask::Args4(f, [a, b, c, d]) = *task {
        f(team_size, thread_num, a, b, c, d)
    }
}

/// Invokers indexed by [`Microtask::argc`].
const TRAMPOLINES: [Trampoline; 5] = [invoke0, invoke1, invoke2, invoke3, invoke4];

struct SharedTask<'a>(&'a Microtask);

impl SharedTask<'_> {
    fn get(&self) -> &Microtask {
        self.0
    }
}

// Safety: `fork_call`'s caller guarantees the arguments may be used from
// every team member concurrently.
unsafe impl Sync for SharedTask<'_> {}

/// Run `task` on a team of up to `num_threads` threads and wait for every
/// member to return.
///
/// When called from inside a parallel region the team has one member.
///
/// # Safety
///
/// The function in `task` must be safe to call concurrently from multiple
/// threads with the given arguments, each call receiving a distinct thread
/// number.
pub unsafe fn fork_call(num_threads: usize, task: &Microtask) {
    let trampoline = TRAMPOLINES[task.argc()];
    let shared = SharedTask(task);
    worker_pool().run_team(num_threads.max(1), |team_size, thread_num| {
        // Safety: See function docs.
        unsafe { trampoline(shared.get(), team_size, thread_num) }
    });
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::{current_team_size, current_thread_num, fork_call, Microtask, TaskArg};
    use crate::threading::worker_pool;

    /// Adds `1 << thread_num` to the counter at `hits`.
    unsafe fn mark(team_size: usize, thread_num: usize, hits: TaskArg) {
        assert_eq!(current_team_size(), team_size);
        assert_eq!(current_thread_num(), thread_num);
        let hits = &*(hits as *const AtomicUsize);
        hits.fetch_add(1 << thread_num, Ordering::SeqCst);
    }

    unsafe fn sum_args(
        _team_size: usize,
        thread_num: usize,
        out: TaskArg,
        a: TaskArg,
        b: TaskArg,
        c: TaskArg,
    ) {
        let out = &*(out as *const [AtomicUsize; 8]);
        let total = *(a as *const usize) + *(b as *const usize) + *(c as *const usize);
        out[thread_num].store(total, Ordering::SeqCst);
    }

    #[test]
    fn test_fork_call_runs_every_member() {
        let team = worker_pool().num_threads().min(4);
        let hits = AtomicUsize::new(0);
        let task = Microtask::Args1(mark, [&hits as *const AtomicUsize as TaskArg]);
        assert_eq!(task.argc(), 1);

        unsafe { fork_call(team, &task) };

        assert_eq!(hits.load(Ordering::SeqCst), (1 << team) - 1);
    }

    #[test]
    fn test_fork_call_passes_arguments() {
        let team = worker_pool().num_threads().min(8);
        let out: [AtomicUsize; 8] = Default::default();
        let (a, b, c) = (1usize, 20usize, 300usize);
        let task = Microtask::Args4(
            sum_args,
            [
                &out as *const _ as TaskArg,
                &a as *const usize as TaskArg,
                &b as *const usize as TaskArg,
                &c as *const usize as TaskArg,
            ],
        );
        assert_eq!(task.argc(), 4);

        unsafe { fork_call(team, &task) };

        for (i, slot) in out.iter().enumerate() {
            let expected = if i < team { 321 } else { 0 };
            assert_eq!(slot.load(Ordering::SeqCst), expected);
        }
    }

    #[test]
    fn test_fork_call_without_args() {
        static CALLS: AtomicUsize = AtomicUsize::new(0);

        unsafe fn count(_team_size: usize, _thread_num: usize) {
            CALLS.fetch_add(1, Ordering::SeqCst);
        }

        unsafe { fork_call(1, &Microtask::Args0(count)) };
        assert_eq!(CALLS.load(Ordering::SeqCst), 1);
    }
}
