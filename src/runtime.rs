//! Process-wide lifecycle: configuration, core bring-up, shutdown.

use std::mem;
use std::ptr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use std::thread::{self, JoinHandle};

use crossbeam_utils::CachePadded;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cycles;
use crate::occupancy::{MaskAndCount, Occupancy};
use crate::sched::{self, CoreRuntime};

/// Errors surfaced by configuration and lifecycle calls.
#[derive(Debug, Error)]
pub enum Error {
    #[error("runtime is already initialized")]
    AlreadyInitialized,
    #[error("no usable cores detected")]
    NoCores,
    #[error("invalid flag value: {0}")]
    InvalidFlag(String),
}

/// Startup options.
#[derive(Debug, Default, Clone)]
pub struct Config {
    /// Number of cores to run. `None` detects the CPUs the process can be
    /// pinned to. Set by the `--minNumCores=N` flag.
    pub num_cores: Option<usize>,
}

impl Config {
    /// Parse recognized flags from a command line. Unrecognized arguments
    /// are ignored so embedders can pass their full argv through.
    ///
    /// Recognized: `--minNumCores=N`.
    pub fn from_args<I>(args: I) -> Result<Self, Error>
    where
        I: IntoIterator<Item = String>,
    {
        let mut config = Config::default();
        for arg in args {
            if let Some(value) = arg.strip_prefix("--minNumCores=") {
                match value.parse::<usize>() {
                    Ok(n) if n > 0 => config.num_cores = Some(n),
                    _ => return Err(Error::InvalidFlag(arg)),
                }
            }
        }
        Ok(config)
    }
}

/// Everything shared between cores and creators. Lives behind a swappable
/// global pointer from `init` until `wait_for_termination` tears it down.
pub(crate) struct RuntimeShared {
    pub(crate) cores: Box<[CoreRuntime]>,
    /// One occupancy word per core, padded so creators hammering different
    /// cores do not share lines.
    pub(crate) occupancy: Box<[CachePadded<Occupancy>]>,
    shutdown: AtomicBool,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl RuntimeShared {
    pub(crate) fn num_cores(&self) -> usize {
        self.cores.len()
    }

    pub(crate) fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

static RUNTIME: AtomicPtr<RuntimeShared> = AtomicPtr::new(ptr::null_mut());

/// Shared runtime handle.
///
/// # Panics
/// Panics when called before `init` or after teardown.
pub(crate) fn shared() -> &'static RuntimeShared {
    let raw = RUNTIME.load(Ordering::Acquire);
    assert!(!raw.is_null(), "filament runtime is not initialized");
    unsafe { &*raw }
}

/// Number of cores the runtime is driving.
pub fn num_cores() -> usize {
    shared().num_cores()
}

/// Occupancy snapshot for one core, for embedders doing their own
/// placement.
pub fn core_load(core_id: usize) -> MaskAndCount {
    let shared = shared();
    assert!(core_id < shared.num_cores(), "core index out of range");
    shared.occupancy[core_id].load()
}

/// Bring up the runtime: calibrate the cycle counter, allocate per-core
/// context arrays and occupancy words, pre-prime every slot stack, and
/// start one pinned dispatcher thread per core.
pub fn init(config: Config) -> Result<(), Error> {
    if !RUNTIME.load(Ordering::Acquire).is_null() {
        return Err(Error::AlreadyInitialized);
    }
    cycles::calibrate();

    let available = core_affinity::get_core_ids().unwrap_or_default();
    let num_cores = match config.num_cores {
        Some(n) => n,
        None if available.is_empty() => return Err(Error::NoCores),
        None => available.len(),
    };
    if num_cores == 0 {
        return Err(Error::NoCores);
    }

    let cores: Box<[CoreRuntime]> = (0..num_cores).map(|_| CoreRuntime::new()).collect();
    let occupancy: Box<[CachePadded<Occupancy>]> = (0..num_cores)
        .map(|_| CachePadded::new(Occupancy::new()))
        .collect();
    let raw = Box::into_raw(Box::new(RuntimeShared {
        cores,
        occupancy,
        shutdown: AtomicBool::new(false),
        handles: Mutex::new(Vec::new()),
    }));
    if RUNTIME
        .compare_exchange(ptr::null_mut(), raw, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        unsafe { drop(Box::from_raw(raw)) };
        return Err(Error::AlreadyInitialized);
    }
    let shared: &'static RuntimeShared = unsafe { &*raw };

    info!(cores = num_cores, "starting dispatchers");
    let mut handles = Vec::with_capacity(num_cores);
    for core_id in 0..num_cores {
        let pin = if available.is_empty() {
            None
        } else {
            Some(available[core_id % available.len()])
        };
        let handle = thread::Builder::new()
            .name(format!("filament-core-{core_id}"))
            .spawn(move || {
                if let Some(cpu) = pin
                    && !core_affinity::set_for_current(cpu)
                {
                    warn!(core = core_id, "failed to pin dispatcher to its CPU");
                }
                sched::core_main(shared, core_id);
            })
            .expect("failed to spawn dispatcher thread");
        handles.push(handle);
    }
    *shared.handles.lock().unwrap() = handles;
    Ok(())
}

/// Ask every dispatcher to exit once a full scan finds nothing runnable.
/// Sleeping or blocked stragglers are abandoned.
pub fn shut_down() {
    let raw = RUNTIME.load(Ordering::Acquire);
    if raw.is_null() {
        return;
    }
    info!("shutdown requested");
    unsafe { &*raw }.shutdown.store(true, Ordering::Release);
}

/// Join the dispatcher threads, then free every stack and slot record.
/// After this returns the runtime can be initialized again.
///
/// Call [`shut_down`] first, from any thread that is not a task; joining
/// from a task would deadlock the core trying to exit.
pub fn wait_for_termination() {
    let raw = RUNTIME.swap(ptr::null_mut(), Ordering::AcqRel);
    if raw.is_null() {
        return;
    }
    let shared = unsafe { &*raw };
    let handles = mem::take(&mut *shared.handles.lock().unwrap());
    for handle in handles {
        let _ = handle.join();
    }
    // Every dispatcher has exited; no references into the runtime remain.
    unsafe { drop(Box::from_raw(raw)) };
    debug!("runtime torn down");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
    use std::time::{Duration, Instant};

    use crate::context::{BLOCKED, ThreadId};
    use crate::occupancy::MAX_THREADS_PER_CORE;
    use crate::sched::{block, join, signal, sleep, yield_now};
    use crate::spawn::{create_thread, create_thread_on_core, mock};
    use crate::test_util;

    fn start(num_cores: usize) {
        init(Config {
            num_cores: Some(num_cores),
        })
        .unwrap();
    }

    fn stop() {
        shut_down();
        wait_for_termination();
    }

    /// Signal until the task behind `id` has finished, tolerating signals
    /// that land before the task publishes its blocked sentinel.
    fn signal_until_finished(id: ThreadId) {
        let context = unsafe { &*id.context };
        let deadline = Instant::now() + Duration::from_secs(5);
        while context.generation.load(Ordering::Acquire) == id.generation {
            signal(id);
            std::thread::yield_now();
            assert!(Instant::now() < deadline, "task never exited");
        }
    }

    #[test]
    fn flag_overrides_core_detection() {
        let config =
            Config::from_args(["--minNumCores=3".to_string(), "--unrelated".to_string()]).unwrap();
        assert_eq!(config.num_cores, Some(3));
        assert!(Config::from_args(["--minNumCores=zero".to_string()]).is_err());
        assert!(Config::from_args(["--minNumCores=0".to_string()]).is_err());
    }

    #[test]
    fn single_task_runs_and_frees_its_slot() {
        let _guard = test_util::serial();
        start(1);

        static COUNTER: AtomicU32 = AtomicU32::new(0);
        COUNTER.store(0, Ordering::SeqCst);

        let id = create_thread_on_core(0, || {
            COUNTER.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        join(id);
        assert_eq!(COUNTER.load(Ordering::SeqCst), 1);

        // The dispatcher clears the occupancy bit after the final switch
        // lands on its own stack; poll briefly.
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            let snapshot = core_load(0);
            if snapshot.occupied & 1 == 0 {
                assert_eq!(snapshot.num_occupied, 0);
                break;
            }
            assert!(Instant::now() < deadline, "slot 0 never released");
            std::thread::yield_now();
        }
        stop();
    }

    #[test]
    fn yielding_tasks_alternate_strictly() {
        let _guard = test_util::serial();
        start(1);

        const ROUNDS: u32 = 1_000;
        const NOBODY: u32 = u32::MAX;
        static GO: AtomicBool = AtomicBool::new(false);
        static LAST: AtomicU32 = AtomicU32::new(NOBODY);
        static VIOLATIONS: AtomicU32 = AtomicU32::new(0);
        static RUNS: [AtomicU32; 2] = [AtomicU32::new(0), AtomicU32::new(0)];
        GO.store(false, Ordering::SeqCst);
        LAST.store(NOBODY, Ordering::SeqCst);
        VIOLATIONS.store(0, Ordering::SeqCst);
        RUNS[0].store(0, Ordering::SeqCst);
        RUNS[1].store(0, Ordering::SeqCst);

        let runner = |who: usize| {
            move || {
                while !GO.load(Ordering::SeqCst) {
                    yield_now();
                }
                for _ in 0..ROUNDS {
                    if LAST.swap(who as u32, Ordering::SeqCst) == who as u32 {
                        VIOLATIONS.fetch_add(1, Ordering::SeqCst);
                    }
                    RUNS[who].fetch_add(1, Ordering::SeqCst);
                    yield_now();
                }
            }
        };
        let a = create_thread_on_core(0, runner(0)).unwrap();
        let b = create_thread_on_core(0, runner(1)).unwrap();
        GO.store(true, Ordering::SeqCst);

        join(a);
        join(b);
        assert_eq!(RUNS[0].load(Ordering::SeqCst), ROUNDS);
        assert_eq!(RUNS[1].load(Ordering::SeqCst), ROUNDS);
        assert_eq!(VIOLATIONS.load(Ordering::SeqCst), 0);
        stop();
    }

    #[test]
    fn termination_wakes_every_joiner() {
        let _guard = test_util::serial();
        start(1);

        static JOINED: AtomicU32 = AtomicU32::new(0);
        JOINED.store(0, Ordering::SeqCst);

        let begin = Instant::now();
        let target = create_thread_on_core(0, || {
            sleep(Duration::from_millis(10));
        })
        .unwrap();

        let joiners: Vec<ThreadId> = (0..5)
            .map(|_| {
                create_thread_on_core(0, move || {
                    join(target);
                    JOINED.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap()
            })
            .collect();
        for joiner in joiners {
            join(joiner);
        }

        assert_eq!(JOINED.load(Ordering::SeqCst), 5);
        // Sleep was 10 ms; be lenient about machine load.
        assert!(begin.elapsed() < Duration::from_secs(2));
        let context = unsafe { &*target.context };
        assert_eq!(
            context.generation.load(Ordering::SeqCst),
            target.generation + 1
        );
        stop();
    }

    #[test]
    fn exhausted_core_rejects_then_recovers() {
        let _guard = test_util::serial();
        start(1);

        let residents: Vec<ThreadId> = (0..MAX_THREADS_PER_CORE)
            .map(|_| create_thread_on_core(0, || block()).unwrap())
            .collect();
        assert!(create_thread_on_core(0, || {}).is_none());

        signal_until_finished(residents[0]);

        // The freed slot becomes reservable once the departing task's
        // final switch lands.
        let deadline = Instant::now() + Duration::from_secs(2);
        let replacement = loop {
            if let Some(id) = create_thread_on_core(0, || {}) {
                break id;
            }
            assert!(Instant::now() < deadline, "slot never came back");
            std::thread::yield_now();
        };
        join(replacement);

        for resident in residents.iter().skip(1) {
            signal_until_finished(*resident);
        }
        stop();
    }

    #[test]
    fn signal_carries_writes_across_cores() {
        let _guard = test_util::serial();
        start(2);

        static DATA: AtomicU64 = AtomicU64::new(0);
        static OBSERVED: AtomicU64 = AtomicU64::new(0);
        DATA.store(0, Ordering::SeqCst);
        OBSERVED.store(0, Ordering::SeqCst);

        let blocked = create_thread_on_core(0, || {
            block();
            // Visible via the release exchange in signal paired with the
            // dispatcher's acquire load; no ordering needed here.
            OBSERVED.store(DATA.load(Ordering::Relaxed), Ordering::SeqCst);
        })
        .unwrap();

        let waker = create_thread_on_core(1, move || {
            let context = unsafe { &*blocked.context };
            while context.wakeup_time_in_cycles.load(Ordering::Acquire) != BLOCKED {
                yield_now();
            }
            DATA.store(7, Ordering::Relaxed);
            signal(blocked);
        })
        .unwrap();

        join(blocked);
        join(waker);
        assert_eq!(OBSERVED.load(Ordering::SeqCst), 7);
        stop();
    }

    #[test]
    fn balanced_creation_targets_less_loaded_core() {
        let _guard = test_util::serial();
        start(2);

        let residents: Vec<ThreadId> = (0..40)
            .map(|_| create_thread_on_core(0, || block()).unwrap())
            .collect();
        assert_eq!(core_load(0).num_occupied, 40);

        // Force every probe pair to (0, 1): core 1 is emptier, so the
        // second pick always wins.
        mock::clear();
        mock::push(&[0u64, 1].repeat(10));
        let newcomers: Vec<ThreadId> = (0..10)
            .map(|_| create_thread(|| block()).unwrap())
            .collect();
        assert_eq!(core_load(1).num_occupied, 10);
        assert_eq!(core_load(0).num_occupied, 40);

        for id in residents.iter().chain(newcomers.iter()) {
            signal_until_finished(*id);
        }
        stop();
    }

    #[test]
    fn runtime_restarts_after_teardown() {
        let _guard = test_util::serial();
        start(1);
        assert!(init(Config::default()).is_err());
        let id = create_thread_on_core(0, || {}).unwrap();
        join(id);
        stop();

        // A fresh topology comes up cleanly after the old one is gone.
        start(2);
        assert_eq!(num_cores(), 2);
        let id = create_thread_on_core(1, || {}).unwrap();
        join(id);
        stop();
    }
}
