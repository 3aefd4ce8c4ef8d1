//! Common test utilities: a scriptable in-process delayed-event device.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{bail, Result};

use wult::clock;
use wult::device::{DelayedEvent, DeviceKind};
use wult::engine::IrqDispatch;

#[derive(Default)]
struct MockShared {
    deadline: AtomicU64,
    armed: AtomicBool,
    fired: AtomicBool,
    shutdown: AtomicBool,
    kick: Mutex<()>,
    kick_cv: Condvar,
}

/// Fault-injection knobs, shared with the test body.
#[derive(Default)]
pub struct MockKnobs {
    /// Fail this many upcoming `arm` calls.
    pub fail_arms: AtomicU32,
    /// Report a bogus launch time (outside the sleep window) for this
    /// many upcoming `launch_time` reads.
    pub bogus_launch: AtomicU32,
}

/// An in-process timer device: fires a real interrupt thread at the
/// armed deadline, with optional fault injection.
pub struct MockTimer {
    kind: DeviceKind,
    sh: Arc<MockShared>,
    pub knobs: Arc<MockKnobs>,
    ltime: u64,
}

impl MockTimer {
    pub fn new(kind: DeviceKind) -> MockTimer {
        MockTimer {
            kind,
            sh: Arc::new(MockShared::default()),
            knobs: Arc::new(MockKnobs::default()),
            ltime: 0,
        }
    }

    pub fn knobs(&self) -> Arc<MockKnobs> {
        self.knobs.clone()
    }
}

fn timer_loop(sh: Arc<MockShared>, irq: IrqDispatch<MockTimer>) {
    loop {
        {
            let mut guard = sh.kick.lock().unwrap();
            while !sh.armed.load(Ordering::Acquire) && !sh.shutdown.load(Ordering::Acquire) {
                let (g, _) = sh
                    .kick_cv
                    .wait_timeout(guard, Duration::from_millis(50))
                    .unwrap();
                guard = g;
            }
        }
        if sh.shutdown.load(Ordering::Acquire) {
            break;
        }

        let deadline = sh.deadline.load(Ordering::Acquire);
        loop {
            let now = clock::now_ns();
            if now >= deadline || sh.shutdown.load(Ordering::Acquire) {
                break;
            }
            std::thread::sleep(Duration::from_nanos(deadline - now));
        }
        if sh.shutdown.load(Ordering::Acquire) {
            break;
        }
        if !sh.armed.swap(false, Ordering::AcqRel) {
            continue;
        }
        sh.fired.store(true, Ordering::Release);
        irq.interrupt();
    }
}

impl DelayedEvent for MockTimer {
    fn kind(&self) -> DeviceKind {
        self.kind
    }

    fn init(&mut self, irq: IrqDispatch<MockTimer>) -> Result<Option<JoinHandle<()>>> {
        // A previous disable leaves the shutdown flag set.
        self.sh.shutdown.store(false, Ordering::Release);
        let sh = self.sh.clone();
        let handle = std::thread::Builder::new()
            .name("mock-timer".into())
            .spawn(move || timer_loop(sh, irq))?;
        Ok(Some(handle))
    }

    fn cancel(&mut self) {
        self.sh.armed.store(false, Ordering::Release);
        self.sh.shutdown.store(true, Ordering::Release);
        let _guard = self.sh.kick.lock().unwrap();
        self.sh.kick_cv.notify_all();
    }

    fn exit(&mut self) {}

    fn arm(&mut self, ldist: u64) -> Result<u64> {
        let fails = self.knobs.fail_arms.load(Ordering::Acquire);
        if fails > 0 {
            self.knobs.fail_arms.store(fails - 1, Ordering::Release);
            bail!("injected arm failure");
        }

        self.sh.fired.store(false, Ordering::Release);
        let deadline = clock::now_ns() + ldist;
        self.sh.deadline.store(deadline, Ordering::Release);
        self.sh.armed.store(true, Ordering::Release);
        {
            let _guard = self.sh.kick.lock().unwrap();
            self.sh.kick_cv.notify_all();
        }
        self.ltime = deadline;
        Ok(deadline)
    }

    fn event_has_happened(&self) -> bool {
        self.sh.fired.load(Ordering::Acquire)
    }

    fn launch_time(&self) -> u64 {
        let bogus = self.knobs.bogus_launch.load(Ordering::Acquire);
        if bogus > 0 {
            self.knobs.bogus_launch.store(bogus - 1, Ordering::Release);
            // Far in the future: always outside the observed sleep
            // window.
            return self.ltime + 60_000_000_000;
        }
        self.ltime
    }
}
