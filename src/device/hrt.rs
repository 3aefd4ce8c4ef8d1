//! High-resolution timer delayed-event source.
//!
//! A one-shot `timerfd` on `CLOCK_MONOTONIC` armed in relative mode. The
//! interrupt thread sits in epoll on the timerfd plus a shutdown eventfd,
//! pinned to the measured CPU; timer expiry is the interrupt. The timer
//! never restarts itself, the engine re-arms after every event.

use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::{Context, Result};
use tracing::{debug, warn};

use super::{pin_thread_to_cpu, DelayedEvent, DeviceKind, LDIST_MAX};
use crate::clock;
use crate::engine::IrqDispatch;

struct HrtShared {
    timerfd: OwnedFd,
    shutdown: OwnedFd,
    fired: AtomicBool,
}

pub struct HrtTimer {
    cpu: u32,
    sh: Arc<HrtShared>,
    ltime: u64,
    gran: u64,
}

fn timerfd_create() -> io::Result<OwnedFd> {
    let fd = unsafe {
        libc::timerfd_create(
            libc::CLOCK_MONOTONIC,
            libc::TFD_CLOEXEC | libc::TFD_NONBLOCK,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn eventfd() -> io::Result<OwnedFd> {
    let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn timerfd_settime_ns(fd: RawFd, ns: u64) -> io::Result<()> {
    let spec = libc::itimerspec {
        it_interval: libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        },
        it_value: libc::timespec {
            tv_sec: (ns / 1_000_000_000) as libc::time_t,
            tv_nsec: (ns % 1_000_000_000) as libc::c_long,
        },
    };
    if unsafe { libc::timerfd_settime(fd, 0, &spec, std::ptr::null_mut()) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

impl HrtTimer {
    pub fn new(cpu: u32) -> Result<HrtTimer> {
        let timerfd = timerfd_create().context("failed to create timerfd")?;
        let shutdown = eventfd().context("failed to create shutdown eventfd")?;
        Ok(HrtTimer {
            cpu,
            sh: Arc::new(HrtShared {
                timerfd,
                shutdown,
                fired: AtomicBool::new(false),
            }),
            ltime: 0,
            gran: clock::monotonic_resolution_ns(),
        })
    }

    pub fn cpu(&self) -> u32 {
        self.cpu
    }
}

fn irq_loop(sh: Arc<HrtShared>, irq: IrqDispatch<HrtTimer>, cpu: u32) {
    if let Err(err) = pin_thread_to_cpu(cpu) {
        warn!("failed to pin hrt interrupt thread to cpu {}: {}", cpu, err);
    }

    let mut fds = [
        libc::pollfd {
            fd: sh.timerfd.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        },
        libc::pollfd {
            fd: sh.shutdown.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        },
    ];

    loop {
        for fd in fds.iter_mut() {
            fd.revents = 0;
        }
        let ret = unsafe { libc::poll(fds.as_mut_ptr(), 2, -1) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            warn!("hrt interrupt thread poll failed: {}", err);
            break;
        }
        if fds[1].revents & libc::POLLIN != 0 {
            break;
        }
        if fds[0].revents & libc::POLLIN != 0 {
            // Consume the expiration count; the timer is one-shot so this
            // is a single read.
            let mut expirations: u64 = 0;
            let _ = unsafe {
                libc::read(
                    sh.timerfd.as_raw_fd(),
                    &mut expirations as *mut u64 as *mut libc::c_void,
                    mem::size_of::<u64>(),
                )
            };
            sh.fired.store(true, Ordering::Release);
            irq.interrupt();
        }
    }
    debug!("hrt interrupt thread exiting");
}

impl DelayedEvent for HrtTimer {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Hrt
    }

    fn init(&mut self, irq: IrqDispatch<HrtTimer>) -> Result<Option<JoinHandle<()>>> {
        // Drain any shutdown signal left over from a previous disable.
        let mut val: u64 = 0;
        let _ = unsafe {
            libc::read(
                self.sh.shutdown.as_raw_fd(),
                &mut val as *mut u64 as *mut libc::c_void,
                8,
            )
        };
        let sh = self.sh.clone();
        let cpu = self.cpu;
        let handle = std::thread::Builder::new()
            .name("wult-hrt-irq".into())
            .spawn(move || irq_loop(sh, irq, cpu))
            .context("failed to spawn hrt interrupt thread")?;
        Ok(Some(handle))
    }

    fn cancel(&mut self) {
        let _ = timerfd_settime_ns(self.sh.timerfd.as_raw_fd(), 0);
        self.ltime = 0;
        let val: u64 = 1;
        let _ = unsafe {
            libc::write(
                self.sh.shutdown.as_raw_fd(),
                &val as *const u64 as *const libc::c_void,
                8,
            )
        };
    }

    fn exit(&mut self) {
        // fds close with the struct; nothing beyond the cancelled timer.
    }

    fn arm(&mut self, ldist: u64) -> Result<u64> {
        // Clear the fired flag before the timer goes live so an immediate
        // expiry cannot be lost.
        self.sh.fired.store(false, Ordering::Release);
        timerfd_settime_ns(self.sh.timerfd.as_raw_fd(), ldist.max(1))
            .context("timerfd_settime failed")?;
        self.ltime = clock::now_ns() + ldist;
        Ok(self.ltime)
    }

    fn event_has_happened(&self) -> bool {
        self.sh.fired.load(Ordering::Acquire)
    }

    fn launch_time(&self) -> u64 {
        self.ltime
    }

    fn ldist_max(&self) -> u64 {
        LDIST_MAX
    }

    fn ldist_gran(&self) -> u64 {
        self.gran
    }
}
