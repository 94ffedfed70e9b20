//! Event loop shared by the mainline and realtime threads.
//!
//! One epoll instance watches three kinds of descriptors: a monotonic
//! interval timer (timerfd), a cross-thread wake descriptor (eventfd) and
//! whatever sockets the CAN module or the gateway registered. Each tick
//! blocks exactly once, in [`EventLoop::wait`]. Callees may lower
//! [`EventLoop::timer_next_us`] during the tick to be woken earlier than
//! the configured period; [`EventLoop::process_last`] re-arms the timer
//! accordingly.

use std::os::unix::io::RawFd;
use std::sync::Arc;

use log::debug;
use nix::sys::epoll::{
    epoll_create1, epoll_ctl, epoll_wait, EpollCreateFlags, EpollEvent, EpollFlags, EpollOp,
};

use crate::err::DriverError;
use crate::util;

/// Wakes an [`EventLoop`] from another thread by writing to its eventfd.
/// Multiple wakes between two ticks coalesce into one.
pub struct Notifier {
    fd: Arc<NotifyFd>,
}

struct NotifyFd(RawFd);

impl Drop for NotifyFd {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.0);
        }
    }
}

impl Clone for Notifier {
    fn clone(&self) -> Self {
        Notifier {
            fd: Arc::clone(&self.fd),
        }
    }
}

impl Notifier {
    pub fn wake(&self) {
        let buf = 1u64.to_ne_bytes();
        if util::write_fd(self.fd.0, &buf).is_err() {
            debug!("wake write failed");
        }
    }
}

pub struct EventLoop {
    epoll_fd: RawFd,
    timer_fd: RawFd,
    event_fd: RawFd,
    interval_us: u32,
    previous_us: u64,
    /// Monotonic microseconds since the previous [`wait`](Self::wait)
    /// returned; passed to all time-based protocol processing.
    pub time_difference_us: u32,
    /// Deadline advisory for the next tick. Seeded with the period on
    /// every wait; callees may lower it.
    pub timer_next_us: u32,
    /// True when this tick was caused by the interval timer.
    pub timer_event: bool,
    pending: Option<(u64, EpollFlags)>,
}

impl EventLoop {
    pub fn new(interval_us: u32) -> Result<Self, DriverError> {
        let epoll_fd = epoll_create1(EpollCreateFlags::EPOLL_CLOEXEC)?;

        let event_fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if event_fd < 0 {
            return Err(DriverError::Syscall(std::io::Error::last_os_error()));
        }
        let mut ev = EpollEvent::new(EpollFlags::EPOLLIN, event_fd as u64);
        epoll_ctl(epoll_fd, EpollOp::EpollCtlAdd, event_fd, &mut ev)?;

        let timer_fd =
            unsafe { libc::timerfd_create(libc::CLOCK_MONOTONIC, libc::TFD_NONBLOCK | libc::TFD_CLOEXEC) };
        if timer_fd < 0 {
            return Err(DriverError::Syscall(std::io::Error::last_os_error()));
        }
        let mut ev = EpollEvent::new(EpollFlags::EPOLLIN, timer_fd as u64);
        epoll_ctl(epoll_fd, EpollOp::EpollCtlAdd, timer_fd, &mut ev)?;

        let ep = EventLoop {
            epoll_fd,
            timer_fd,
            event_fd,
            interval_us,
            previous_us: util::monotonic_us(),
            time_difference_us: 0,
            timer_next_us: interval_us,
            timer_event: false,
            pending: None,
        };
        // first shot right away, then the configured period
        ep.arm_timer_ns(1)?;
        Ok(ep)
    }

    pub fn epoll_fd(&self) -> RawFd {
        self.epoll_fd
    }

    pub fn interval_us(&self) -> u32 {
        self.interval_us
    }

    /// A wake handle usable from other threads. The underlying descriptor
    /// is duplicated, so the handle stays valid on its own.
    pub fn notifier(&self) -> Result<Notifier, DriverError> {
        let fd = unsafe { libc::dup(self.event_fd) };
        if fd < 0 {
            return Err(DriverError::Syscall(std::io::Error::last_os_error()));
        }
        Ok(Notifier {
            fd: Arc::new(NotifyFd(fd)),
        })
    }

    /// Block until a descriptor is ready, then classify the event. Timer
    /// and wake events are drained here; anything else is left in the
    /// handle for callees to inspect and consume during the tick.
    pub fn wait(&mut self) {
        let mut events = [EpollEvent::empty()];
        let ready = epoll_wait(self.epoll_fd, &mut events, -1);

        self.pending = None;
        self.timer_event = false;

        let now = util::monotonic_us();
        self.time_difference_us = now.saturating_sub(self.previous_us) as u32;
        self.previous_us = now;
        self.timer_next_us = self.interval_us;

        match ready {
            Err(nix::Error::Sys(nix::errno::Errno::EINTR)) => {
                // interrupted by a signal, nothing to process
            }
            Err(e) => debug!("epoll_wait: {}", e),
            Ok(0) => {}
            Ok(_) => {
                let data = events[0].data();
                let flags = events[0].events();
                if flags.contains(EpollFlags::EPOLLIN) && data == self.event_fd as u64 {
                    let mut buf = [0u8; 8];
                    if util::read_fd(self.event_fd, &mut buf).is_err() {
                        debug!("read(event_fd) failed");
                    }
                } else if flags.contains(EpollFlags::EPOLLIN) && data == self.timer_fd as u64 {
                    // the timer must be drained or it would re-wake forever
                    let mut buf = [0u8; 8];
                    if let Err(e) = util::read_fd(self.timer_fd, &mut buf) {
                        if e.kind() != std::io::ErrorKind::WouldBlock {
                            debug!("read(timer_fd) failed: {}", e);
                        }
                    }
                    self.timer_event = true;
                } else {
                    self.pending = Some((data, flags));
                }
            }
        }
    }

    /// The not-yet-consumed event of this tick, if any.
    pub fn pending_event(&self) -> Option<(RawFd, EpollFlags)> {
        self.pending.map(|(data, flags)| (data as RawFd, flags))
    }

    /// Mark the pending event as handled.
    pub fn consume_event(&mut self) {
        self.pending = None;
    }

    /// Tail of a tick: complain about events nobody consumed and re-arm
    /// the timer if a callee asked to be woken sooner than the period.
    pub fn process_last(&mut self) {
        if let Some((data, flags)) = self.pending.take() {
            debug!("unhandled epoll event {:?} on fd {}", flags, data);
        }

        if self.timer_next_us < self.interval_us {
            // one extra microsecond so the timer value can never be zero,
            // which would disarm it
            self.timer_next_us += 1;
            if let Err(e) = self.arm_timer_ns(self.timer_next_us as i64 * 1_000) {
                debug!("timerfd_settime failed: {}", e);
            }
        }
    }

    fn arm_timer_ns(&self, value_ns: i64) -> Result<(), DriverError> {
        let tm = libc::itimerspec {
            it_interval: libc::timespec {
                tv_sec: (self.interval_us / 1_000_000) as libc::time_t,
                tv_nsec: ((self.interval_us % 1_000_000) * 1_000) as libc::c_long,
            },
            it_value: libc::timespec {
                tv_sec: (value_ns / 1_000_000_000) as libc::time_t,
                tv_nsec: (value_ns % 1_000_000_000) as libc::c_long,
            },
        };
        let ret = unsafe { libc::timerfd_settime(self.timer_fd, 0, &tm, std::ptr::null_mut()) };
        if ret < 0 {
            return Err(DriverError::Syscall(std::io::Error::last_os_error()));
        }
        Ok(())
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.timer_fd);
            libc::close(self.event_fd);
            libc::close(self.epoll_fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[test]
    fn timer_fires_immediately_then_periodically() {
        let mut ep = EventLoop::new(10_000).unwrap();

        let start = Instant::now();
        ep.wait();
        assert!(ep.timer_event);
        assert!(start.elapsed() < Duration::from_secs(1));

        let start = Instant::now();
        ep.wait();
        ep.process_last();
        assert!(ep.timer_event);
        let elapsed = start.elapsed();
        assert!(elapsed < Duration::from_millis(500), "elapsed {:?}", elapsed);
    }

    #[test]
    fn notifier_wakes_before_the_period() {
        let mut ep = EventLoop::new(2_000_000).unwrap();
        ep.wait(); // immediate first shot

        let notifier = ep.notifier().unwrap();
        let t = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            notifier.wake();
        });

        let start = Instant::now();
        ep.wait();
        t.join().unwrap();
        assert!(!ep.timer_event);
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn wakes_coalesce() {
        let mut ep = EventLoop::new(2_000_000).unwrap();
        ep.wait();

        let notifier = ep.notifier().unwrap();
        notifier.wake();
        notifier.wake();
        notifier.wake();

        ep.wait();
        assert!(!ep.timer_event);

        // all three wakes were drained above; the next tick comes from the
        // lowered deadline, not a stale wake
        ep.timer_next_us = 30_000;
        ep.process_last();
        let start = Instant::now();
        ep.wait();
        assert!(ep.timer_event);
        assert!(start.elapsed() >= Duration::from_millis(20));
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn lowered_deadline_rearms_the_timer() {
        let mut ep = EventLoop::new(1_000_000).unwrap();
        ep.wait(); // immediate first shot

        ep.timer_next_us = 20_000;
        ep.process_last();

        let start = Instant::now();
        ep.wait();
        assert!(ep.timer_event);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(15), "elapsed {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(500), "elapsed {:?}", elapsed);
    }

    #[test]
    fn deltas_accumulate_monotonically() {
        let mut ep = EventLoop::new(5_000).unwrap();
        ep.wait();
        let mut total = 0u64;
        for _ in 0..3 {
            ep.wait();
            ep.process_last();
            total += ep.time_difference_us as u64;
        }
        assert!(total >= 5_000, "total {}", total);
        assert!(total < 5_000_000);
    }
}
