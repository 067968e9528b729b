use std::future::Future;
use std::io;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::{sleep_until, timeout, Instant};
use tun_rs::AsyncDevice;

/// Default inter-write pacing interval: 50 ms, i.e. 20 packets per second
/// on each side.
pub const DEFAULT_PACING: Duration = Duration::from_micros(50_000);

/// Readiness probes over one of the scheduler's two fds.
///
/// The scheduler only ever asks an fd whether it can be read or written; it
/// never transfers data itself. Implemented for the tap device and the
/// carrier socket, and by scripted stand-ins in tests.
pub trait Readiness {
    fn readable(&self) -> impl Future<Output = io::Result<()>> + '_;
    fn writable(&self) -> impl Future<Output = io::Result<()>> + '_;
}

impl Readiness for AsyncDevice {
    fn readable(&self) -> impl Future<Output = io::Result<()>> + '_ {
        AsyncDevice::readable(self)
    }
    fn writable(&self) -> impl Future<Output = io::Result<()>> + '_ {
        AsyncDevice::writable(self)
    }
}

impl Readiness for TcpStream {
    fn readable(&self) -> impl Future<Output = io::Result<()>> + '_ {
        TcpStream::readable(self)
    }
    fn writable(&self) -> impl Future<Output = io::Result<()>> + '_ {
        TcpStream::writable(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Tap,
    Sock,
}

/// What one scheduler tick found ready.
///
/// `sock_out` means the head of the tap-side queue is due on the carrier
/// now; `tap_out` means the head of the carrier-side queue is due on the
/// tap. The overrun flags report a deadline that fired while the output fd
/// was not writable; the deadline is left in place so the write is retried
/// on the next tick.
#[derive(Debug, Default, Clone, Copy)]
pub struct Ready {
    pub tap_in: bool,
    pub sock_in: bool,
    pub tap_out: bool,
    pub sock_out: bool,
    pub tap_overrun: bool,
    pub sock_overrun: bool,
}

/// Rate-paced I/O scheduler over the tap device and the carrier socket.
///
/// Input is driven by packet arrivals; output is driven by one wall-clock
/// deadline per direction. A deadline only advances when its write was
/// actually possible, so each side emits at most one packet per pacing
/// interval. An unset deadline means that direction is idle, and with both
/// directions idle a tick blocks until something arrives.
#[derive(Debug)]
pub struct Scheduler {
    interval: Duration,
    tap_next_out: Option<Instant>,
    sock_next_out: Option<Instant>,
}

impl Scheduler {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            tap_next_out: None,
            sock_next_out: None,
        }
    }

    /// Release the tap-side output deadline (its queue drained empty).
    pub fn clear_tap_deadline(&mut self) {
        self.tap_next_out = None;
    }
    /// Release the carrier-side output deadline.
    pub fn clear_sock_deadline(&mut self) {
        self.sock_next_out = None;
    }

    /// The side owing the next output and its deadline. When both deadlines
    /// are due, the remaining times compare equal at zero and the carrier
    /// side wins.
    fn nearest_deadline(&self) -> Option<(Side, Instant)> {
        match (self.tap_next_out, self.sock_next_out) {
            (None, None) => None,
            (Some(tap), None) => Some((Side::Tap, tap)),
            (None, Some(sock)) => Some((Side::Sock, sock)),
            (Some(tap), Some(sock)) => {
                let now = Instant::now();
                if tap.saturating_duration_since(now) < sock.saturating_duration_since(now) {
                    Some((Side::Tap, tap))
                } else {
                    Some((Side::Sock, sock))
                }
            }
        }
    }

    pub async fn tick<T, S>(&mut self, tap: &T, sock: &S) -> io::Result<Ready>
    where
        T: Readiness,
        S: Readiness,
    {
        let mut ready = Ready::default();
        let fired = match self.nearest_deadline() {
            None => {
                tokio::select! {
                    r = tap.readable() => {
                        r?;
                        ready.tap_in = true;
                        None
                    }
                    r = sock.readable() => {
                        r?;
                        ready.sock_in = true;
                        None
                    }
                }
            }
            Some((side, deadline)) => {
                tokio::select! {
                    r = tap.readable() => {
                        r?;
                        ready.tap_in = true;
                        None
                    }
                    r = sock.readable() => {
                        r?;
                        ready.sock_in = true;
                        None
                    }
                    _ = sleep_until(deadline) => Some(side),
                }
            }
        };

        let now = Instant::now();
        // the first packet's pacing deadline is armed at arrival, before the
        // read and the enqueue happen
        if ready.tap_in && self.tap_next_out.is_none() {
            self.tap_next_out = Some(now + self.interval);
        }
        if ready.sock_in && self.sock_next_out.is_none() {
            self.sock_next_out = Some(now + self.interval);
        }

        match fired {
            Some(Side::Tap) => {
                if probe_writable(sock.writable()).await? {
                    self.tap_next_out = Some(now + self.interval);
                    ready.sock_out = true;
                } else {
                    ready.sock_overrun = true;
                }
            }
            Some(Side::Sock) => {
                if probe_writable(tap.writable()).await? {
                    self.sock_next_out = Some(now + self.interval);
                    ready.tap_out = true;
                } else {
                    ready.tap_overrun = true;
                }
            }
            None => {}
        }
        Ok(ready)
    }
}

/// Zero-timeout writability probe: reports whether the fd is writable right
/// now, without ever blocking on it.
async fn probe_writable<F>(writable: F) -> io::Result<bool>
where
    F: Future<Output = io::Result<()>>,
{
    match timeout(Duration::ZERO, writable).await {
        Ok(result) => result.map(|()| true),
        Err(_elapsed) => Ok(false),
    }
}
