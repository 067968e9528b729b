use std::io;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tun_rs::AsyncDevice;

use crate::congestion::{AckSpoofer, InboundVerdict, ReverseAction};
use crate::packet::{self, TunnelPacket, MAX_FRAME};
use crate::queue::PacketQueue;
use crate::sched::{Ready, Scheduler, DEFAULT_PACING};

pub const DEFAULT_QUEUE_CAPACITY: usize = 100;
pub const DEFAULT_HIGH_WATER: usize = 20;

/// Room for one frame plus slack; the tap never hands us more than the
/// interface MTU, but a short read buffer would silently truncate.
const READ_BUF_LEN: usize = 2000;

#[derive(Debug, Clone, Copy)]
pub struct TunnelConfig {
    /// Minimum spacing between successive writes on each side.
    pub pacing: Duration,
    /// Slot count of each direction's queue (one slot stays reserved).
    pub queue_capacity: usize,
    /// Tap-side fullness above which the congestion signal arms.
    pub high_water: usize,
    /// False in tap mode: duplicate-ACK fabrication needs raw IPv4 frames.
    pub spoofing: bool,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            pacing: DEFAULT_PACING,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            high_water: DEFAULT_HIGH_WATER,
            spoofing: true,
        }
    }
}

/// One tunnel endpoint: bridges a tun/tap device and the carrier TCP
/// connection through two rate-paced queues, injecting fabricated duplicate
/// ACKs on the reverse path when the forward queue runs hot.
///
/// ```text
///  tap  --read-->  [qtap]  --paced write-->  carrier
///  carrier --read--> [qsock] --paced write--> tap
/// ```
pub struct Tunnel {
    tap: AsyncDevice,
    sock: TcpStream,
    qtap: PacketQueue,
    qsock: PacketQueue,
    sched: Scheduler,
    spoofer: AckSpoofer,
    tap2net: u64,
    net2tap: u64,
}

impl Tunnel {
    pub fn new(tap: AsyncDevice, sock: TcpStream, config: TunnelConfig) -> Self {
        Self {
            tap,
            sock,
            qtap: PacketQueue::new(config.queue_capacity, "qtap"),
            qsock: PacketQueue::new(config.queue_capacity, "qsock"),
            sched: Scheduler::new(config.pacing),
            spoofer: AckSpoofer::new(config.high_water, config.spoofing),
            tap2net: 0,
            net2tap: 0,
        }
    }

    /// Run the endpoint until the tap or the carrier fails. There is no
    /// orderly shutdown: loss of the carrier is fatal by design.
    pub async fn run(mut self) -> io::Result<()> {
        let mut read_buf = vec![0u8; READ_BUF_LEN];
        loop {
            let ready: Ready = self.sched.tick(&self.tap, &self.sock).await?;
            if ready.tap_in {
                self.tap_inbound(&mut read_buf).await?;
            }
            if ready.sock_in {
                self.sock_inbound().await?;
            }
            if ready.sock_out {
                self.carrier_outbound().await?;
            }
            if ready.tap_out {
                self.tap_outbound().await?;
            }
            if ready.sock_overrun {
                log::debug!("carrier not writable at its deadline, retrying");
            }
            if ready.tap_overrun {
                log::debug!("tap not writable at its deadline, retrying");
            }
        }
    }

    async fn tap_inbound(&mut self, buf: &mut [u8]) -> io::Result<()> {
        let n = self.tap.recv(buf).await?;
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "tap device closed"));
        }
        self.tap2net += 1;
        log::debug!("tap2net {}: read {} bytes from the tap", self.tap2net, n);
        if n > MAX_FRAME {
            log::warn!("dropping {n} byte frame: larger than the carrier framing allows");
            return Ok(());
        }
        let pkt = TunnelPacket::from_slice(&buf[..n]);
        if self.spoofer.on_tap_inbound(&pkt) == InboundVerdict::Suppress {
            return Ok(());
        }
        let seq = packet::tcp_seq(pkt.data());
        if self.qtap.enqueue(pkt).is_ok() {
            self.spoofer.on_enqueued(seq, self.qtap.fullness());
        }
        Ok(())
    }

    async fn sock_inbound(&mut self) -> io::Result<()> {
        let pkt = read_frame(&mut self.sock).await?;
        self.net2tap += 1;
        log::debug!("net2tap {}: read {} bytes from the carrier", self.net2tap, pkt.len());
        // overflow is logged by the queue; the frame is simply dropped
        let _ = self.qsock.enqueue(pkt);
        Ok(())
    }

    async fn carrier_outbound(&mut self) -> io::Result<()> {
        match self.qtap.dequeue() {
            None => self.sched.clear_tap_deadline(),
            Some(pkt) => {
                write_frame(&mut self.sock, pkt.data()).await?;
                log::debug!(
                    "tap2net: wrote {} bytes to the carrier after {:?} queued",
                    pkt.len(),
                    pkt.arrived().elapsed(),
                );
            }
        }
        Ok(())
    }

    async fn tap_outbound(&mut self) -> io::Result<()> {
        match self.spoofer.on_tap_write(&mut self.qsock) {
            ReverseAction::QueueEmpty => self.sched.clear_sock_deadline(),
            ReverseAction::Forward(pkt) => {
                self.tap.send(pkt.data()).await?;
                log::debug!("net2tap: wrote {} bytes to the tap", pkt.len());
            }
            ReverseAction::Burst(dupacks) => {
                for dupack in &dupacks {
                    self.tap.send(dupack.data()).await?;
                }
                log::debug!("net2tap: injected {} duplicate acks", dupacks.len());
            }
        }
        Ok(())
    }
}

/// Read one length-prefixed frame from the carrier. The prefix is a 16-bit
/// big-endian byte count; a value of zero or above [`MAX_FRAME`] means the
/// framing is desynchronised, which is unrecoverable.
async fn read_frame<R: AsyncRead + Unpin>(sock: &mut R) -> io::Result<TunnelPacket> {
    let mut len_buf = [0u8; 2];
    sock.read_exact(&mut len_buf).await?;
    let len = u16::from_be_bytes(len_buf) as usize;
    if len == 0 || len > MAX_FRAME {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("carrier frame length {len} out of range"),
        ));
    }
    let mut buf = BytesMut::zeroed(len);
    sock.read_exact(&mut buf).await?;
    Ok(TunnelPacket::new(buf))
}

async fn write_frame<W: AsyncWrite + Unpin>(sock: &mut W, frame: &[u8]) -> io::Result<()> {
    sock.write_all(&(frame.len() as u16).to_be_bytes()).await?;
    sock.write_all(frame).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_round_trip_over_the_carrier() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let payload: Vec<u8> = (0..200u16).map(|v| v as u8).collect();
        write_frame(&mut a, &payload).await.unwrap();
        write_frame(&mut a, &[0x45]).await.unwrap();

        let first = read_frame(&mut b).await.unwrap();
        assert_eq!(first.data(), &payload[..]);
        let second = read_frame(&mut b).await.unwrap();
        assert_eq!(second.data(), &[0x45]);
    }

    #[tokio::test]
    async fn zero_length_prefix_is_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&[0, 0]).await.unwrap();
        let err = read_frame(&mut b).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn oversize_length_prefix_is_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&(MAX_FRAME as u16 + 1).to_be_bytes()).await.unwrap();
        let err = read_frame(&mut b).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn carrier_eof_is_fatal() {
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);
        let err = read_frame(&mut b).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn eof_inside_a_frame_is_fatal() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&[0, 10, 1, 2, 3]).await.unwrap();
        drop(a);
        let err = read_frame(&mut b).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
