use bytes::BytesMut;
use pnet_packet::ip::IpNextHeaderProtocols;
use pnet_packet::ipv4::Ipv4Packet;
use pnet_packet::tcp::{TcpFlags, TcpOptionNumbers, TcpPacket};
use pnet_packet::Packet;
use tokio::time::Instant;

/// Largest frame the carrier framing can express and the queues will accept.
pub const MAX_FRAME: usize = 1500;

const TCP_HEADER_LEN: usize = 20;
/// Two NOP pads followed by the 10-byte timestamp option.
const TS_BLOCK_LEN: usize = 12;

/// One owned IP datagram (or Ethernet frame in tap mode) moving through the
/// tunnel, stamped with its arrival time for queue accounting.
#[derive(Debug)]
pub struct TunnelPacket {
    buf: BytesMut,
    arrived: Instant,
}

impl TunnelPacket {
    pub fn new(buf: BytesMut) -> Self {
        Self {
            buf,
            arrived: Instant::now(),
        }
    }
    pub fn from_slice(data: &[u8]) -> Self {
        Self::new(BytesMut::from(data))
    }
    pub fn len(&self) -> usize {
        self.buf.len()
    }
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
    pub fn data(&self) -> &[u8] {
        &self.buf
    }
    pub fn arrived(&self) -> Instant {
        self.arrived
    }
    pub fn into_bytes(self) -> BytesMut {
        self.buf
    }
}

fn tcp_segment(buf: &[u8]) -> Option<TcpPacket<'_>> {
    let ip = Ipv4Packet::new(buf)?;
    if ip.get_version() != 4 || ip.get_next_level_protocol() != IpNextHeaderProtocols::Tcp {
        return None;
    }
    let ihl = ip.get_header_length() as usize * 4;
    if ihl < 20 || buf.len() < ihl {
        return None;
    }
    TcpPacket::new(&buf[ihl..])
}

/// True iff `buf` is an IPv4 TCP segment with the ACK flag set, none of
/// URG/PSH/RST/SYN/FIN, and no payload bytes. Anything unparseable is not a
/// pure ACK.
pub fn is_pure_tcp_ack(buf: &[u8]) -> bool {
    let Some(ip) = Ipv4Packet::new(buf) else {
        return false;
    };
    let Some(tcp) = tcp_segment(buf) else {
        return false;
    };
    let flags = tcp.get_flags();
    if flags & TcpFlags::ACK == 0 {
        return false;
    }
    if flags & (TcpFlags::URG | TcpFlags::PSH | TcpFlags::RST | TcpFlags::SYN | TcpFlags::FIN) != 0 {
        return false;
    }
    let ihl = ip.get_header_length() as usize * 4;
    let data_offset = tcp.get_data_offset() as usize * 4;
    ip.get_total_length() as usize == ihl + data_offset
}

/// Sequence number of a TCP segment, in host order.
pub fn tcp_seq(buf: &[u8]) -> Option<u32> {
    tcp_segment(buf).map(|tcp| tcp.get_sequence())
}

/// Acknowledgement number of a TCP segment, in host order. `None` when the
/// ACK flag is clear.
pub fn tcp_ack_seq(buf: &[u8]) -> Option<u32> {
    let tcp = tcp_segment(buf)?;
    if tcp.get_flags() & TcpFlags::ACK == 0 {
        return None;
    }
    Some(tcp.get_acknowledgement())
}

/// `TSval` of the first timestamp option in the segment, located by walking
/// the TCP option list.
pub fn timestamp_val(buf: &[u8]) -> Option<u32> {
    let tcp = tcp_segment(buf)?;
    for option in tcp.get_options_iter() {
        if option.get_number() == TcpOptionNumbers::TIMESTAMPS {
            let payload = option.payload();
            if payload.len() >= 4 {
                return Some(u32::from_be_bytes([
                    payload[0], payload[1], payload[2], payload[3],
                ]));
            }
        }
    }
    None
}

/// True iff `buf` is a pure ACK whose option bytes are exactly the padded
/// timestamp block (`NOP NOP 8 10 TSval TSecr`) right after the TCP header.
/// Only such segments can serve as duplicate-ACK templates; [`build_dupack`]
/// patches the block at fixed offsets.
pub fn is_cloneable_ack(buf: &[u8]) -> bool {
    if !is_pure_tcp_ack(buf) {
        return false;
    }
    let Some(tcp) = tcp_segment(buf) else {
        return false;
    };
    if tcp.get_data_offset() as usize * 4 != TCP_HEADER_LEN + TS_BLOCK_LEN {
        return false;
    }
    let Some(ip) = Ipv4Packet::new(buf) else {
        return false;
    };
    let ihl = ip.get_header_length() as usize * 4;
    let block = ihl + TCP_HEADER_LEN;
    buf.len() >= block + TS_BLOCK_LEN
        && buf[block..block + 4]
            == [
                TcpOptionNumbers::NOP.0,
                TcpOptionNumbers::NOP.0,
                TcpOptionNumbers::TIMESTAMPS.0,
                10,
            ]
}

/// Clone a duplicate ACK from a captured template.
///
/// The clone differs from the template in exactly three places: the IP id is
/// bumped by `plus` (wrapping, so every dupack of a burst gets a distinct id
/// and receivers do not coalesce them), `TSval` is replaced, and both
/// checksums are recomputed. Returns `None` unless the template
/// [`is_cloneable_ack`].
pub fn build_dupack(template: &[u8], plus: u16, tsval: u32) -> Option<TunnelPacket> {
    if !is_cloneable_ack(template) {
        return None;
    }
    let ip = Ipv4Packet::new(template)?;
    let ihl = ip.get_header_length() as usize * 4;
    let total = ihl + TCP_HEADER_LEN + TS_BLOCK_LEN;
    let (src, dst) = (ip.get_source(), ip.get_destination());
    let id = ip.get_identification().wrapping_add(plus);

    let mut buf = BytesMut::from(&template[..total]);
    buf[4..6].copy_from_slice(&id.to_be_bytes());
    buf[10..12].fill(0);
    let ip_check = pnet_packet::util::checksum(&buf[..ihl], 5);
    buf[10..12].copy_from_slice(&ip_check.to_be_bytes());

    let tsval_at = ihl + TCP_HEADER_LEN + 4;
    buf[tsval_at..tsval_at + 4].copy_from_slice(&tsval.to_be_bytes());
    buf[ihl + 16..ihl + 18].fill(0);
    let tcp_check =
        pnet_packet::util::ipv4_checksum(&buf[ihl..], 8, &[], &src, &dst, IpNextHeaderProtocols::Tcp);
    buf[ihl + 16..ihl + 18].copy_from_slice(&tcp_check.to_be_bytes());

    Some(TunnelPacket::new(buf))
}

#[cfg(test)]
pub(crate) mod fixtures {
    use bytes::{BufMut, BytesMut};
    use pnet_packet::ip::IpNextHeaderProtocols;
    use pnet_packet::tcp::{TcpFlags, TcpOptionNumbers};
    use std::net::Ipv4Addr;

    pub(crate) const SRC: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
    pub(crate) const DST: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);

    fn ipv4_header(buf: &mut BytesMut, total_len: u16, id: u16) {
        buf.put_u8(0x45);
        buf.put_u8(0);
        buf.put_u16(total_len);
        buf.put_u16(id);
        buf.put_u16(0x4000);
        buf.put_u8(64);
        buf.put_u8(6);
        buf.put_u16(0);
        buf.put_slice(&SRC.octets());
        buf.put_slice(&DST.octets());
        let check = pnet_packet::util::checksum(&buf[..20], 5);
        buf[10..12].copy_from_slice(&check.to_be_bytes());
    }

    fn tcp_checksum(buf: &mut BytesMut) {
        let check =
            pnet_packet::util::ipv4_checksum(&buf[20..], 8, &[], &SRC, &DST, IpNextHeaderProtocols::Tcp);
        buf[36..38].copy_from_slice(&check.to_be_bytes());
    }

    /// A 52-byte pure ACK carrying the padded timestamp block.
    pub(crate) fn pure_ack(seq: u32, ack: u32, id: u16, tsval: u32, tsecr: u32) -> BytesMut {
        let mut buf = BytesMut::with_capacity(52);
        ipv4_header(&mut buf, 52, id);
        buf.put_u16(5000);
        buf.put_u16(80);
        buf.put_u32(seq);
        buf.put_u32(ack);
        buf.put_u8(8 << 4);
        buf.put_u8(TcpFlags::ACK);
        buf.put_u16(0xFFFF);
        buf.put_u16(0);
        buf.put_u16(0);
        buf.put_slice(&[
            TcpOptionNumbers::NOP.0,
            TcpOptionNumbers::NOP.0,
            TcpOptionNumbers::TIMESTAMPS.0,
            10,
        ]);
        buf.put_u32(tsval);
        buf.put_u32(tsecr);
        tcp_checksum(&mut buf);
        buf
    }

    /// A data-bearing TCP segment with a plain 20-byte TCP header.
    pub(crate) fn data_segment(seq: u32, payload_len: usize) -> BytesMut {
        let mut buf = BytesMut::with_capacity(40 + payload_len);
        ipv4_header(&mut buf, (40 + payload_len) as u16, 7);
        buf.put_u16(5000);
        buf.put_u16(80);
        buf.put_u32(seq);
        buf.put_u32(0);
        buf.put_u8(5 << 4);
        buf.put_u8(TcpFlags::ACK | TcpFlags::PSH);
        buf.put_u16(0xFFFF);
        buf.put_u16(0);
        buf.put_u16(0);
        buf.put_bytes(0xAB, payload_len);
        tcp_checksum(&mut buf);
        buf
    }

    /// A pure ACK whose options start with MSS instead of the padded
    /// timestamp block (timestamp still present, just not at the fixed
    /// offset).
    pub(crate) fn mss_first_ack(seq: u32, ack: u32, tsval: u32) -> BytesMut {
        let mut buf = BytesMut::with_capacity(56);
        ipv4_header(&mut buf, 56, 9);
        buf.put_u16(5000);
        buf.put_u16(80);
        buf.put_u32(seq);
        buf.put_u32(ack);
        buf.put_u8(9 << 4);
        buf.put_u8(TcpFlags::ACK);
        buf.put_u16(0xFFFF);
        buf.put_u16(0);
        buf.put_u16(0);
        buf.put_slice(&[TcpOptionNumbers::MSS.0, 4]);
        buf.put_u16(1460);
        buf.put_slice(&[
            TcpOptionNumbers::NOP.0,
            TcpOptionNumbers::NOP.0,
            TcpOptionNumbers::TIMESTAMPS.0,
            10,
        ]);
        buf.put_u32(tsval);
        buf.put_u32(tsecr_of(tsval));
        tcp_checksum(&mut buf);
        buf
    }

    fn tsecr_of(tsval: u32) -> u32 {
        tsval.wrapping_sub(100)
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::{data_segment, mss_first_ack, pure_ack};
    use super::*;

    #[test]
    fn pure_ack_classification() {
        assert!(is_pure_tcp_ack(&pure_ack(1, 1000, 42, 7, 3)));
        assert!(is_pure_tcp_ack(&mss_first_ack(1, 1000, 7)));
        assert!(!is_pure_tcp_ack(&data_segment(1, 100)));

        let mut syn = pure_ack(1, 1000, 42, 7, 3);
        syn[33] |= TcpFlags::SYN;
        assert!(!is_pure_tcp_ack(&syn));

        let mut udp = pure_ack(1, 1000, 42, 7, 3);
        udp[9] = 17;
        assert!(!is_pure_tcp_ack(&udp));

        assert!(!is_pure_tcp_ack(&pure_ack(1, 1000, 42, 7, 3)[..19]));
        assert!(!is_pure_tcp_ack(&[]));
    }

    #[test]
    fn sequence_accessors() {
        let ack = pure_ack(0xDEAD_BEEF, 0x1234_5678, 42, 7, 3);
        assert_eq!(tcp_seq(&ack), Some(0xDEAD_BEEF));
        assert_eq!(tcp_ack_seq(&ack), Some(0x1234_5678));

        let mut no_ack = pure_ack(5, 6, 42, 7, 3);
        no_ack[33] = 0;
        assert_eq!(tcp_seq(&no_ack), Some(5));
        assert_eq!(tcp_ack_seq(&no_ack), None);

        assert_eq!(tcp_seq(&[0u8; 10]), None);
    }

    #[test]
    fn timestamp_scan_handles_any_option_order() {
        assert_eq!(timestamp_val(&pure_ack(1, 2, 42, 0xCAFE_F00D, 3)), Some(0xCAFE_F00D));
        assert_eq!(timestamp_val(&mss_first_ack(1, 2, 0xAA55_AA55)), Some(0xAA55_AA55));
        assert_eq!(timestamp_val(&data_segment(1, 100)), None);
    }

    #[test]
    fn cloneable_requires_the_fixed_block() {
        assert!(is_cloneable_ack(&pure_ack(1, 2, 42, 7, 3)));
        assert!(!is_cloneable_ack(&mss_first_ack(1, 2, 7)));
        assert!(!is_cloneable_ack(&data_segment(1, 100)));
    }

    #[test]
    fn dupack_with_zero_plus_reproduces_the_template() {
        let template = pure_ack(1000, 900, 42, 7, 3);
        let clone = build_dupack(&template, 0, 7).unwrap();
        assert_eq!(clone.data(), &template[..]);
    }

    #[test]
    fn dupack_patches_id_tsval_and_checksums() {
        let template = pure_ack(1000, 900, 42, 7, 3);
        let clone = build_dupack(&template, 5, 0x0BAD_CAFE).unwrap();
        let out = clone.data();

        assert_eq!(out.len(), template.len());
        assert_eq!(u16::from_be_bytes([out[4], out[5]]), 47);
        assert_eq!(&out[40..44], &0x0BAD_CAFEu32.to_be_bytes());
        // tsecr untouched
        assert_eq!(&out[44..48], &template[44..48]);
        // everything outside id, the checksums, and tsval matches the template
        for i in (0..out.len()).filter(|i| !(4..6).contains(i) && !(10..12).contains(i) && !(36..38).contains(i) && !(40..44).contains(i)) {
            assert_eq!(out[i], template[i], "byte {i} differs");
        }

        // both checksums verify by recomputation
        let mut check = BytesMut::from(out);
        check[10..12].fill(0);
        let ip_check = pnet_packet::util::checksum(&check[..20], 5);
        assert_eq!(&out[10..12], &ip_check.to_be_bytes());
        check[36..38].fill(0);
        let tcp_check = pnet_packet::util::ipv4_checksum(
            &check[20..],
            8,
            &[],
            &fixtures::SRC,
            &fixtures::DST,
            IpNextHeaderProtocols::Tcp,
        );
        assert_eq!(&out[36..38], &tcp_check.to_be_bytes());
    }

    #[test]
    fn dupack_ip_id_wraps() {
        let template = pure_ack(1000, 900, 0xFFFE, 7, 3);
        let clone = build_dupack(&template, 5, 7).unwrap();
        assert_eq!(u16::from_be_bytes([clone.data()[4], clone.data()[5]]), 3);
    }

    #[test]
    fn dupack_rejects_unusable_templates() {
        assert!(build_dupack(&data_segment(1000, 100), 1, 7).is_none());
        assert!(build_dupack(&mss_first_ack(1000, 900, 7), 1, 7).is_none());
        assert!(build_dupack(&[0u8; 8], 1, 7).is_none());
    }
}
