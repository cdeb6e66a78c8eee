//! Datagram layout and rate schedule of the packet-train prober.
//!
//! ```text
//! control      | type=0 | 0 | iteration count (u16) | packet size (u16) | zero padding to 1500
//! measurement  | type=1 | 0 | train (u16) | packet (u16) | 0 (u16) | origin ns (u64) | padding
//! ```
//!
//! All multi-byte fields are big-endian.

use std::time::Duration;

pub const MSG_CONTROL: u8 = 0;
pub const MSG_MEASUREMENT: u8 = 1;

pub const CONTROL_DATAGRAM_LEN: usize = 1500;
pub const MEASUREMENT_HEADER_LEN: usize = 16;
/// Largest UDP payload over IPv4.
pub const MAX_DATAGRAM_LEN: usize = 65507;

/// Offered rate of the first train, bits per second.
pub const R_MIN: u64 = 10_485_760;
/// Upper bound of the linear rate ramp, bits per second.
pub const R_MAX: u64 = 262_144_000;

/// Pause after every train so queues drain before the next, faster one.
pub const INTER_TRAIN_GAP: Duration = Duration::from_millis(200);

const TRAIN_OFFSET: usize = 2;
const PACKET_OFFSET: usize = 4;
const TIMESTAMP_OFFSET: usize = 8;

pub fn control_datagram(iteration_count: u16, packet_size: u16) -> Vec<u8> {
    let mut buf = vec![0u8; CONTROL_DATAGRAM_LEN];
    buf[0] = MSG_CONTROL;
    buf[2..4].copy_from_slice(&iteration_count.to_be_bytes());
    buf[4..6].copy_from_slice(&packet_size.to_be_bytes());
    buf
}

/// Zeroed measurement datagram of `packet_size` bytes with its type set.
/// Allocated once per run and re-stamped for every packet.
pub fn measurement_buffer(packet_size: usize) -> Vec<u8> {
    let mut buf = vec![0u8; packet_size.max(MEASUREMENT_HEADER_LEN)];
    buf[0] = MSG_MEASUREMENT;
    buf
}

/// Write the per-packet fields in place.  Must stay allocation free: it runs
/// between timestamp capture and the send call.
#[inline]
pub fn stamp_measurement(buf: &mut [u8], train: u16, packet: u16, origin_ns: u64) {
    buf[TRAIN_OFFSET..TRAIN_OFFSET + 2].copy_from_slice(&train.to_be_bytes());
    buf[PACKET_OFFSET..PACKET_OFFSET + 2].copy_from_slice(&packet.to_be_bytes());
    buf[TIMESTAMP_OFFSET..TIMESTAMP_OFFSET + 8].copy_from_slice(&origin_ns.to_be_bytes());
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlHeader {
    pub iteration_count: u16,
    pub packet_size: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeasurementHeader {
    pub train: u16,
    pub packet: u16,
    pub origin_ns: u64,
}

pub fn decode_control(buf: &[u8]) -> Option<ControlHeader> {
    if buf.len() < 6 || buf[0] != MSG_CONTROL {
        return None;
    }
    Some(ControlHeader {
        iteration_count: u16::from_be_bytes([buf[2], buf[3]]),
        packet_size: u16::from_be_bytes([buf[4], buf[5]]),
    })
}

pub fn decode_measurement(buf: &[u8]) -> Option<MeasurementHeader> {
    if buf.len() < MEASUREMENT_HEADER_LEN || buf[0] != MSG_MEASUREMENT {
        return None;
    }
    let mut ts = [0u8; 8];
    ts.copy_from_slice(&buf[TIMESTAMP_OFFSET..TIMESTAMP_OFFSET + 8]);
    Some(MeasurementHeader {
        train: u16::from_be_bytes([buf[TRAIN_OFFSET], buf[TRAIN_OFFSET + 1]]),
        packet: u16::from_be_bytes([buf[PACKET_OFFSET], buf[PACKET_OFFSET + 1]]),
        origin_ns: u64::from_be_bytes(ts),
    })
}

/// Offered rate of train `iteration`, rising linearly from [`R_MIN`].
pub fn target_rate(iteration: u16, iteration_count: u16) -> u64 {
    let count = u64::from(iteration_count.max(1));
    R_MIN + (R_MAX - R_MIN) * u64::from(iteration) / count
}

/// Spacing between consecutive packets of train `iteration`.
pub fn inter_packet_delay(iteration: u16, iteration_count: u16, packet_size: usize) -> Duration {
    let rate = target_rate(iteration, iteration_count);
    Duration::from_nanos(packet_size as u64 * 1_000_000_000 / rate)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_strictly_decreases() {
        let delays: Vec<Duration> = (0..4).map(|i| inter_packet_delay(i, 4, 1400)).collect();
        for pair in delays.windows(2) {
            assert!(pair[1] < pair[0], "{:?} should be shorter than {:?}", pair[1], pair[0]);
        }
        // 1400 B at 10 MiB/s
        assert_eq!(delays[0], Duration::from_nanos(133_514));
    }

    #[test]
    fn test_rate_ramp_endpoints() {
        assert_eq!(target_rate(0, 10), R_MIN);
        assert!(target_rate(9, 10) < R_MAX);
        assert_eq!(target_rate(0, 0), R_MIN);
    }

    #[test]
    fn test_control_layout() {
        let buf = control_datagram(10, 1400);
        assert_eq!(buf.len(), CONTROL_DATAGRAM_LEN);
        assert_eq!(&buf[..6], &[0, 0, 0, 10, 0x05, 0x78]);
        assert!(buf[6..].iter().all(|b| *b == 0));
        assert_eq!(
            decode_control(&buf),
            Some(ControlHeader {
                iteration_count: 10,
                packet_size: 1400
            })
        );
    }

    #[test]
    fn test_measurement_layout() {
        let mut buf = measurement_buffer(64);
        stamp_measurement(&mut buf, 3, 258, 0x0102_0304_0506_0708);
        assert_eq!(buf.len(), 64);
        assert_eq!(
            &buf[..16],
            &[1, 0, 0, 3, 1, 2, 0, 0, 1, 2, 3, 4, 5, 6, 7, 8]
        );
        let header = decode_measurement(&buf).unwrap();
        assert_eq!(header.train, 3);
        assert_eq!(header.packet, 258);
        assert_eq!(header.origin_ns, 0x0102_0304_0506_0708);
        assert!(decode_control(&buf).is_none());
    }
}
