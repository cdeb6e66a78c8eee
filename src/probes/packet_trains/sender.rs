//! Paced send loop.  Runs on a blocking thread for the whole run so the
//! async runtime never gets a chance to preempt a train.

use std::io::ErrorKind;
use std::net::UdpSocket;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use super::wire;

/// Remaining wait below which the loop spins instead of sleeping.
const SPIN_WINDOW: Duration = Duration::from_micros(1500);

/// Longest single sleep, so cancellation is noticed during the inter-train
/// gap.
const MAX_SLEEP: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrainPlan {
    pub iteration_count: u16,
    pub train_length: u16,
    pub packet_size: usize,
}

impl TrainPlan {
    pub fn total_packets(&self) -> u64 {
        u64::from(self.iteration_count) * u64::from(self.train_length)
    }

    /// Payload bytes the run puts on the wire, control datagram included.
    pub fn traffic_bytes(&self) -> u64 {
        wire::CONTROL_DATAGRAM_LEN as u64 + self.total_packets() * self.packet_size as u64
    }

    pub fn delays(&self) -> Vec<Duration> {
        (0..self.iteration_count)
            .map(|i| wire::inter_packet_delay(i, self.iteration_count, self.packet_size))
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendSummary {
    pub packets_sent: u64,
    pub send_errors: u64,
    /// Sends rejected because the peer reported the port closed.
    pub refused: u64,
    pub first_error: Option<String>,
    pub cancelled: bool,
    pub elapsed: Duration,
}

/// Send the control datagram, then every train at its target rate.
///
/// Timestamps are nanoseconds since `anchor`.  Send errors never abort the
/// run; they are counted and reported in the summary.
pub fn run(
    socket: &UdpSocket,
    plan: &TrainPlan,
    anchor: Instant,
    token: &CancellationToken,
) -> SendSummary {
    let mut summary = SendSummary::default();
    let delays = plan.delays();
    let mut buf = wire::measurement_buffer(plan.packet_size);

    let control = wire::control_datagram(plan.iteration_count, plan.packet_size as u16);
    if let Err(e) = socket.send(&control) {
        record_error(&mut summary, e);
    }

    let mut deadline = Instant::now();
    'trains: for (train, delay) in delays.iter().enumerate() {
        for packet in 0..plan.train_length {
            if !pace_until(deadline, token) {
                summary.cancelled = true;
                break 'trains;
            }

            let origin_ns = anchor.elapsed().as_nanos() as u64;
            wire::stamp_measurement(&mut buf, train as u16, packet, origin_ns);
            match socket.send(&buf) {
                Ok(_) => summary.packets_sent += 1,
                Err(e) => record_error(&mut summary, e),
            }

            deadline += *delay;
        }
        deadline += wire::INTER_TRAIN_GAP;
    }

    summary.elapsed = anchor.elapsed();
    summary
}

fn record_error(summary: &mut SendSummary, error: std::io::Error) {
    if error.kind() == ErrorKind::ConnectionRefused {
        summary.refused += 1;
        return;
    }
    summary.send_errors += 1;
    if summary.first_error.is_none() {
        summary.first_error = Some(error.to_string());
    }
}

/// Wait for an absolute deadline: coarse sleeps first, then a spin for the
/// final stretch.  Returns `false` if cancelled while waiting.
fn pace_until(deadline: Instant, token: &CancellationToken) -> bool {
    loop {
        if token.is_cancelled() {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        let remaining = deadline - now;
        if remaining > SPIN_WINDOW {
            std::thread::sleep((remaining - SPIN_WINDOW).min(MAX_SLEEP));
        } else {
            while Instant::now() < deadline {
                std::hint::spin_loop();
            }
            return true;
        }
    }
}
