//! Client role: the doubling echo probe.
//!
//! The probe writes a zero-filled payload, waits until the whole payload has
//! been echoed back, reports the round-trip time and doubles the payload. Once
//! a round of at least [`ProbeConfig::threshold`] bytes has come back it ends
//! the stream. From the default 32 bytes to 4 MiB that is 18 rounds.
//!
//! [`EchoProbe`] is the pure state machine; [`run_probe`] drives it with the
//! events of one [`EchoStream`].

use bytes::Bytes;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::ProbeConfig;
use crate::core::{DhtTransport, Node};
use crate::error::{DoctorError, Result};
use crate::identity::PublicKey;
use crate::report::Reporter;
use crate::stream::{EchoStream, StreamEvent};

/// Where the probe is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProbeState {
    /// Nothing sent yet.
    Connecting,
    /// Waiting for `size` bytes to come back, `received` of which arrived.
    Probing {
        size: usize,
        received: usize,
        sent_at: Instant,
    },
    /// The last round crossed the threshold; the stream is being ended.
    Completed,
    /// The stream closed. Terminal.
    Closed,
}

/// One finished round.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RoundTrip {
    pub size: usize,
    pub elapsed: Duration,
}

impl RoundTrip {
    /// Echoed bytes per second; `None` when the round took no measurable time.
    pub fn throughput(&self) -> Option<f64> {
        let secs = self.elapsed.as_secs_f64();
        (secs > 0.0).then(|| self.size as f64 / secs)
    }
}

/// What a data arrival did to the probe.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProbeStep {
    /// Keep-alive, or data outside a round. Nothing changed.
    Ignored,
    /// Part of the current round arrived.
    Partial { bytes: usize, elapsed: Duration },
    /// The round finished; send `next_size` bytes next.
    Next {
        bytes: usize,
        round: RoundTrip,
        next_size: usize,
    },
    /// The round finished at or above the threshold; end the stream.
    Completed { bytes: usize, round: RoundTrip },
}

/// Result of a probe session.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ProbeOutcome {
    /// Whether the threshold round was reached before the stream closed.
    pub completed: bool,
    pub rounds: Vec<RoundTrip>,
}

/// The client-side echo session.
#[derive(Debug)]
pub struct EchoProbe {
    config: ProbeConfig,
    state: ProbeState,
    rounds: Vec<RoundTrip>,
}

impl EchoProbe {
    pub fn new(config: ProbeConfig) -> Self {
        Self {
            config,
            state: ProbeState::Connecting,
            rounds: Vec::new(),
        }
    }

    pub fn state(&self) -> ProbeState {
        self.state
    }

    pub fn rounds(&self) -> &[RoundTrip] {
        &self.rounds
    }

    /// Payload size of the round in flight.
    pub fn current_size(&self) -> Option<usize> {
        match self.state {
            ProbeState::Probing { size, .. } => Some(size),
            _ => None,
        }
    }

    /// Enter the first round and return its payload size.
    pub fn start(&mut self, now: Instant) -> usize {
        let size = self.config.initial_size;
        self.state = ProbeState::Probing {
            size,
            received: 0,
            sent_at: now,
        };
        size
    }

    /// Restart the round timer once the payload has actually been handed to
    /// the stream.
    pub fn mark_sent(&mut self, now: Instant) {
        if let ProbeState::Probing { sent_at, .. } = &mut self.state {
            *sent_at = now;
        }
    }

    /// Feed one received chunk.
    pub fn on_data(&mut self, data: &[u8], now: Instant) -> Result<ProbeStep> {
        if data.is_empty() {
            return Ok(ProbeStep::Ignored);
        }

        let ProbeState::Probing {
            size,
            received,
            sent_at,
        } = self.state
        else {
            debug!(len = data.len(), state = ?self.state, "data outside a probe round");
            return Ok(ProbeStep::Ignored);
        };

        let total = received + data.len();
        if total > size {
            return Err(DoctorError::EchoMismatch {
                size,
                reason: format!("received {total} bytes"),
            });
        }
        if let Some(offset) = data.iter().position(|byte| *byte != 0) {
            return Err(DoctorError::EchoMismatch {
                size,
                reason: format!("non-zero byte at offset {}", received + offset),
            });
        }

        let elapsed = now.saturating_duration_since(sent_at);
        if total < size {
            self.state = ProbeState::Probing {
                size,
                received: total,
                sent_at,
            };
            return Ok(ProbeStep::Partial {
                bytes: data.len(),
                elapsed,
            });
        }

        let round = RoundTrip { size, elapsed };
        self.rounds.push(round);

        if size >= self.config.threshold {
            self.state = ProbeState::Completed;
            return Ok(ProbeStep::Completed {
                bytes: data.len(),
                round,
            });
        }

        let next_size = size * 2;
        self.state = ProbeState::Probing {
            size: next_size,
            received: 0,
            sent_at: now,
        };
        Ok(ProbeStep::Next {
            bytes: data.len(),
            round,
            next_size,
        })
    }

    pub fn on_closed(&mut self) {
        self.state = ProbeState::Closed;
    }

    pub fn is_completed(&self) -> bool {
        self.rounds
            .last()
            .is_some_and(|round| round.size >= self.config.threshold)
    }

    pub fn into_outcome(self) -> ProbeOutcome {
        ProbeOutcome {
            completed: self.is_completed(),
            rounds: self.rounds,
        }
    }
}

/// Run one probe session against the listener at `remote`.
///
/// Returns once the stream has closed. A stream error or a corrupted echo is
/// returned as an error after the stream closed; an early close without an
/// error yields a non-completed outcome.
pub async fn run_probe<T: DhtTransport>(
    node: &Node<T>,
    remote: PublicKey,
    config: &ProbeConfig,
    reporter: &dyn Reporter,
) -> Result<ProbeOutcome> {
    reporter.connecting();
    let mut stream = node.connect(remote);
    let mut probe = EchoProbe::new(config.clone());
    let mut failure: Option<DoctorError> = None;

    let first = probe.start(Instant::now());
    if let Err(err) = send_payload(&stream, first, reporter).await {
        failure.get_or_insert(err);
    }
    probe.mark_sent(Instant::now());

    loop {
        match stream.next_event().await {
            StreamEvent::Connected { remote } => {
                reporter.connected(&remote);
            }
            StreamEvent::Data(data) => match probe.on_data(&data, Instant::now()) {
                Ok(ProbeStep::Ignored) => {}
                Ok(ProbeStep::Partial { bytes, elapsed }) => {
                    reporter.echoed(bytes, elapsed);
                }
                Ok(ProbeStep::Next {
                    bytes,
                    round,
                    next_size,
                }) => {
                    reporter.echoed(bytes, round.elapsed);
                    debug!(size = round.size, throughput = ?round.throughput(), "round complete");
                    if let Err(err) = send_payload(&stream, next_size, reporter).await {
                        failure.get_or_insert(err);
                    }
                    probe.mark_sent(Instant::now());
                }
                Ok(ProbeStep::Completed { bytes, round }) => {
                    reporter.echoed(bytes, round.elapsed);
                    reporter.done();
                    info!(rounds = probe.rounds().len(), "probe complete, ending stream");
                    let _ = stream.end().await;
                }
                Err(err) => {
                    warn!(%err, "echo mismatch, ending stream");
                    failure.get_or_insert(err);
                    let _ = stream.end().await;
                }
            },
            StreamEvent::End => {
                if probe.state() != ProbeState::Completed {
                    warn!("server ended the stream before the probe completed");
                }
                let _ = stream.end().await;
            }
            StreamEvent::Error(err) => {
                failure.get_or_insert(err.into());
            }
            StreamEvent::Closed => {
                probe.on_closed();
                reporter.closed();
                break;
            }
        }
    }

    match failure {
        Some(err) => Err(err),
        None => Ok(probe.into_outcome()),
    }
}

async fn send_payload(stream: &EchoStream, size: usize, reporter: &dyn Reporter) -> Result<()> {
    reporter.sending(size);
    stream.write(Bytes::from(vec![0u8; size])).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zeros(len: usize) -> Vec<u8> {
        vec![0u8; len]
    }

    #[test]
    fn payload_doubles_from_32_until_threshold() {
        let mut probe = EchoProbe::new(ProbeConfig::default());
        let now = Instant::now();
        let mut size = probe.start(now);
        let mut sizes = vec![size];

        loop {
            match probe.on_data(&zeros(size), now).unwrap() {
                ProbeStep::Next { next_size, .. } => {
                    assert_eq!(next_size, size * 2);
                    size = next_size;
                    sizes.push(size);
                }
                ProbeStep::Completed { round, .. } => {
                    assert_eq!(round.size, 4 * 1024 * 1024);
                    break;
                }
                other => panic!("unexpected step {other:?}"),
            }
        }

        assert_eq!(sizes.len(), 18);
        assert_eq!(sizes.first(), Some(&32));
        assert_eq!(sizes.last(), Some(&4_194_304));
        assert_eq!(probe.state(), ProbeState::Completed);
        assert!(probe.is_completed());
    }

    #[test]
    fn keep_alives_do_not_advance_or_reset_the_round() {
        let mut probe = EchoProbe::new(ProbeConfig::default());
        let start = Instant::now();
        probe.start(start);

        let later = start + Duration::from_millis(40);
        assert_eq!(probe.on_data(&[], later).unwrap(), ProbeStep::Ignored);
        assert_eq!(probe.current_size(), Some(32));

        let step = probe
            .on_data(&zeros(32), start + Duration::from_millis(90))
            .unwrap();
        let ProbeStep::Next { round, .. } = step else {
            panic!("expected next round, got {step:?}");
        };
        assert_eq!(round.elapsed, Duration::from_millis(90));
    }

    #[test]
    fn split_echoes_complete_the_round_only_when_whole() {
        let mut probe = EchoProbe::new(ProbeConfig::default());
        let now = Instant::now();
        probe.start(now);

        assert!(matches!(
            probe.on_data(&zeros(20), now).unwrap(),
            ProbeStep::Partial { bytes: 20, .. }
        ));
        assert_eq!(probe.current_size(), Some(32));
        assert!(matches!(
            probe.on_data(&zeros(12), now).unwrap(),
            ProbeStep::Next { next_size: 64, .. }
        ));
    }

    #[test]
    fn surplus_or_corrupted_echo_is_a_mismatch() {
        let mut probe = EchoProbe::new(ProbeConfig::default());
        let now = Instant::now();
        probe.start(now);
        assert!(matches!(
            probe.on_data(&zeros(33), now),
            Err(DoctorError::EchoMismatch { size: 32, .. })
        ));

        let mut probe = EchoProbe::new(ProbeConfig::default());
        probe.start(now);
        let mut data = zeros(32);
        data[7] = 1;
        let err = probe.on_data(&data, now).unwrap_err();
        assert!(err.to_string().contains("offset 7"));
    }

    #[test]
    fn small_threshold_completes_after_first_round() {
        let mut probe = EchoProbe::new(ProbeConfig {
            initial_size: 10,
            threshold: 10,
        });
        let now = Instant::now();
        assert_eq!(probe.start(now), 10);
        assert!(matches!(
            probe.on_data(&zeros(10), now).unwrap(),
            ProbeStep::Completed { bytes: 10, .. }
        ));
        probe.on_closed();
        let outcome = probe.into_outcome();
        assert!(outcome.completed);
        assert_eq!(outcome.rounds.len(), 1);
    }

    #[test]
    fn data_after_completion_is_ignored() {
        let mut probe = EchoProbe::new(ProbeConfig {
            initial_size: 8,
            threshold: 8,
        });
        let now = Instant::now();
        probe.start(now);
        probe.on_data(&zeros(8), now).unwrap();
        assert_eq!(probe.on_data(&zeros(8), now).unwrap(), ProbeStep::Ignored);
    }

    #[test]
    fn throughput_is_bytes_per_second() {
        let round = RoundTrip {
            size: 1000,
            elapsed: Duration::from_millis(500),
        };
        assert_eq!(round.throughput(), Some(2000.0));
        let instant = RoundTrip {
            size: 1000,
            elapsed: Duration::ZERO,
        };
        assert_eq!(instant.throughput(), None);
    }
}
