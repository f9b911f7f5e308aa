//! Timing stream records.
//!
//! Each line of the `timing` file is `"<event> <seconds>.<nanoseconds> <extra>"`
//! where `<extra>` is a byte count for data streams, `"<rows> <cols>"` for a
//! window size change, or a signal name for a suspend/resume event.

use std::time::Duration;

use crate::error_handling::types::IoLogError;

/// The five captured data streams, in on-disk event-index order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IoStream {
    Stdin,
    Stdout,
    Stderr,
    Ttyin,
    Ttyout,
}

/// Event index for window size changes.
const EVENT_WINSIZE: u64 = 5;
/// Event index for suspend/resume. Index 6 is reserved; old logs used it
/// for tty output and replay tools still special-case it.
const EVENT_SUSPEND: u64 = 7;

impl IoStream {
    pub const ALL: [IoStream; 5] = [
        IoStream::Stdin,
        IoStream::Stdout,
        IoStream::Stderr,
        IoStream::Ttyin,
        IoStream::Ttyout,
    ];

    pub fn index(self) -> usize {
        match self {
            IoStream::Stdin => 0,
            IoStream::Stdout => 1,
            IoStream::Stderr => 2,
            IoStream::Ttyin => 3,
            IoStream::Ttyout => 4,
        }
    }

    pub fn from_index(idx: usize) -> Option<IoStream> {
        IoStream::ALL.get(idx).copied()
    }

    /// File name of the stream's data file within the session directory.
    pub fn file_name(self) -> &'static str {
        match self {
            IoStream::Stdin => "stdin",
            IoStream::Stdout => "stdout",
            IoStream::Stderr => "stderr",
            IoStream::Ttyin => "ttyin",
            IoStream::Ttyout => "ttyout",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimingPayload {
    /// Data was appended to a stream's data file.
    Io { stream: IoStream, len: u64 },
    /// The terminal window was resized.
    Winsize { rows: u32, cols: u32 },
    /// The command was suspended or resumed; signal name has no SIG prefix.
    Suspend { signal: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimingRecord {
    /// Delay since the previous record.
    pub delay: Duration,
    pub payload: TimingPayload,
}

impl TimingRecord {
    /// Render the record as a timing file line, without the trailing newline.
    pub fn format_line(&self) -> String {
        let secs = self.delay.as_secs();
        let nsecs = self.delay.subsec_nanos();
        match &self.payload {
            TimingPayload::Io { stream, len } => {
                format!("{} {}.{:09} {}", stream.index(), secs, nsecs, len)
            }
            TimingPayload::Winsize { rows, cols } => {
                format!("{} {}.{:09} {} {}", EVENT_WINSIZE, secs, nsecs, rows, cols)
            }
            TimingPayload::Suspend { signal } => {
                format!("{} {}.{:09} {}", EVENT_SUSPEND, secs, nsecs, signal)
            }
        }
    }

    /// Parse one timing file line (no trailing newline).
    pub fn parse_line(line: &str) -> Result<TimingRecord, IoLogError> {
        let malformed = || IoLogError::MalformedTiming(line.to_string());

        let mut fields = line.split_ascii_whitespace();
        let event: u64 = fields
            .next()
            .and_then(|f| f.parse().ok())
            .ok_or_else(malformed)?;
        let delay = fields.next().and_then(parse_delay).ok_or_else(malformed)?;

        let payload = match event {
            EVENT_WINSIZE => {
                let rows = fields.next().and_then(|f| f.parse().ok()).ok_or_else(malformed)?;
                let cols = fields.next().and_then(|f| f.parse().ok()).ok_or_else(malformed)?;
                TimingPayload::Winsize { rows, cols }
            }
            EVENT_SUSPEND => {
                let signal = fields.next().ok_or_else(malformed)?;
                if signal.is_empty() {
                    return Err(malformed());
                }
                TimingPayload::Suspend {
                    signal: signal.to_string(),
                }
            }
            idx => {
                let stream = IoStream::from_index(idx as usize).ok_or_else(malformed)?;
                let len = fields.next().and_then(|f| f.parse().ok()).ok_or_else(malformed)?;
                TimingPayload::Io { stream, len }
            }
        };
        if fields.next().is_some() {
            return Err(malformed());
        }
        Ok(TimingRecord { delay, payload })
    }
}

/// Parse a `"<seconds>.<fraction>"` delay. The fraction may carry fewer or
/// more than nine digits; it is scaled (or clamped) to nanosecond precision.
fn parse_delay(field: &str) -> Option<Duration> {
    let (secs, frac) = field.split_once('.')?;
    let secs: u64 = secs.parse().ok()?;
    if frac.is_empty() || !frac.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let nanos = if frac.len() <= 9 {
        frac.parse::<u32>().ok()? * 10u32.pow(9 - frac.len() as u32)
    } else {
        frac[..9].parse::<u32>().ok()?
    };
    Some(Duration::new(secs, nanos))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_parse_round_trip() {
        let records = [
            TimingRecord {
                delay: Duration::new(0, 125_000_000),
                payload: TimingPayload::Io {
                    stream: IoStream::Stdout,
                    len: 42,
                },
            },
            TimingRecord {
                delay: Duration::new(3, 0),
                payload: TimingPayload::Winsize { rows: 50, cols: 132 },
            },
            TimingRecord {
                delay: Duration::new(1, 999_999_999),
                payload: TimingPayload::Suspend {
                    signal: "TSTP".into(),
                },
            },
        ];
        for rec in &records {
            let line = rec.format_line();
            assert_eq!(&TimingRecord::parse_line(&line).unwrap(), rec);
        }
    }

    #[test]
    fn exact_line_format() {
        let rec = TimingRecord {
            delay: Duration::new(1, 5_000_000),
            payload: TimingPayload::Io {
                stream: IoStream::Stderr,
                len: 7,
            },
        };
        assert_eq!(rec.format_line(), "2 1.005000000 7");
    }

    #[test]
    fn short_and_long_fractions() {
        // Two digits scale up to nanoseconds.
        let rec = TimingRecord::parse_line("1 0.25 10").unwrap();
        assert_eq!(rec.delay, Duration::new(0, 250_000_000));
        // Extra digits past nanoseconds are clamped.
        let rec = TimingRecord::parse_line("1 0.1234567891 10").unwrap();
        assert_eq!(rec.delay, Duration::new(0, 123_456_789));
    }

    #[test]
    fn rejects_garbage() {
        for line in [
            "",
            "x 1.0 5",
            "1 1 5",
            "1 1.0",
            "9 1.0 5",
            "6 1.0 5",
            "5 1.0 80",
            "1 1.0 5 extra",
            "1 -1.0 5",
        ] {
            assert!(
                TimingRecord::parse_line(line).is_err(),
                "line {:?} should not parse",
                line
            );
        }
    }
}
