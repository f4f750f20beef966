//! Parsing of the engine's progress output.
//!
//! The engine reports progress on stderr as a tqdm bar that is redrawn in
//! place with carriage returns:
//!
//! ```text
//!  45%|████▌     | 13440/29868 [00:25<00:30, 538.12frames/s]
//! ```
//!
//! Everything else on that stream (warnings, tracebacks) is ignored. Parsing
//! is best-effort: a chunk that holds no complete bar produces an empty
//! [`ProgressSample`], never an error.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::protocol::{ProgressSample, TimeRemaining};

static PROGRESS_BAR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?P<percent>\d{1,3})%\|[^|]*\|\s*\d+/\d+\s*\[(?P<elapsed>[\d:]+)<(?P<remaining>[\d:]+|\?),\s*(?P<speed>[\d.]+|\?)\s*frames/s\]",
    )
    .expect("progress bar pattern is valid")
});

/// Longest fragment carried over between chunks; anything longer is noise
const MAX_CARRY_OVER: usize = 512;

/// Stateless parser for engine progress text
pub struct ProgressParser;

impl ProgressParser {
    /// Parse the most recent progress bar contained in `chunk`
    pub fn parse(chunk: &str) -> ProgressSample {
        chunk
            .split(is_line_break)
            .rev()
            .find_map(parse_segment)
            .unwrap_or_default()
    }
}

fn is_line_break(c: char) -> bool {
    c == '\r' || c == '\n'
}

/// Parse a single redraw of the progress bar
fn parse_segment(segment: &str) -> Option<ProgressSample> {
    let caps = PROGRESS_BAR.captures(segment)?;

    let percent: u32 = caps["percent"].parse().ok()?;
    let speed = caps["speed"].parse::<f64>().ok();
    let time_remaining = parse_clock(&caps["remaining"]).map(TimeRemaining::from_seconds);

    Some(ProgressSample {
        percent_done_as_number: Some(percent),
        percent_done: Some(format!("{}%", percent)),
        speed,
        time_remaining,
    })
}

/// Parse `SS`, `MM:SS` or `HH:MM:SS` into seconds
fn parse_clock(clock: &str) -> Option<u64> {
    if clock.is_empty() || clock == "?" {
        return None;
    }

    let mut total = 0u64;
    for part in clock.split(':') {
        let value: u64 = part.parse().ok()?;
        total = total.checked_mul(60)?.checked_add(value)?;
    }
    Some(total)
}

/// Incremental parser that reassembles bars split across reads
///
/// The trailing segment of a chunk that did not parse is kept and prepended
/// to the next chunk. A sample can still be lost when the fragment grows
/// past [`MAX_CARRY_OVER`]; that is acceptable for a display value.
#[derive(Debug, Default)]
pub struct ProgressStream {
    carry_over: String,
}

impl ProgressStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one raw read from the stream; returns a sample when one completed
    pub fn feed(&mut self, chunk: &str) -> Option<ProgressSample> {
        let mut combined = std::mem::take(&mut self.carry_over);
        combined.push_str(chunk);

        let last_segment = combined.rsplit(is_line_break).next().unwrap_or_default();
        if parse_segment(last_segment).is_none() && last_segment.len() <= MAX_CARRY_OVER {
            self.carry_over = last_segment.to_string();
        }

        let sample = ProgressParser::parse(&combined);
        if sample.is_empty() {
            None
        } else {
            Some(sample)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MID_RUN: &str =
        " 45%|████▌     | 13440/29868 [00:25<00:30, 538.12frames/s]";
    const STARTING: &str = "  0%|          | 0/29868 [00:00<?, ?frames/s]";
    const LONG_RUN: &str =
        " 12%|█▏        | 35000/291680 [10:01<1:13:30, 58.20frames/s]";
    const DONE: &str =
        "100%|██████████| 29868/29868 [00:55<00:00, 541.02frames/s]";

    const NOISE: &[&str] = &[
        "",
        "/usr/lib/python3/site-packages/whisper/transcribe.py:114: UserWarning: FP16 is not supported on CPU; using FP32 instead",
        "  warnings.warn(\"FP16 is not supported on CPU; using FP32 instead\")",
        "Traceback (most recent call last):",
        "RuntimeError: CUDA out of memory.",
        "100%|█████| 461M/461M [00:12<00:00, 38.1MiB/s]",
    ];

    #[test]
    fn test_parses_mid_run_bar() {
        let sample = ProgressParser::parse(MID_RUN);
        assert_eq!(sample.percent_done_as_number, Some(45));
        assert_eq!(sample.percent_done.as_deref(), Some("45%"));
        assert_eq!(sample.speed, Some(538.12));
        let remaining = sample.time_remaining.unwrap();
        assert_eq!(remaining.total_seconds, 30);
        assert_eq!(remaining.string, "30s");
    }

    #[test]
    fn test_parses_starting_bar_without_estimate() {
        let sample = ProgressParser::parse(STARTING);
        assert_eq!(sample.percent_done_as_number, Some(0));
        assert!(sample.speed.is_none());
        assert!(sample.time_remaining.is_none());
        assert!(!sample.is_empty());
    }

    #[test]
    fn test_parses_hours_in_estimate() {
        let sample = ProgressParser::parse(LONG_RUN);
        let remaining = sample.time_remaining.unwrap();
        assert_eq!(remaining.total_seconds, 4410);
        assert_eq!(remaining.hours_remaining, 1);
        assert_eq!(remaining.minutes_remaining, 13);
        assert_eq!(remaining.seconds_remaining, 30);
    }

    #[test]
    fn test_noise_yields_empty_sample() {
        for line in NOISE {
            assert!(ProgressParser::parse(line).is_empty(), "parsed noise: {:?}", line);
        }
    }

    #[test]
    fn test_parse_is_pure() {
        for input in [MID_RUN, STARTING, LONG_RUN, DONE, NOISE[1]] {
            assert_eq!(ProgressParser::parse(input), ProgressParser::parse(input));
        }
    }

    #[test]
    fn test_last_redraw_wins() {
        let chunk = format!("\r{}\r{}", MID_RUN, DONE);
        let sample = ProgressParser::parse(&chunk);
        assert_eq!(sample.percent_done_as_number, Some(100));
    }

    #[test]
    fn test_trailing_noise_does_not_hide_bar() {
        let chunk = format!("\r{}\n{}\n", MID_RUN, NOISE[1]);
        assert_eq!(ProgressParser::parse(&chunk).percent_done_as_number, Some(45));
    }

    #[test]
    fn test_stream_reassembles_split_bar() {
        let mut stream = ProgressStream::new();
        let (head, tail) = MID_RUN.split_at(MID_RUN.find("13440").unwrap());

        assert!(stream.feed(&format!("\r{}", head)).is_none());
        let sample = stream.feed(tail).expect("bar completes on second read");
        assert_eq!(sample.percent_done_as_number, Some(45));
    }

    #[test]
    fn test_stream_drops_oversized_fragment() {
        let mut stream = ProgressStream::new();
        let junk = "x".repeat(MAX_CARRY_OVER + 1);
        assert!(stream.feed(&junk).is_none());
        assert!(stream.feed(MID_RUN).is_some());
    }

    #[test]
    fn test_parse_clock() {
        assert_eq!(parse_clock("07"), Some(7));
        assert_eq!(parse_clock("01:05"), Some(65));
        assert_eq!(parse_clock("1:00:01"), Some(3601));
        assert_eq!(parse_clock("?"), None);
        assert_eq!(parse_clock("a:b"), None);
    }
}
