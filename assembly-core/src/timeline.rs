//! Subtitle timeline derivation and the SRT cue format.
//!
//! Durations are integral milliseconds throughout; the only textual
//! representation of a cue time is `HH:MM:SS,mmm`.

use std::fmt::Write as _;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TimelineError {
    #[error("segment list is empty")]
    Empty,
    #[error("segment {segment_index} has no measured duration")]
    MissingDuration { segment_index: usize },
    #[error("segment {segment_index} has non-positive duration")]
    NonPositiveDuration { segment_index: usize },
    #[error("segment {segment_index} is out of order (expected {expected})")]
    OutOfOrder {
        segment_index: usize,
        expected: usize,
    },
    #[error("timeline overflows the millisecond range at segment {segment_index}")]
    Overflow { segment_index: usize },
    #[error("malformed subtitle cue at line {line}: {reason}")]
    MalformedCue { line: usize, reason: String },
}

impl TimelineError {
    pub fn segment_index(&self) -> Option<usize> {
        match self {
            TimelineError::MissingDuration { segment_index }
            | TimelineError::NonPositiveDuration { segment_index }
            | TimelineError::OutOfOrder { segment_index, .. }
            | TimelineError::Overflow { segment_index } => Some(*segment_index),
            TimelineError::Empty | TimelineError::MalformedCue { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelineEntry {
    pub segment_index: usize,
    pub start_millis: u64,
    pub end_millis: u64,
    pub text: String,
}

impl TimelineEntry {
    pub fn duration_millis(&self) -> u64 {
        self.end_millis - self.start_millis
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timeline {
    pub entries: Vec<TimelineEntry>,
    pub total_duration_millis: u64,
}

impl Timeline {
    pub fn to_srt(&self) -> String {
        render_srt(&self.entries)
    }
}

/// Input row for [`TimelineBuilder::build`].
#[derive(Debug, Clone, Copy)]
pub struct MeasuredSegment<'a> {
    pub index: usize,
    pub duration_millis: Option<u64>,
    pub text: &'a str,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TimelineBuilder;

impl TimelineBuilder {
    /// Lays segments end to end. Segments must already be sorted by index
    /// and carry their probed durations.
    pub fn build<'a, I>(segments: I) -> Result<Timeline, TimelineError>
    where
        I: IntoIterator<Item = MeasuredSegment<'a>>,
    {
        let mut entries: Vec<TimelineEntry> = Vec::new();
        let mut cursor = 0u64;
        for (expected, segment) in segments.into_iter().enumerate() {
            if segment.index != expected {
                return Err(TimelineError::OutOfOrder {
                    segment_index: segment.index,
                    expected,
                });
            }
            let duration = segment
                .duration_millis
                .ok_or(TimelineError::MissingDuration {
                    segment_index: segment.index,
                })?;
            if duration == 0 {
                return Err(TimelineError::NonPositiveDuration {
                    segment_index: segment.index,
                });
            }
            let end = cursor
                .checked_add(duration)
                .ok_or(TimelineError::Overflow {
                    segment_index: segment.index,
                })?;
            entries.push(TimelineEntry {
                segment_index: segment.index,
                start_millis: cursor,
                end_millis: end,
                text: segment.text.to_string(),
            });
            cursor = end;
        }
        if entries.is_empty() {
            return Err(TimelineError::Empty);
        }
        Ok(Timeline {
            entries,
            total_duration_millis: cursor,
        })
    }
}

/// Formats milliseconds as `HH:MM:SS,mmm`. Hours are not wrapped at 24.
pub fn format_timestamp(millis: u64) -> String {
    let hours = millis / 3_600_000;
    let minutes = (millis / 60_000) % 60;
    let seconds = (millis / 1_000) % 60;
    let ms = millis % 1_000;
    format!("{hours:02}:{minutes:02}:{seconds:02},{ms:03}")
}

pub fn parse_timestamp(value: &str) -> Option<u64> {
    let (clock, ms) = value.trim().split_once(',')?;
    let mut parts = clock.split(':');
    let hours: u64 = parts.next()?.parse().ok()?;
    let minutes: u64 = parts.next()?.parse().ok()?;
    let seconds: u64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() || minutes >= 60 || seconds >= 60 || ms.len() != 3 {
        return None;
    }
    let ms: u64 = ms.parse().ok()?;
    hours
        .checked_mul(3_600)?
        .checked_add(minutes * 60 + seconds)?
        .checked_mul(1_000)?
        .checked_add(ms)
}

/// Cue text must not contain an empty line, which would end the block early.
fn cue_text(text: &str) -> String {
    let normalized = text.replace("\r\n", "\n").replace('\r', "\n");
    let lines: Vec<&str> = normalized
        .lines()
        .map(str::trim_end)
        .filter(|line| !line.is_empty())
        .collect();
    lines.join("\n")
}

pub fn render_srt(entries: &[TimelineEntry]) -> String {
    let mut out = String::new();
    for (position, entry) in entries.iter().enumerate() {
        let _ = write!(
            out,
            "{}\n{} --> {}\n{}\n\n",
            position + 1,
            format_timestamp(entry.start_millis),
            format_timestamp(entry.end_millis),
            cue_text(&entry.text)
        );
    }
    out
}

fn timing_regex() -> &'static Regex {
    static TIMING: OnceLock<Regex> = OnceLock::new();
    TIMING.get_or_init(|| {
        Regex::new(r"^(\d{2,}:\d{2}:\d{2},\d{3}) --> (\d{2,}:\d{2}:\d{2},\d{3})$")
            .expect("static cue timing pattern")
    })
}

/// Reads cue blocks back into entries. Segment indices are assigned from
/// cue order.
pub fn parse_srt(contents: &str) -> Result<Vec<TimelineEntry>, TimelineError> {
    let normalized = contents.replace("\r\n", "\n");
    let mut entries = Vec::new();
    let mut lines = normalized.lines().enumerate().peekable();
    loop {
        while matches!(lines.peek(), Some((_, line)) if line.trim().is_empty()) {
            lines.next();
        }
        let Some((line_no, counter)) = lines.next() else {
            break;
        };
        let expected = entries.len() + 1;
        if counter.trim().parse::<usize>().ok() != Some(expected) {
            return Err(TimelineError::MalformedCue {
                line: line_no + 1,
                reason: format!("expected cue number {expected}, found {counter:?}"),
            });
        }
        let (timing_no, timing) = lines.next().ok_or(TimelineError::MalformedCue {
            line: line_no + 2,
            reason: "missing timing line".into(),
        })?;
        let captures =
            timing_regex()
                .captures(timing.trim())
                .ok_or_else(|| TimelineError::MalformedCue {
                    line: timing_no + 1,
                    reason: format!("invalid timing {timing:?}"),
                })?;
        let bounds = (
            parse_timestamp(&captures[1]),
            parse_timestamp(&captures[2]),
        );
        let (Some(start_millis), Some(end_millis)) = bounds else {
            return Err(TimelineError::MalformedCue {
                line: timing_no + 1,
                reason: format!("timestamp out of range in {timing:?}"),
            });
        };
        if start_millis >= end_millis {
            return Err(TimelineError::MalformedCue {
                line: timing_no + 1,
                reason: "cue ends before it starts".into(),
            });
        }
        let mut text_lines = Vec::new();
        while let Some((_, line)) = lines.peek() {
            if line.trim().is_empty() {
                break;
            }
            text_lines.push(*line);
            lines.next();
        }
        entries.push(TimelineEntry {
            segment_index: expected - 1,
            start_millis,
            end_millis,
            text: text_lines.join("\n"),
        });
    }
    Ok(entries)
}
