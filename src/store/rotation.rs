use nom::{
    branch::alt,
    bytes::complete::tag,
    character::complete::{char, digit1},
    combinator::{all_consuming, map, map_res},
    sequence::separated_pair,
    IResult,
};
use serde::{Deserialize, Serialize};

use crate::store::ChunkMeta;
use crate::tools::time::NANOS_PER_SEC;
use crate::{Error, Result};

/// When to seal the active chunk and start a new one.
///
/// The individual limits compose as OR: the first one that trips causes a
/// rotation. A policy with no limits set never rotates on its own.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RotationPolicy {
    /// Seal when logical bytes reach this threshold.
    pub max_bytes: Option<u64>,
    /// Seal when the record count reaches this threshold.
    pub max_records: Option<u64>,
    /// Seal when the chunk has been active this long.
    pub max_age_secs: Option<u64>,
    /// Seal at scheduled instants, e.g. `hourly`, `daily`, `03:30`, `*:00`.
    pub schedule: Option<String>,
}

impl RotationPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_bytes(mut self, value: Option<u64>) -> Self {
        self.max_bytes = value;
        self
    }

    pub fn max_records(mut self, value: Option<u64>) -> Self {
        self.max_records = value;
        self
    }

    pub fn max_age_secs(mut self, value: Option<u64>) -> Self {
        self.max_age_secs = value;
        self
    }

    pub fn schedule(mut self, value: Option<String>) -> Self {
        self.schedule = value;
        self
    }

    /// Validate the policy, compiling the schedule if one is set.
    pub fn compile(&self) -> Result<CompiledRotation> {
        let event = match &self.schedule {
            Some(text) => Some(CalendarEvent::parse(text)?),
            None => None,
        };
        Ok(CompiledRotation {
            policy: self.clone(),
            event,
        })
    }
}

/// A rotation policy with its schedule parsed, evaluated after each append.
#[derive(Debug, Clone)]
pub struct CompiledRotation {
    policy: RotationPolicy,
    event: Option<CalendarEvent>,
}

impl CompiledRotation {
    pub fn none() -> Self {
        CompiledRotation {
            policy: RotationPolicy::default(),
            event: None,
        }
    }

    /// Whether the active chunk described by `meta` (created at
    /// `created_ns`) should be sealed now.
    pub fn should_rotate(&self, meta: &ChunkMeta, created_ns: i64, now_ns: i64) -> bool {
        if let Some(max) = self.policy.max_bytes {
            if meta.bytes >= max {
                return true;
            }
        }
        if let Some(max) = self.policy.max_records {
            if meta.record_count >= max {
                return true;
            }
        }
        if let Some(max) = self.policy.max_age_secs {
            if now_ns.saturating_sub(created_ns) >= (max as i64).saturating_mul(NANOS_PER_SEC) {
                return true;
            }
        }
        if let Some(ref event) = self.event {
            if let Some(fire) = event.next_after(created_ns) {
                if now_ns >= fire {
                    return true;
                }
            }
        }
        false
    }
}

/// Tiny calendar-event grammar for scheduled rotation:
///
/// * `hourly`  - at every full hour
/// * `daily`   - at midnight UTC
/// * `HH:MM`   - once a day at that UTC time
/// * `*:MM`    - at minute MM of every hour
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalendarEvent {
    Hourly,
    Daily,
    DailyAt { hour: u32, minute: u32 },
    EveryHourAt { minute: u32 },
}

const NANOS_PER_MINUTE: i64 = 60 * NANOS_PER_SEC;
const NANOS_PER_HOUR: i64 = 60 * NANOS_PER_MINUTE;
const NANOS_PER_DAY: i64 = 24 * NANOS_PER_HOUR;

fn number(i: &str) -> IResult<&str, u32> {
    map_res(digit1, |s: &str| s.parse::<u32>())(i)
}

fn hh_mm(i: &str) -> IResult<&str, CalendarEvent> {
    map(separated_pair(number, char(':'), number), |(hour, minute)| {
        CalendarEvent::DailyAt { hour, minute }
    })(i)
}

fn star_mm(i: &str) -> IResult<&str, CalendarEvent> {
    map(separated_pair(char('*'), char(':'), number), |(_, minute)| {
        CalendarEvent::EveryHourAt { minute }
    })(i)
}

fn event(i: &str) -> IResult<&str, CalendarEvent> {
    alt((
        map(tag("hourly"), |_| CalendarEvent::Hourly),
        map(tag("daily"), |_| CalendarEvent::Daily),
        star_mm,
        hh_mm,
    ))(i)
}

impl CalendarEvent {
    pub fn parse(text: &str) -> Result<CalendarEvent> {
        let (_, ev) = all_consuming(event)(text.trim())
            .map_err(|_| Error::invalid(format!("bad rotation schedule '{}'", text)))?;
        match ev {
            CalendarEvent::DailyAt { hour, minute } if hour > 23 || minute > 59 => {
                Err(Error::invalid(format!("bad rotation schedule '{}'", text)))
            }
            CalendarEvent::EveryHourAt { minute } if minute > 59 => {
                Err(Error::invalid(format!("bad rotation schedule '{}'", text)))
            }
            ev => Ok(ev),
        }
    }

    /// The first instant strictly after `ns` at which the event fires.
    pub fn next_after(&self, ns: i64) -> Option<i64> {
        let (period, offset) = match *self {
            CalendarEvent::Hourly => (NANOS_PER_HOUR, 0),
            CalendarEvent::Daily => (NANOS_PER_DAY, 0),
            CalendarEvent::DailyAt { hour, minute } => (
                NANOS_PER_DAY,
                hour as i64 * NANOS_PER_HOUR + minute as i64 * NANOS_PER_MINUTE,
            ),
            CalendarEvent::EveryHourAt { minute } => {
                (NANOS_PER_HOUR, minute as i64 * NANOS_PER_MINUTE)
            }
        };
        let base = crate::tools::time::floor_to(ns - offset, period) + offset;
        let next = if base > ns { base } else { base + period };
        Some(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ChunkId;

    fn meta(records: u64, bytes: u64) -> ChunkMeta {
        let mut m = ChunkMeta::empty(ChunkId::now());
        m.record_count = records;
        m.bytes = bytes;
        m
    }

    #[test]
    fn record_and_byte_limits_or_together() {
        let rot = RotationPolicy::new()
            .max_records(Some(5))
            .max_bytes(Some(100))
            .compile()
            .unwrap();
        assert!(!rot.should_rotate(&meta(4, 50), 0, 0));
        assert!(rot.should_rotate(&meta(5, 50), 0, 0));
        assert!(rot.should_rotate(&meta(1, 100), 0, 0));
    }

    #[test]
    fn age_limit() {
        let rot = RotationPolicy::new().max_age_secs(Some(60)).compile().unwrap();
        assert!(!rot.should_rotate(&meta(1, 1), 0, 59 * NANOS_PER_SEC));
        assert!(rot.should_rotate(&meta(1, 1), 0, 60 * NANOS_PER_SEC));
    }

    #[test]
    fn calendar_event_parsing() {
        assert_eq!(CalendarEvent::parse("hourly").unwrap(), CalendarEvent::Hourly);
        assert_eq!(CalendarEvent::parse("daily").unwrap(), CalendarEvent::Daily);
        assert_eq!(
            CalendarEvent::parse("03:30").unwrap(),
            CalendarEvent::DailyAt { hour: 3, minute: 30 }
        );
        assert_eq!(
            CalendarEvent::parse("*:15").unwrap(),
            CalendarEvent::EveryHourAt { minute: 15 }
        );
        assert!(CalendarEvent::parse("25:00").is_err());
        assert!(CalendarEvent::parse("*:75").is_err());
        assert!(CalendarEvent::parse("whenever").is_err());
    }

    #[test]
    fn next_after_hourly() {
        let ev = CalendarEvent::Hourly;
        let t = 90 * NANOS_PER_MINUTE; // 01:30
        assert_eq!(ev.next_after(t), Some(2 * NANOS_PER_HOUR));
        // exactly on the boundary fires at the next one
        assert_eq!(ev.next_after(NANOS_PER_HOUR), Some(2 * NANOS_PER_HOUR));
    }

    #[test]
    fn next_after_daily_at() {
        let ev = CalendarEvent::DailyAt { hour: 6, minute: 0 };
        assert_eq!(ev.next_after(0), Some(6 * NANOS_PER_HOUR));
        assert_eq!(
            ev.next_after(7 * NANOS_PER_HOUR),
            Some(NANOS_PER_DAY + 6 * NANOS_PER_HOUR)
        );
    }

    #[test]
    fn scheduled_rotation_fires_once_due() {
        let rot = RotationPolicy::new()
            .schedule(Some("hourly".into()))
            .compile()
            .unwrap();
        let created = 10 * NANOS_PER_MINUTE;
        assert!(!rot.should_rotate(&meta(1, 1), created, 59 * NANOS_PER_MINUTE));
        assert!(rot.should_rotate(&meta(1, 1), created, 61 * NANOS_PER_MINUTE));
    }
}
