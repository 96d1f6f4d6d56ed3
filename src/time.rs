use std::{
    fmt,
    sync::{Arc, RwLock},
    time::Duration as StdDuration,
};

use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;

/// Wall-clock source so day rollover can be driven from tests.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<RwLock<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(RwLock::new(start)),
        }
    }

    pub fn set(&self, instant: DateTime<Utc>) {
        if let Ok(mut now) = self.now.write() {
            *now = instant;
        }
    }

    pub fn advance(&self, step: chrono::Duration) {
        if let Ok(mut now) = self.now.write() {
            *now += step;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        match self.now.read() {
            Ok(now) => *now,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

/// Where one calendar day ends and the next begins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DayBoundary {
    Local,
    Zone(Tz),
}

impl DayBoundary {
    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        if trimmed.eq_ignore_ascii_case("local") {
            return Ok(Self::Local);
        }

        let zone = trimmed
            .parse::<Tz>()
            .with_context(|| format!("unknown timezone: {trimmed}"))?;
        Ok(Self::Zone(zone))
    }

    pub fn date_of(&self, instant: DateTime<Utc>) -> NaiveDate {
        match self {
            Self::Local => instant.with_timezone(&chrono::Local).date_naive(),
            Self::Zone(zone) => instant.with_timezone(zone).date_naive(),
        }
    }
}

impl fmt::Display for DayBoundary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => f.write_str("local"),
            Self::Zone(zone) => write!(f, "{zone}"),
        }
    }
}

pub fn parse_std_duration(input: &str) -> Result<StdDuration> {
    let (value, unit) = split_value_and_unit(input)?;

    let amount: u64 = value
        .parse()
        .map_err(|_| anyhow!("invalid duration value: {value}"))?;
    if amount == 0 {
        return Ok(StdDuration::from_secs(0));
    }

    let unit = unit.to_ascii_lowercase();
    match unit.as_str() {
        "ms" => Ok(StdDuration::from_millis(amount)),
        "s" => Ok(StdDuration::from_secs(amount)),
        "m" => Ok(StdDuration::from_secs(
            amount
                .checked_mul(60)
                .ok_or_else(|| anyhow!("duration is too large"))?,
        )),
        "h" => Ok(StdDuration::from_secs(
            amount
                .checked_mul(60)
                .and_then(|minutes| minutes.checked_mul(60))
                .ok_or_else(|| anyhow!("duration is too large"))?,
        )),
        "d" => Ok(StdDuration::from_secs(
            amount
                .checked_mul(60)
                .and_then(|minutes| minutes.checked_mul(60))
                .and_then(|hours| hours.checked_mul(24))
                .ok_or_else(|| anyhow!("duration is too large"))?,
        )),
        _ => bail!("unsupported duration unit: {unit}"),
    }
}

fn split_value_and_unit(input: &str) -> Result<(String, String)> {
    let compact = input
        .chars()
        .filter(|character| !character.is_ascii_whitespace())
        .collect::<String>();

    if compact.is_empty() {
        bail!("duration must not be empty");
    }

    let split_index = compact
        .char_indices()
        .find_map(|(index, character)| {
            if character.is_ascii_digit() {
                None
            } else {
                Some(index)
            }
        })
        .ok_or_else(|| anyhow!("duration must include a unit suffix"))?;

    let value = compact[..split_index].to_string();
    let unit = compact[split_index..].to_string();
    if value.is_empty() || unit.is_empty() {
        bail!("duration must include a numeric value and a unit suffix");
    }

    Ok((value, unit))
}
