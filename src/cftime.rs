//! # CF Time Decoding
//!
//! Decodes numeric time coordinates (`"days since 1979-01-01 00:00:00"`) under
//! the CF calendars used by CMIP6 models. Climate models commonly run on
//! `noleap` or `360_day` calendars, which `chrono` cannot represent, so dates
//! are kept as plain calendar fields and compared field by field.

use crate::error::DatasetError;
use chrono::{Datelike, NaiveDate};
use std::fmt;
use std::str::FromStr;

const SECONDS_PER_DAY: i64 = 86_400;

const CUMULATIVE_DAYS: [i64; 13] = [0, 31, 59, 90, 120, 151, 181, 212, 243, 273, 304, 334, 365];
const CUMULATIVE_DAYS_LEAP: [i64; 13] = [0, 31, 60, 91, 121, 152, 182, 213, 244, 274, 305, 335, 366];

/// CF calendar attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Calendar {
    /// `standard` / `gregorian`; decoded as proleptic Gregorian, exact after 1582-10-15
    Standard,
    ProlepticGregorian,
    NoLeap,
    AllLeap,
    Day360,
    Julian,
}

impl FromStr for Calendar {
    type Err = DatasetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "standard" | "gregorian" => Ok(Calendar::Standard),
            "proleptic_gregorian" => Ok(Calendar::ProlepticGregorian),
            "noleap" | "365_day" => Ok(Calendar::NoLeap),
            "all_leap" | "366_day" => Ok(Calendar::AllLeap),
            "360_day" => Ok(Calendar::Day360),
            "julian" => Ok(Calendar::Julian),
            other => Err(DatasetError::InvalidData(format!(
                "unsupported calendar '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for Calendar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Calendar::Standard => "standard",
            Calendar::ProlepticGregorian => "proleptic_gregorian",
            Calendar::NoLeap => "noleap",
            Calendar::AllLeap => "all_leap",
            Calendar::Day360 => "360_day",
            Calendar::Julian => "julian",
        };
        f.write_str(name)
    }
}

impl Calendar {
    /// Day count of a date relative to an arbitrary per-calendar origin.
    fn day_number(&self, year: i32, month: u32, day: u32) -> Result<i64, DatasetError> {
        if !(1..=12).contains(&month) || day == 0 || day > self.days_in_month(year, month) {
            return Err(DatasetError::InvalidData(format!(
                "{:04}-{:02}-{:02} is not a valid {} date",
                year, month, day, self
            )));
        }
        let (y, m, d) = (year as i64, month as usize, day as i64);
        let number = match self {
            Calendar::Standard | Calendar::ProlepticGregorian => {
                let date = NaiveDate::from_ymd_opt(year, month, day).ok_or_else(|| {
                    DatasetError::InvalidData(format!("{}-{}-{} out of range", year, month, day))
                })?;
                date.num_days_from_ce() as i64
            }
            Calendar::NoLeap => y * 365 + CUMULATIVE_DAYS[m - 1] + d - 1,
            Calendar::AllLeap => y * 366 + CUMULATIVE_DAYS_LEAP[m - 1] + d - 1,
            Calendar::Day360 => y * 360 + (m as i64 - 1) * 30 + d - 1,
            Calendar::Julian => {
                let a = (14 - m as i64) / 12;
                let y2 = y + 4800 - a;
                let m2 = m as i64 + 12 * a - 3;
                d + (153 * m2 + 2) / 5 + 365 * y2 + y2.div_euclid(4) - 32083
            }
        };
        Ok(number)
    }

    fn from_day_number(&self, number: i64) -> Result<(i32, u32, u32), DatasetError> {
        let ymd = match self {
            Calendar::Standard | Calendar::ProlepticGregorian => {
                let days = i32::try_from(number).map_err(|_| {
                    DatasetError::InvalidData(format!("day number {} out of range", number))
                })?;
                let date = NaiveDate::from_num_days_from_ce_opt(days).ok_or_else(|| {
                    DatasetError::InvalidData(format!("day number {} out of range", number))
                })?;
                (date.year(), date.month(), date.day())
            }
            Calendar::NoLeap => split_fixed_year(number, &CUMULATIVE_DAYS),
            Calendar::AllLeap => split_fixed_year(number, &CUMULATIVE_DAYS_LEAP),
            Calendar::Day360 => {
                let year = number.div_euclid(360);
                let doy = number.rem_euclid(360);
                (year as i32, (doy / 30 + 1) as u32, (doy % 30 + 1) as u32)
            }
            Calendar::Julian => {
                let c = number + 32082;
                let d = (4 * c + 3).div_euclid(1461);
                let e = c - (1461 * d).div_euclid(4);
                let m = (5 * e + 2) / 153;
                let day = e - (153 * m + 2) / 5 + 1;
                let month = m + 3 - 12 * (m / 10);
                let year = d - 4800 + m / 10;
                (year as i32, month as u32, day as u32)
            }
        };
        Ok(ymd)
    }

    pub fn days_in_month(&self, year: i32, month: u32) -> u32 {
        let leap = match self {
            Calendar::Standard | Calendar::ProlepticGregorian => {
                (year % 4 == 0 && year % 100 != 0) || year % 400 == 0
            }
            Calendar::Julian => year.rem_euclid(4) == 0,
            Calendar::NoLeap => false,
            Calendar::AllLeap => true,
            Calendar::Day360 => return 30,
        };
        match month {
            2 if leap => 29,
            2 => 28,
            4 | 6 | 9 | 11 => 30,
            _ => 31,
        }
    }
}

fn split_fixed_year(number: i64, cumulative: &[i64; 13]) -> (i32, u32, u32) {
    let length = cumulative[12];
    let year = number.div_euclid(length);
    let doy = number.rem_euclid(length);
    let month = cumulative
        .iter()
        .rposition(|&start| start <= doy)
        .unwrap_or(0)
        .min(11);
    (
        year as i32,
        month as u32 + 1,
        (doy - cumulative[month] + 1) as u32,
    )
}

/// Calendar-agnostic date and time of day.
///
/// Field order gives chronological ordering within a single calendar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct CfDateTime {
    pub year: i32,
    pub month: u32,
    pub day: u32,
    pub second_of_day: u32,
}

impl CfDateTime {
    pub fn ymd(year: i32, month: u32, day: u32) -> Self {
        CfDateTime {
            year,
            month,
            day,
            second_of_day: 0,
        }
    }

    pub fn date(&self) -> (i32, u32, u32) {
        (self.year, self.month, self.day)
    }
}

impl From<NaiveDate> for CfDateTime {
    fn from(date: NaiveDate) -> Self {
        CfDateTime::ymd(date.year(), date.month(), date.day())
    }
}

impl fmt::Display for CfDateTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.second_of_day;
        write!(
            f,
            "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
            self.year,
            self.month,
            self.day,
            s / 3600,
            (s % 3600) / 60,
            s % 60
        )
    }
}

/// Parsed CF `units` attribute of a time coordinate together with its calendar.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeEncoding {
    pub unit_seconds: f64,
    pub epoch: CfDateTime,
    pub calendar: Calendar,
}

impl TimeEncoding {
    /// Parses `"<unit> since <date>[ <time>]"`. A missing calendar means `standard`.
    pub fn parse(units: &str, calendar: Option<&str>) -> Result<Self, DatasetError> {
        let calendar = calendar.map(Calendar::from_str).transpose()?.unwrap_or(Calendar::Standard);
        let (unit, reference) = units.split_once(" since ").ok_or_else(|| {
            DatasetError::InvalidData(format!("time units '{}' lack a reference date", units))
        })?;

        let unit_seconds = match unit.trim().to_ascii_lowercase().as_str() {
            "days" | "day" | "d" => 86_400.0,
            "hours" | "hour" | "hrs" | "hr" | "h" => 3_600.0,
            "minutes" | "minute" | "mins" | "min" => 60.0,
            "seconds" | "second" | "secs" | "sec" | "s" => 1.0,
            other => {
                return Err(DatasetError::InvalidData(format!(
                    "unsupported time unit '{}'",
                    other
                )));
            }
        };

        let reference = reference.trim().replace('T', " ");
        let mut parts = reference.split_whitespace();
        let date = parts.next().ok_or_else(|| {
            DatasetError::InvalidData(format!("empty reference date in '{}'", units))
        })?;
        let ymd: Vec<&str> = date.split('-').collect();
        if ymd.len() != 3 {
            return Err(DatasetError::InvalidData(format!(
                "invalid reference date '{}'",
                date
            )));
        }
        let parse_field = |s: &str| {
            s.parse::<i64>()
                .map_err(|_| DatasetError::InvalidData(format!("invalid reference date '{}'", date)))
        };
        let (year, month, day) = (parse_field(ymd[0])?, parse_field(ymd[1])?, parse_field(ymd[2])?);

        let second_of_day = match parts.next() {
            Some(time) => {
                let hms: Vec<f64> = time
                    .split(':')
                    .map(|s| s.parse::<f64>())
                    .collect::<Result<_, _>>()
                    .map_err(|_| {
                        DatasetError::InvalidData(format!("invalid reference time '{}'", time))
                    })?;
                let seconds = hms.first().copied().unwrap_or(0.0) * 3600.0
                    + hms.get(1).copied().unwrap_or(0.0) * 60.0
                    + hms.get(2).copied().unwrap_or(0.0);
                seconds as u32
            }
            None => 0,
        };

        let epoch = CfDateTime {
            year: year as i32,
            month: month as u32,
            day: day as u32,
            second_of_day,
        };
        calendar.day_number(epoch.year, epoch.month, epoch.day)?;

        Ok(TimeEncoding {
            unit_seconds,
            epoch,
            calendar,
        })
    }

    /// Decodes one encoded value.
    pub fn decode(&self, value: f64) -> Result<CfDateTime, DatasetError> {
        if !value.is_finite() {
            return Err(DatasetError::InvalidData(format!(
                "non-finite time value {}",
                value
            )));
        }
        let offset = (value * self.unit_seconds).round() as i64 + self.epoch.second_of_day as i64;
        let days = offset.div_euclid(SECONDS_PER_DAY);
        let second_of_day = offset.rem_euclid(SECONDS_PER_DAY) as u32;
        let epoch_day = self
            .calendar
            .day_number(self.epoch.year, self.epoch.month, self.epoch.day)?;
        let (year, month, day) = self.calendar.from_day_number(epoch_day + days)?;
        Ok(CfDateTime {
            year,
            month,
            day,
            second_of_day,
        })
    }

    /// Encodes a date as a value in these units.
    pub fn encode(&self, date: CfDateTime) -> Result<f64, DatasetError> {
        let day = self.calendar.day_number(date.year, date.month, date.day)?;
        let epoch_day = self
            .calendar
            .day_number(self.epoch.year, self.epoch.month, self.epoch.day)?;
        let seconds = (day - epoch_day) * SECONDS_PER_DAY + date.second_of_day as i64
            - self.epoch.second_of_day as i64;
        Ok(seconds as f64 / self.unit_seconds)
    }
}

/// Indices of time values strictly before `cutoff`.
pub fn indices_before(
    values: &[f64],
    encoding: &TimeEncoding,
    cutoff: CfDateTime,
) -> Result<Vec<usize>, DatasetError> {
    let mut kept = Vec::with_capacity(values.len());
    for (i, &value) in values.iter().enumerate() {
        if encoding.decode(value)? < cutoff {
            kept.push(i);
        }
    }
    Ok(kept)
}
