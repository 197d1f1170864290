use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};

use crate::error::TimeTableError;

#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
pub enum PrayerName {
    Fajr,
    Sunrise,
    Dhuhr,
    Asr,
    Maghrib,
    Isha,
}

impl PrayerName {
    /// Fixed daily order.
    pub const ALL: [PrayerName; 6] = [
        PrayerName::Fajr,
        PrayerName::Sunrise,
        PrayerName::Dhuhr,
        PrayerName::Asr,
        PrayerName::Maghrib,
        PrayerName::Isha,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PrayerName::Fajr => "Fajr",
            PrayerName::Sunrise => "Sunrise",
            PrayerName::Dhuhr => "Dhuhr",
            PrayerName::Asr => "Asr",
            PrayerName::Maghrib => "Maghrib",
            PrayerName::Isha => "Isha",
        }
    }

    /// Sunrise marks the end of the Fajr window and is not itself a prayer.
    pub fn is_actionable(&self) -> bool {
        !matches!(self, PrayerName::Sunrise)
    }
}

impl fmt::Display for PrayerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PrayerName {
    type Err = TimeTableError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        PrayerName::ALL
            .into_iter()
            .find(|name| name.as_str().eq_ignore_ascii_case(trimmed))
            .ok_or_else(|| TimeTableError::UnknownPrayer(trimmed.to_string()))
    }
}

pub const UNKNOWN_TIME: &str = "--:--";

/// Wall-clock time of a prayer, or the `--:--` sentinel when the source has no value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ClockTime {
    Known(NaiveTime),
    #[default]
    Unknown,
}

impl ClockTime {
    pub fn hm(hour: u32, minute: u32) -> Option<Self> {
        NaiveTime::from_hms_opt(hour, minute, 0).map(ClockTime::Known)
    }

    pub fn known(&self) -> Option<NaiveTime> {
        match self {
            ClockTime::Known(time) => Some(*time),
            ClockTime::Unknown => None,
        }
    }

    pub fn is_known(&self) -> bool {
        matches!(self, ClockTime::Known(_))
    }
}

impl fmt::Display for ClockTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClockTime::Known(time) => write!(f, "{}", time.format("%H:%M")),
            ClockTime::Unknown => f.write_str(UNKNOWN_TIME),
        }
    }
}

impl FromStr for ClockTime {
    type Err = TimeTableError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() || trimmed == UNKNOWN_TIME {
            return Ok(ClockTime::Unknown);
        }
        NaiveTime::parse_from_str(trimmed, "%H:%M")
            .map(ClockTime::Known)
            .map_err(|_| TimeTableError::InvalidTime(trimmed.to_string()))
    }
}

impl Serialize for ClockTime {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ClockTime {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// A specific prayer on a specific day, identified by its absolute instant.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct OccurrenceKey {
    pub prayer: PrayerName,
    pub instant: NaiveDateTime,
}

impl OccurrenceKey {
    pub fn new(prayer: PrayerName, instant: NaiveDateTime) -> Self {
        Self { prayer, instant }
    }

    pub fn tracker_tag(&self, subsystem: &str) -> String {
        format!("{subsystem}:{self}")
    }
}

impl fmt::Display for OccurrenceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{}",
            self.prayer,
            self.instant.format("%Y-%m-%dT%H:%M:%S")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn parses_names_case_insensitively() {
        assert_eq!("maghrib".parse::<PrayerName>().unwrap(), PrayerName::Maghrib);
        assert_eq!(" ISHA ".parse::<PrayerName>().unwrap(), PrayerName::Isha);
        assert!("tahajjud".parse::<PrayerName>().is_err());
    }

    #[test]
    fn clock_time_accepts_sentinel_and_rejects_garbage() {
        assert_eq!("--:--".parse::<ClockTime>().unwrap(), ClockTime::Unknown);
        assert_eq!("".parse::<ClockTime>().unwrap(), ClockTime::Unknown);
        assert_eq!(
            "03:17".parse::<ClockTime>().unwrap(),
            ClockTime::hm(3, 17).unwrap()
        );
        assert!(matches!(
            "25:99".parse::<ClockTime>(),
            Err(TimeTableError::InvalidTime(_))
        ));
        assert_eq!(ClockTime::Unknown.to_string(), "--:--");
        assert_eq!(ClockTime::hm(20, 0).unwrap().to_string(), "20:00");
    }

    #[test]
    fn tracker_tag_combines_subsystem_and_occurrence() {
        let instant = NaiveDate::from_ymd_opt(2025, 3, 1)
            .unwrap()
            .and_hms_opt(15, 2, 0)
            .unwrap();
        let key = OccurrenceKey::new(PrayerName::Asr, instant);
        assert_eq!(key.tracker_tag("arrival"), "arrival:Asr@2025-03-01T15:02:00");
    }

    #[test]
    fn only_sunrise_is_not_actionable() {
        let inactive: Vec<_> = PrayerName::ALL
            .into_iter()
            .filter(|name| !name.is_actionable())
            .collect();
        assert_eq!(inactive, vec![PrayerName::Sunrise]);
    }
}
