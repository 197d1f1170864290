use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{Duration, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::error::TimeTableError;
use crate::prayer::{ClockTime, PrayerName};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TableOrigin {
    Local,
    /// Times borrowed from the nearest date present in the source.
    Fallback { donor: NaiveDate },
}

/// The six clock times of one calendar date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DayTimeTable {
    date: NaiveDate,
    times: BTreeMap<PrayerName, ClockTime>,
    origin: TableOrigin,
}

impl DayTimeTable {
    pub fn new(
        date: NaiveDate,
        times: impl IntoIterator<Item = (PrayerName, ClockTime)>,
    ) -> Result<Self, TimeTableError> {
        let times: BTreeMap<PrayerName, ClockTime> = times.into_iter().collect();
        check_order(date, &times)?;
        Ok(Self {
            date,
            times,
            origin: TableOrigin::Local,
        })
    }

    /// Builds a table from six `HH:MM` strings in daily order.
    pub fn from_clock_strings(date: NaiveDate, clocks: [&str; 6]) -> Result<Self, TimeTableError> {
        let mut times = Vec::with_capacity(6);
        for (name, raw) in PrayerName::ALL.into_iter().zip(clocks) {
            times.push((name, raw.parse::<ClockTime>()?));
        }
        Self::new(date, times)
    }

    pub fn date(&self) -> NaiveDate {
        self.date
    }

    pub fn origin(&self) -> TableOrigin {
        self.origin
    }

    pub fn time(&self, name: PrayerName) -> ClockTime {
        self.times.get(&name).copied().unwrap_or_default()
    }

    /// Absolute instant of `name` on this table's date. `None` for the sentinel.
    pub fn instant(&self, name: PrayerName) -> Option<NaiveDateTime> {
        self.time(name).known().map(|time| self.date.and_time(time))
    }

    /// Known prayers with their instants, ascending.
    pub fn known_instants(&self) -> Vec<(PrayerName, NaiveDateTime)> {
        let mut out: Vec<_> = PrayerName::ALL
            .into_iter()
            .filter_map(|name| self.instant(name).map(|instant| (name, instant)))
            .collect();
        out.sort_by_key(|(_, instant)| *instant);
        out
    }

    pub fn has_known_times(&self) -> bool {
        self.times.values().any(ClockTime::is_known)
    }

    pub(crate) fn redated(&self, date: NaiveDate) -> Self {
        Self {
            date,
            times: self.times.clone(),
            origin: TableOrigin::Fallback { donor: self.date },
        }
    }
}

fn check_order(
    date: NaiveDate,
    times: &BTreeMap<PrayerName, ClockTime>,
) -> Result<(), TimeTableError> {
    let mut previous: Option<(PrayerName, ClockTime)> = None;
    for name in PrayerName::ALL {
        let clock = times.get(&name).copied().unwrap_or_default();
        let Some(current) = clock.known() else {
            continue;
        };
        if let Some((earlier, earlier_clock)) = previous {
            if earlier_clock.known().is_some_and(|before| before >= current) {
                return Err(TimeTableError::OutOfOrder {
                    date,
                    earlier,
                    earlier_time: earlier_clock.to_string(),
                    later: name,
                    later_time: clock.to_string(),
                });
            }
        }
        previous = Some((name, clock));
    }
    Ok(())
}

/// Deterministic date to time-table mapping.
pub trait TimeTableSource: Send + Sync {
    fn lookup(&self, date: NaiveDate) -> Option<DayTimeTable>;
}

/// One row of a time table file. Times stay raw text until [`into_table`]
/// so a bad value is reported as [`TimeTableError::InvalidTime`].
///
/// [`into_table`]: TimeTableRecord::into_table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeTableRecord {
    pub date: NaiveDate,
    #[serde(default)]
    pub fajr: Option<String>,
    #[serde(default)]
    pub sunrise: Option<String>,
    #[serde(default)]
    pub dhuhr: Option<String>,
    #[serde(default)]
    pub asr: Option<String>,
    #[serde(default)]
    pub maghrib: Option<String>,
    #[serde(default)]
    pub isha: Option<String>,
}

impl TimeTableRecord {
    pub fn into_table(self) -> Result<DayTimeTable, TimeTableError> {
        let raw = [
            (PrayerName::Fajr, self.fajr),
            (PrayerName::Sunrise, self.sunrise),
            (PrayerName::Dhuhr, self.dhuhr),
            (PrayerName::Asr, self.asr),
            (PrayerName::Maghrib, self.maghrib),
            (PrayerName::Isha, self.isha),
        ];
        let mut times = Vec::with_capacity(raw.len());
        for (name, clock) in raw {
            let clock = match clock {
                Some(text) => text.parse::<ClockTime>()?,
                None => ClockTime::Unknown,
            };
            times.push((name, clock));
        }
        DayTimeTable::new(self.date, times)
    }
}

pub const DEFAULT_FALLBACK_WINDOW_DAYS: i64 = 3;

/// Precomputed tables held in memory, loaded from JSON files.
#[derive(Debug, Clone)]
pub struct StaticTimeTable {
    days: BTreeMap<NaiveDate, DayTimeTable>,
    fallback_window_days: i64,
}

impl Default for StaticTimeTable {
    fn default() -> Self {
        Self {
            days: BTreeMap::new(),
            fallback_window_days: DEFAULT_FALLBACK_WINDOW_DAYS,
        }
    }
}

impl StaticTimeTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fallback_window(mut self, days: i64) -> Self {
        self.fallback_window_days = days.max(0);
        self
    }

    pub fn insert(&mut self, table: DayTimeTable) {
        self.days.insert(table.date(), table);
    }

    pub fn len(&self) -> usize {
        self.days.len()
    }

    pub fn is_empty(&self) -> bool {
        self.days.is_empty()
    }

    pub fn from_json_str(origin: impl AsRef<Path>, raw: &str) -> Result<Self, TimeTableError> {
        let mut table = Self::new();
        table.ingest_json(origin.as_ref(), raw)?;
        Ok(table)
    }

    /// Loads a single `.json` file or every `.json` file below a directory.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, TimeTableError> {
        let mut table = Self::new();
        table.ingest_root(path.as_ref())?;
        Ok(table)
    }

    pub fn ingest_root(&mut self, path: &Path) -> Result<(), TimeTableError> {
        if path.is_file() {
            return self.ingest_file(path);
        }

        if path.is_dir() {
            let mut files: Vec<PathBuf> = Vec::new();
            for entry in WalkDir::new(path) {
                let entry = entry?;
                if entry.file_type().is_file() && Self::is_table_file(entry.path()) {
                    files.push(entry.path().to_path_buf());
                }
            }
            files.sort();
            for file in files {
                self.ingest_file(&file)?;
            }
            return Ok(());
        }

        Err(TimeTableError::Io {
            path: path.to_path_buf(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such file or directory"),
        })
    }

    fn ingest_file(&mut self, path: &Path) -> Result<(), TimeTableError> {
        let raw = fs::read_to_string(path).map_err(|source| TimeTableError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        self.ingest_json(path, &raw)?;
        tracing::debug!(path = %path.display(), days = self.days.len(), "time table ingested");
        Ok(())
    }

    fn ingest_json(&mut self, origin: &Path, raw: &str) -> Result<(), TimeTableError> {
        let records: Vec<TimeTableRecord> =
            serde_json::from_str(raw).map_err(|source| TimeTableError::Json {
                path: origin.to_path_buf(),
                source,
            })?;
        for record in records {
            self.insert(record.into_table()?);
        }
        Ok(())
    }

    fn nearest(&self, date: NaiveDate) -> Option<&DayTimeTable> {
        let window = Duration::days(self.fallback_window_days);
        let before = self
            .days
            .range(..date)
            .next_back()
            .filter(|(candidate, _)| date - **candidate <= window);
        let after = self
            .days
            .range(date..)
            .next()
            .filter(|(candidate, _)| **candidate - date <= window);
        match (before, after) {
            (Some((b, before)), Some((a, after))) => {
                if date - *b <= *a - date {
                    Some(before)
                } else {
                    Some(after)
                }
            }
            (Some((_, table)), None) | (None, Some((_, table))) => Some(table),
            (None, None) => None,
        }
    }

    fn is_table_file(path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("json"))
            .unwrap_or(false)
    }
}

impl TimeTableSource for StaticTimeTable {
    fn lookup(&self, date: NaiveDate) -> Option<DayTimeTable> {
        if let Some(table) = self.days.get(&date) {
            return Some(table.clone());
        }
        let donor = self.nearest(date)?;
        tracing::debug!(%date, donor = %donor.date(), "using fallback time table");
        Some(donor.redated(date))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 3, d).unwrap()
    }

    #[test]
    fn rejects_out_of_order_times() {
        let err = DayTimeTable::from_clock_strings(
            day(1),
            ["05:00", "06:30", "12:00", "11:00", "18:00", "19:30"],
        )
        .unwrap_err();
        assert!(matches!(
            err,
            TimeTableError::OutOfOrder {
                earlier: PrayerName::Dhuhr,
                later: PrayerName::Asr,
                ..
            }
        ));
    }

    #[test]
    fn unknown_times_do_not_break_ordering() {
        let table = DayTimeTable::from_clock_strings(
            day(1),
            ["05:00", "--:--", "12:00", "--:--", "18:00", "19:30"],
        )
        .unwrap();
        let names: Vec<_> = table.known_instants().into_iter().map(|(n, _)| n).collect();
        assert_eq!(
            names,
            vec![
                PrayerName::Fajr,
                PrayerName::Dhuhr,
                PrayerName::Maghrib,
                PrayerName::Isha
            ]
        );
        assert_eq!(table.instant(PrayerName::Asr), None);
    }

    #[test]
    fn parses_records_with_missing_fields_as_unknown() {
        let raw = r#"[
            {"date": "2025-03-01", "fajr": "05:01", "sunrise": "06:30", "dhuhr": "12:10",
             "asr": "15:20", "maghrib": "17:55", "isha": "19:20"},
            {"date": "2025-03-02", "fajr": "04:59", "isha": "--:--"}
        ]"#;
        let source = StaticTimeTable::from_json_str("inline.json", raw).unwrap();
        assert_eq!(source.len(), 2);
        let second = source.lookup(day(2)).unwrap();
        assert_eq!(second.time(PrayerName::Fajr), ClockTime::hm(4, 59).unwrap());
        assert_eq!(second.time(PrayerName::Dhuhr), ClockTime::Unknown);
        assert_eq!(second.origin(), TableOrigin::Local);
    }

    #[test]
    fn invalid_time_strings_are_rejected() {
        let raw = r#"[{"date": "2025-03-01", "fajr": "5 o'clock"}]"#;
        match StaticTimeTable::from_json_str("bad.json", raw) {
            Err(TimeTableError::InvalidTime(text)) => assert_eq!(text, "5 o'clock"),
            other => panic!("expected InvalidTime, got {other:?}"),
        }
    }

    #[test]
    fn malformed_documents_are_json_errors() {
        let raw = r#"[{"date": "2025-03-01", "fajr": 5}]"#;
        assert!(matches!(
            StaticTimeTable::from_json_str("bad.json", raw),
            Err(TimeTableError::Json { .. })
        ));
    }

    #[test]
    fn fallback_uses_nearest_date_within_window() {
        let mut source = StaticTimeTable::new().with_fallback_window(3);
        source.insert(
            DayTimeTable::from_clock_strings(
                day(1),
                ["05:00", "06:30", "12:00", "15:00", "18:00", "19:30"],
            )
            .unwrap(),
        );
        source.insert(
            DayTimeTable::from_clock_strings(
                day(10),
                ["04:50", "06:20", "12:00", "15:10", "18:10", "19:40"],
            )
            .unwrap(),
        );

        let borrowed = source.lookup(day(3)).unwrap();
        assert_eq!(borrowed.date(), day(3));
        assert_eq!(borrowed.origin(), TableOrigin::Fallback { donor: day(1) });
        assert_eq!(
            borrowed.instant(PrayerName::Fajr),
            day(3).and_hms_opt(5, 0, 0)
        );

        let later = source.lookup(day(8)).unwrap();
        assert_eq!(later.origin(), TableOrigin::Fallback { donor: day(10) });

        assert!(source.lookup(day(5)).is_none());
    }

    #[test]
    fn load_walks_directories_for_json_files() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("2025");
        fs::create_dir_all(&nested).unwrap();
        fs::write(
            nested.join("march.json"),
            r#"[{"date": "2025-03-01", "fajr": "05:01", "isha": "19:20"}]"#,
        )
        .unwrap();
        fs::write(nested.join("notes.txt"), "not a table").unwrap();

        let source = StaticTimeTable::load(dir.path()).unwrap();
        assert_eq!(source.len(), 1);
        assert!(source.lookup(day(1)).is_some());
    }
}
