use chrono::{Duration, NaiveDateTime};
use serde::Serialize;

use crate::prayer::{OccurrenceKey, PrayerName};
use crate::timetable::DayTimeTable;

/// A prayer within this much of `now` still counts as upcoming.
pub const GRACE_WINDOW_SECS: i64 = 60;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedNextPrayer {
    pub name: PrayerName,
    /// Set when every prayer of the table's day has passed and this is the
    /// following day's first prayer.
    pub next_day: bool,
    pub instant: NaiveDateTime,
    pub display_time: String,
}

impl ResolvedNextPrayer {
    fn new(name: PrayerName, instant: NaiveDateTime, next_day: bool) -> Self {
        Self {
            name,
            next_day,
            instant,
            display_time: instant.format("%H:%M").to_string(),
        }
    }

    pub fn label(&self) -> String {
        if self.next_day {
            format!("{} (Tomorrow)", self.name)
        } else {
            self.name.to_string()
        }
    }

    pub fn key(&self) -> OccurrenceKey {
        OccurrenceKey::new(self.name, self.instant)
    }
}

/// Nearest upcoming prayer for `table` at `now`.
///
/// With `day_offset == 0` the first prayer later than `now - 60s` wins, and
/// once the whole day has passed the result is the next day's Fajr at the same
/// clock time. Any other offset is a preview and returns the day's first prayer.
pub fn resolve_next(
    table: &DayTimeTable,
    now: NaiveDateTime,
    day_offset: i64,
) -> Option<ResolvedNextPrayer> {
    resolve_next_after(
        table,
        None,
        now,
        day_offset,
        None,
        Duration::seconds(GRACE_WINDOW_SECS),
    )
}

/// Like [`resolve_next`], but skips `handled` and everything at or before it,
/// and takes the next-day prayer from `tomorrow` when one is supplied.
pub fn resolve_next_after(
    table: &DayTimeTable,
    tomorrow: Option<&DayTimeTable>,
    now: NaiveDateTime,
    day_offset: i64,
    handled: Option<&OccurrenceKey>,
    grace: Duration,
) -> Option<ResolvedNextPrayer> {
    let candidates = table.known_instants();
    let (first_name, first_instant) = *candidates.first()?;

    if day_offset != 0 {
        return Some(ResolvedNextPrayer::new(first_name, first_instant, false));
    }

    let threshold = now - grace;
    let upcoming = candidates.iter().find(|(_, instant)| {
        *instant > threshold && handled.map_or(true, |key| *instant > key.instant)
    });
    if let Some((name, instant)) = upcoming {
        return Some(ResolvedNextPrayer::new(*name, *instant, false));
    }

    if let Some(instant) = tomorrow
        .filter(|next| Some(next.date()) == table.date().succ_opt())
        .and_then(|next| next.instant(PrayerName::Fajr))
    {
        return Some(ResolvedNextPrayer::new(PrayerName::Fajr, instant, true));
    }

    let (name, instant) = table
        .instant(PrayerName::Fajr)
        .map(|instant| (PrayerName::Fajr, instant))
        .unwrap_or((first_name, first_instant));
    Some(ResolvedNextPrayer::new(name, instant + Duration::days(1), true))
}

/// Instant of the most recent prayer at or before `now`, falling back to
/// yesterday's Isha before the day's first prayer.
pub fn last_prayer_instant(
    today: &DayTimeTable,
    yesterday: Option<&DayTimeTable>,
    now: NaiveDateTime,
) -> Option<NaiveDateTime> {
    today
        .known_instants()
        .into_iter()
        .map(|(_, instant)| instant)
        .filter(|instant| *instant <= now)
        .last()
        .or_else(|| yesterday.and_then(|table| table.instant(PrayerName::Isha)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 6, 14).unwrap()
    }

    fn at(h: u32, m: u32, s: u32) -> NaiveDateTime {
        date().and_hms_opt(h, m, s).unwrap()
    }

    fn sample() -> DayTimeTable {
        DayTimeTable::from_clock_strings(
            date(),
            ["03:17", "04:47", "11:39", "15:02", "18:30", "20:00"],
        )
        .unwrap()
    }

    #[test]
    fn before_fajr_resolves_fajr() {
        let next = resolve_next(&sample(), at(1, 0, 0), 0).unwrap();
        assert_eq!(next.name, PrayerName::Fajr);
        assert!(!next.next_day);
        assert_eq!(next.instant, at(3, 17, 0));
        assert_eq!(next.display_time, "03:17");
    }

    #[test]
    fn afternoon_resolves_asr_after_dhuhr_has_passed() {
        let next = resolve_next(&sample(), at(14, 0, 0), 0).unwrap();
        assert_eq!(next.name, PrayerName::Asr);
        assert_eq!(next.display_time, "15:02");
    }

    #[test]
    fn grace_window_keeps_a_just_started_prayer() {
        let next = resolve_next(&sample(), at(15, 2, 45), 0).unwrap();
        assert_eq!(next.name, PrayerName::Asr);
        let next = resolve_next(&sample(), at(15, 3, 0), 0).unwrap();
        assert_eq!(next.name, PrayerName::Maghrib);
    }

    #[test]
    fn after_isha_rolls_over_to_tomorrows_fajr() {
        let next = resolve_next(&sample(), at(21, 0, 0), 0).unwrap();
        assert_eq!(next.name, PrayerName::Fajr);
        assert!(next.next_day);
        assert_eq!(next.label(), "Fajr (Tomorrow)");
        assert_eq!(next.instant, at(3, 17, 0) + Duration::hours(24));
    }

    #[test]
    fn rollover_prefers_tomorrows_table() {
        let tomorrow = DayTimeTable::from_clock_strings(
            date().succ_opt().unwrap(),
            ["03:16", "04:47", "11:39", "15:02", "18:31", "20:01"],
        )
        .unwrap();
        let next = resolve_next_after(
            &sample(),
            Some(&tomorrow),
            at(21, 0, 0),
            0,
            None,
            Duration::seconds(GRACE_WINDOW_SECS),
        )
        .unwrap();
        assert_eq!(next.instant, tomorrow.instant(PrayerName::Fajr).unwrap());
    }

    #[test]
    fn handled_occurrence_is_excluded_inside_grace_window() {
        let handled = OccurrenceKey::new(PrayerName::Asr, at(15, 2, 0));
        let next = resolve_next_after(
            &sample(),
            None,
            at(15, 1, 55),
            0,
            Some(&handled),
            Duration::seconds(GRACE_WINDOW_SECS),
        )
        .unwrap();
        assert_eq!(next.name, PrayerName::Maghrib);
    }

    #[test]
    fn preview_days_ignore_now() {
        let next = resolve_next(&sample(), at(23, 0, 0), 2).unwrap();
        assert_eq!(next.name, PrayerName::Fajr);
        assert!(!next.next_day);
    }

    #[test]
    fn unknown_times_are_skipped_and_empty_tables_resolve_nothing() {
        let partial = DayTimeTable::from_clock_strings(
            date(),
            ["03:17", "04:47", "11:39", "--:--", "18:30", "20:00"],
        )
        .unwrap();
        let next = resolve_next(&partial, at(14, 0, 0), 0).unwrap();
        assert_eq!(next.name, PrayerName::Maghrib);

        let empty = DayTimeTable::from_clock_strings(
            date(),
            ["--:--", "--:--", "--:--", "--:--", "--:--", "--:--"],
        )
        .unwrap();
        assert!(resolve_next(&empty, at(14, 0, 0), 0).is_none());
    }

    #[test]
    fn missing_fajr_rolls_over_to_first_known_prayer() {
        let partial = DayTimeTable::from_clock_strings(
            date(),
            ["--:--", "04:47", "11:39", "15:02", "18:30", "20:00"],
        )
        .unwrap();
        let next = resolve_next(&partial, at(22, 0, 0), 0).unwrap();
        assert_eq!(next.name, PrayerName::Sunrise);
        assert!(next.next_day);
    }

    #[test]
    fn last_prayer_scans_today_then_yesterdays_isha() {
        let today = sample();
        assert_eq!(
            last_prayer_instant(&today, None, at(14, 0, 0)),
            Some(at(11, 39, 0))
        );
        let yesterday = DayTimeTable::from_clock_strings(
            date().pred_opt().unwrap(),
            ["03:18", "04:48", "11:39", "15:02", "18:29", "19:59"],
        )
        .unwrap();
        assert_eq!(
            last_prayer_instant(&today, Some(&yesterday), at(2, 0, 0)),
            yesterday.instant(PrayerName::Isha)
        );
        assert_eq!(last_prayer_instant(&today, None, at(2, 0, 0)), None);
    }
}
