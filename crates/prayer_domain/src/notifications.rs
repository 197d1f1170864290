use std::collections::{BTreeMap, HashSet};

use chrono::{NaiveDate, NaiveDateTime};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::CapabilityError;
use crate::prayer::PrayerName;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SoundPreference {
    #[default]
    Azan,
    Beep,
}

/// Sound and vibration attached to a notification.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AlertProfile {
    /// Full azan audio with a long vibration pattern.
    Azan,
    /// Short beep with a single pulse.
    Short,
}

impl AlertProfile {
    pub fn for_prayer(prayer: PrayerName, preference: SoundPreference) -> Self {
        if !prayer.is_actionable() || preference == SoundPreference::Beep {
            AlertProfile::Short
        } else {
            AlertProfile::Azan
        }
    }

    pub fn sound(&self) -> &'static str {
        match self {
            AlertProfile::Azan => "azan.wav",
            AlertProfile::Short => "beep.wav",
        }
    }

    /// Vibration pattern in milliseconds, alternating wait and vibrate.
    pub fn vibration(&self) -> &'static [u64] {
        match self {
            AlertProfile::Azan => &[0, 500, 250, 500, 250, 1000],
            AlertProfile::Short => &[0, 250],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NotificationSettings {
    pub enabled: bool,
    pub sound: SoundPreference,
    pub prayers: BTreeMap<PrayerName, bool>,
}

impl Default for NotificationSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            sound: SoundPreference::default(),
            prayers: PrayerName::ALL
                .into_iter()
                .map(|name| (name, name.is_actionable()))
                .collect(),
        }
    }
}

impl NotificationSettings {
    pub fn is_prayer_enabled(&self, prayer: PrayerName) -> bool {
        self.prayers.get(&prayer).copied().unwrap_or(false)
    }

    pub fn set_prayer(&mut self, prayer: PrayerName, enabled: bool) {
        self.prayers.insert(prayer, enabled);
    }

    pub fn only(prayers: &[PrayerName]) -> Self {
        Self {
            prayers: PrayerName::ALL
                .into_iter()
                .map(|name| (name, prayers.contains(&name)))
                .collect(),
            ..Self::default()
        }
    }
}

/// Opaque id of a notification registered with the platform.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NotificationHandle(pub String);

pub const HANDLE_PREFIX: &str = "prayer:";

impl NotificationHandle {
    /// One stable id per (date, prayer).
    pub fn for_prayer(date: NaiveDate, prayer: PrayerName) -> Self {
        Self(format!("{HANDLE_PREFIX}{date}:{prayer}"))
    }

    pub fn is_prayer_handle(&self) -> bool {
        self.0.starts_with(HANDLE_PREFIX)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NotificationRequest {
    pub id: NotificationHandle,
    pub prayer: PrayerName,
    pub title: String,
    pub body: String,
    pub scheduled_for: NaiveDateTime,
    pub profile: AlertProfile,
}

impl NotificationRequest {
    pub fn for_prayer(
        prayer: PrayerName,
        scheduled_for: NaiveDateTime,
        preference: SoundPreference,
    ) -> Self {
        let title = if prayer.is_actionable() {
            format!("Time for {prayer}")
        } else {
            prayer.to_string()
        };
        let body = if prayer.is_actionable() {
            format!("{prayer} begins at {}", scheduled_for.format("%H:%M"))
        } else {
            format!("The sun rises at {}", scheduled_for.format("%H:%M"))
        };
        Self {
            id: NotificationHandle::for_prayer(scheduled_for.date(), prayer),
            prayer,
            title,
            body,
            scheduled_for,
            profile: AlertProfile::for_prayer(prayer, preference),
        }
    }

    /// One-shot request firing at `now`, outside the per-day id space.
    pub fn immediate(prayer: PrayerName, now: NaiveDateTime, preference: SoundPreference) -> Self {
        let mut request = Self::for_prayer(prayer, now, preference);
        request.id = NotificationHandle(format!(
            "immediate:{prayer}:{}",
            now.format("%Y%m%dT%H%M%S")
        ));
        request
    }
}

/// Platform notification primitive. Implementations deliver at the requested
/// local instant even when the host process is suspended.
pub trait NotificationCapability: Send + Sync {
    fn request_permission(&self) -> Result<bool, CapabilityError>;
    fn schedule_at(
        &self,
        request: &NotificationRequest,
    ) -> Result<NotificationHandle, CapabilityError>;
    fn cancel(&self, handle: &NotificationHandle) -> Result<(), CapabilityError>;
    fn list_scheduled(&self) -> Result<Vec<NotificationHandle>, CapabilityError>;
}

/// In-process notification backend. Keeps pending requests in memory and
/// hands them out once due; useful for headless hosts and tests.
#[derive(Debug)]
pub struct MemoryNotifier {
    state: Mutex<MemoryNotifierState>,
}

#[derive(Debug, Default)]
struct MemoryNotifierState {
    granted: bool,
    pending: BTreeMap<NotificationHandle, NotificationRequest>,
    failing: HashSet<PrayerName>,
    schedule_calls: usize,
    cancel_calls: usize,
}

impl Default for MemoryNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryNotifierState {
                granted: true,
                ..MemoryNotifierState::default()
            }),
        }
    }

    pub fn denied() -> Self {
        let notifier = Self::new();
        notifier.set_permission(false);
        notifier
    }

    pub fn set_permission(&self, granted: bool) {
        self.state.lock().granted = granted;
    }

    /// Makes every `schedule_at` for `prayer` fail with a transient error.
    pub fn fail_for(&self, prayer: PrayerName) {
        self.state.lock().failing.insert(prayer);
    }

    pub fn pending(&self) -> Vec<NotificationRequest> {
        let mut pending: Vec<_> = self.state.lock().pending.values().cloned().collect();
        pending.sort_by_key(|request| request.scheduled_for);
        pending
    }

    /// Removes and returns every request due at or before `now`.
    pub fn take_due(&self, now: NaiveDateTime) -> Vec<NotificationRequest> {
        let mut state = self.state.lock();
        let due: Vec<NotificationHandle> = state
            .pending
            .iter()
            .filter(|(_, request)| request.scheduled_for <= now)
            .map(|(handle, _)| handle.clone())
            .collect();
        let mut out: Vec<_> = due
            .iter()
            .filter_map(|handle| state.pending.remove(handle))
            .collect();
        out.sort_by_key(|request| request.scheduled_for);
        out
    }

    pub fn schedule_calls(&self) -> usize {
        self.state.lock().schedule_calls
    }

    pub fn cancel_calls(&self) -> usize {
        self.state.lock().cancel_calls
    }
}

impl NotificationCapability for MemoryNotifier {
    fn request_permission(&self) -> Result<bool, CapabilityError> {
        Ok(self.state.lock().granted)
    }

    fn schedule_at(
        &self,
        request: &NotificationRequest,
    ) -> Result<NotificationHandle, CapabilityError> {
        let mut state = self.state.lock();
        state.schedule_calls += 1;
        if !state.granted {
            return Err(CapabilityError::PermissionDenied);
        }
        if state.failing.contains(&request.prayer) {
            return Err(CapabilityError::Transient(format!(
                "backend rejected {}",
                request.id.as_str()
            )));
        }
        state.pending.insert(request.id.clone(), request.clone());
        Ok(request.id.clone())
    }

    fn cancel(&self, handle: &NotificationHandle) -> Result<(), CapabilityError> {
        let mut state = self.state.lock();
        state.cancel_calls += 1;
        state.pending.remove(handle);
        Ok(())
    }

    fn list_scheduled(&self) -> Result<Vec<NotificationHandle>, CapabilityError> {
        Ok(self.state.lock().pending.keys().cloned().collect())
    }
}
