use chrono::NaiveDateTime;
use prayer_domain::error::CapabilityError;
use prayer_domain::notifications::{
    MemoryNotifier, NotificationCapability, NotificationHandle, NotificationRequest,
};
use tracing::{debug, info};

/// Notification backend for a headless host: requests wait in memory and are
/// written to the log when they come due.
#[derive(Debug, Default)]
pub struct LogNotifier {
    inner: MemoryNotifier,
}

impl LogNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending(&self) -> Vec<NotificationRequest> {
        self.inner.pending()
    }

    /// Emits every request due at `now` and drops it from the queue.
    pub fn fire_due(&self, now: NaiveDateTime) -> Vec<NotificationRequest> {
        let due = self.inner.take_due(now);
        for request in &due {
            info!(
                prayer = %request.prayer,
                id = request.id.as_str(),
                sound = request.profile.sound(),
                vibration = ?request.profile.vibration(),
                late_secs = (now - request.scheduled_for).num_seconds(),
                "{}: {}",
                request.title,
                request.body
            );
        }
        due
    }
}

impl NotificationCapability for LogNotifier {
    fn request_permission(&self) -> Result<bool, CapabilityError> {
        self.inner.request_permission()
    }

    fn schedule_at(
        &self,
        request: &NotificationRequest,
    ) -> Result<NotificationHandle, CapabilityError> {
        debug!(
            id = request.id.as_str(),
            at = %request.scheduled_for,
            "queueing notification"
        );
        self.inner.schedule_at(request)
    }

    fn cancel(&self, handle: &NotificationHandle) -> Result<(), CapabilityError> {
        self.inner.cancel(handle)
    }

    fn list_scheduled(&self) -> Result<Vec<NotificationHandle>, CapabilityError> {
        self.inner.list_scheduled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use prayer_domain::notifications::SoundPreference;
    use prayer_domain::prayer::PrayerName;

    #[test]
    fn due_requests_fire_once() {
        let date = NaiveDate::from_ymd_opt(2025, 6, 14).unwrap();
        let notifier = LogNotifier::new();
        let request = NotificationRequest::for_prayer(
            PrayerName::Maghrib,
            date.and_hms_opt(18, 30, 0).unwrap(),
            SoundPreference::Beep,
        );
        notifier.schedule_at(&request).unwrap();

        assert!(notifier
            .fire_due(date.and_hms_opt(18, 29, 59).unwrap())
            .is_empty());
        let fired = notifier.fire_due(date.and_hms_opt(18, 30, 1).unwrap());
        assert_eq!(fired, vec![request]);
        assert!(notifier.list_scheduled().unwrap().is_empty());
    }
}
