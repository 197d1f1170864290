pub mod arrival;
pub mod clock;
pub mod config;
pub mod countdown;
pub mod error;
pub mod health;
pub mod notifications;
pub mod prayer;
pub mod resolver;
pub mod scheduler;
pub mod service;
pub mod store;
pub mod timetable;
pub mod tracking;

pub use crate::service::{PrayerService, PrayerServiceBuilder};
