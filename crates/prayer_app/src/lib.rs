pub mod app;
pub mod notifier;
