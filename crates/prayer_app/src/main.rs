use prayer_app::app::{run, AppConfig};

fn main() {
    tracing_subscriber::fmt::init();
    let config = match AppConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(%err, "invalid configuration, using defaults");
            AppConfig::default()
        }
    };
    if let Err(err) = run(config) {
        eprintln!("Failed to start prayer host: {err:#}");
        std::process::exit(1);
    }
}
