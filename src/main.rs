use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use aircast::{
    api::ApiClient,
    calendar::{ApiCalendar, Calendar, StaticCalendar},
    Config, Engine,
};

// -------------------------------------------------------------------------------------------------

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("AIRCAST_CONFIG").ok())
        .unwrap_or_else(|| "config.json".to_string());
    log::info!("aircast starting with configuration '{}'", config_path);
    let config = Config::load(&config_path);

    // the REST calendar when endpoints are configured, an empty one otherwise
    let calendar: Arc<dyn Calendar> = if config.calendar_program_url.is_empty() {
        log::warn!("no calendar endpoint configured - starting with an empty schedule");
        Arc::new(StaticCalendar::default())
    } else {
        let client = ApiClient::new(
            config.calendar_program_url.clone(),
            config.calendar_playlist_url.clone(),
            config.health_url.clone(),
            config.playlog_url.clone(),
        );
        let mut calendar = ApiCalendar::new(
            client,
            config.audio_playlist_path.clone(),
            config.audio_source_path.clone(),
            config.calendar_refresh_interval,
        );
        calendar.start();
        Arc::new(calendar)
    };

    let mut engine = Engine::new(config, calendar);
    if let Err(err) = engine.start() {
        log::error!("failed to start: {}", err);
        std::process::exit(1);
    }

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = Arc::clone(&running);
        if let Err(err) = ctrlc::set_handler(move || {
            log::info!("shutdown requested");
            running.store(false, Ordering::Relaxed);
        }) {
            log::error!("failed to install signal handler: {}", err);
        }
    }

    while running.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(200));
    }

    engine.stop();
    // dropping the engine releases the calendar, whose worker joins on drop
    drop(engine);
    log::info!("aircast terminated");
}
