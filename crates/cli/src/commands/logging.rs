// Shared `tracing_subscriber` initialization, matching `relay::main`'s
// shape: `EnvFilter` seeded from `RUST_LOG` if set, else the config's
// `log_filter`; JSON output when `TASKKIT_LOG_FORMAT=json` (production
// mode behind a log shipper), human-readable otherwise (the default,
// suited to a foreground/dev run).

const LOG_FORMAT_ENV: &str = "TASKKIT_LOG_FORMAT";

pub fn init(log_filter: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_filter));

    if std::env::var(LOG_FORMAT_ENV).as_deref() == Ok("json") {
        tracing_subscriber::fmt().json().flatten_event(true).with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
