use crate::config::RedisSettings;
use log::{info, LevelFilter};
use url::Url;

pub fn parse_level(level: &str) -> LevelFilter {
    level.trim().parse().unwrap_or(LevelFilter::Info)
}

pub fn setup_logging(level: &str) -> Result<(), fern::InitError> {
    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{}][{}] {}",
                record.level(),
                record.target(),
                message
            ))
        })
        .level(parse_level(level))
        .level_for("redis", LevelFilter::Warn)
        .level_for("reqwest", LevelFilter::Warn)
        .level_for("hyper", LevelFilter::Warn)
        .chain(std::io::stdout())
        .apply()?;
    info!("Logging initialized.");
    Ok(())
}

/// Builds a `redis://` connection URL, escaping the password.
pub fn redis_url(settings: &RedisSettings) -> Result<String, url::ParseError> {
    let mut url = Url::parse(&format!(
        "redis://{}:{}/{}",
        settings.host, settings.port, settings.db
    ))?;
    if let Some(password) = &settings.password {
        // Only fails for cannot-be-a-base URLs, which redis:// never is.
        let _ = url.set_password(Some(password));
    }
    Ok(url.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redis_url_without_password() {
        let settings = RedisSettings::default();
        assert_eq!(redis_url(&settings).unwrap(), "redis://localhost:6379/0");
    }

    #[test]
    fn test_redis_url_escapes_password() {
        let settings = RedisSettings {
            host: "cache.internal".to_string(),
            port: 6380,
            db: 3,
            password: Some("p@ss:word".to_string()),
            connect_timeout_ms: 100,
        };
        let url = redis_url(&settings).unwrap();
        assert_eq!(url, "redis://:p%40ss%3Aword@cache.internal:6380/3");
    }

    #[test]
    fn test_parse_level_falls_back_to_info() {
        assert_eq!(parse_level("debug"), LevelFilter::Debug);
        assert_eq!(parse_level("nonsense"), LevelFilter::Info);
    }
}
