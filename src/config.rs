use std::num::NonZeroU32;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::models::PollPolicy;

const DEFAULT_OPENAI_URL: &str = "https://api.openai.com/v1/chat/completions";
const DEFAULT_OPENAI_MODEL: &str = "gpt-3.5-turbo";
const DEFAULT_STABILITY_URL: &str = "https://api.stability.ai";

/// Runtime settings, read once at startup and handed to every component.
///
/// Clients never look at the process environment themselves; credentials
/// travel through this struct so tests can build clients with stub keys.
#[derive(Debug, Clone)]
pub struct Config {
    pub openai_api_key: String,
    pub stability_api_key: String,
    pub openai_url: String,
    pub openai_model: String,
    pub stability_url: String,
    pub bind_addr: String,
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    pub poll: PollPolicy,
    pub concurrency: usize,
    pub stability_rpm: Option<NonZeroU32>,
    pub min_chapter_chars: usize,
    pub summary_max_chars: usize,
    pub image_size: u32,
    pub ffmpeg: PathBuf,
    /// How long finished web jobs stay queryable.
    pub job_ttl: Duration,
}

impl Config {
    /// Load `.env` (if present) and read the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        if let Err(e) = dotenvy::dotenv() {
            if !e.not_found() {
                tracing::warn!("Ignoring unreadable .env file: {}", e);
            }
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let openai_api_key =
            get("OPENAI_API_KEY").ok_or(ConfigError::MissingCredential("OPENAI_API_KEY"))?;
        let stability_api_key =
            get("STABILITY_API_KEY").ok_or(ConfigError::MissingCredential("STABILITY_API_KEY"))?;

        let poll = PollPolicy::new(
            parse_or(&get, "MOVIEFY_POLL_ATTEMPTS", 6u32)?,
            Duration::from_secs(parse_or(&get, "MOVIEFY_POLL_INTERVAL_SECS", 10u64)?),
        );

        let concurrency: usize = parse_or(&get, "MOVIEFY_CONCURRENCY", 1)?;
        if concurrency == 0 {
            return Err(ConfigError::Invalid {
                key: "MOVIEFY_CONCURRENCY",
                value: "0".to_string(),
            });
        }

        let stability_rpm = match get("MOVIEFY_STABILITY_RPM") {
            Some(raw) => Some(raw.trim().parse::<NonZeroU32>().map_err(|_| {
                ConfigError::Invalid {
                    key: "MOVIEFY_STABILITY_RPM",
                    value: raw.clone(),
                }
            })?),
            None => None,
        };

        Ok(Config {
            openai_api_key,
            stability_api_key,
            openai_url: get("MOVIEFY_OPENAI_URL").unwrap_or_else(|| DEFAULT_OPENAI_URL.to_string()),
            openai_model: get("MOVIEFY_OPENAI_MODEL")
                .unwrap_or_else(|| DEFAULT_OPENAI_MODEL.to_string()),
            stability_url: get("MOVIEFY_STABILITY_URL")
                .unwrap_or_else(|| DEFAULT_STABILITY_URL.to_string()),
            bind_addr: get("MOVIEFY_BIND_ADDR").unwrap_or_else(|| "0.0.0.0:3000".to_string()),
            input_dir: get("MOVIEFY_INPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("input_book")),
            output_dir: get("MOVIEFY_OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("output_image_video")),
            poll,
            concurrency,
            stability_rpm,
            min_chapter_chars: parse_or(&get, "MOVIEFY_MIN_CHAPTER_CHARS", 1000)?,
            summary_max_chars: parse_or(&get, "MOVIEFY_SUMMARY_MAX_CHARS", 200)?,
            image_size: parse_or(&get, "MOVIEFY_IMAGE_SIZE", 768)?,
            ffmpeg: get("MOVIEFY_FFMPEG")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("ffmpeg")),
            job_ttl: Duration::from_secs(parse_or(&get, "MOVIEFY_JOB_TTL_SECS", 3600u64)?),
        })
    }
}

fn parse_or<T, G>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid { key, value: raw }),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    const KEYS: [(&str, &str); 2] = [("OPENAI_API_KEY", "sk-test"), ("STABILITY_API_KEY", "sk-stab")];

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&KEYS)).unwrap();
        assert_eq!(config.openai_api_key, "sk-test");
        assert_eq!(config.stability_api_key, "sk-stab");
        assert_eq!(config.poll.max_attempts, 6);
        assert_eq!(config.poll.interval, Duration::from_secs(10));
        assert_eq!(config.concurrency, 1);
        assert_eq!(config.min_chapter_chars, 1000);
        assert_eq!(config.summary_max_chars, 200);
        assert_eq!(config.image_size, 768);
        assert!(config.stability_rpm.is_none());
        assert_eq!(config.output_dir, PathBuf::from("output_image_video"));
        assert_eq!(config.job_ttl, Duration::from_secs(3600));
    }

    #[test]
    fn test_missing_openai_key_is_fatal() {
        let err = Config::from_lookup(lookup(&[("STABILITY_API_KEY", "x")])).unwrap_err();
        assert!(matches!(err, ConfigError::MissingCredential("OPENAI_API_KEY")));
    }

    #[test]
    fn test_blank_stability_key_counts_as_missing() {
        let err = Config::from_lookup(lookup(&[("OPENAI_API_KEY", "x"), ("STABILITY_API_KEY", "  ")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::MissingCredential("STABILITY_API_KEY")));
    }

    #[test]
    fn test_overrides() {
        let mut pairs = KEYS.to_vec();
        pairs.extend([
            ("MOVIEFY_POLL_ATTEMPTS", "12"),
            ("MOVIEFY_POLL_INTERVAL_SECS", "30"),
            ("MOVIEFY_CONCURRENCY", "3"),
            ("MOVIEFY_STABILITY_RPM", "150"),
        ]);
        let config = Config::from_lookup(lookup(&pairs)).unwrap();
        assert_eq!(config.poll.max_attempts, 12);
        assert_eq!(config.poll.interval, Duration::from_secs(30));
        assert_eq!(config.concurrency, 3);
        assert_eq!(config.stability_rpm.map(NonZeroU32::get), Some(150));
    }

    #[test]
    fn test_invalid_number_is_rejected() {
        let mut pairs = KEYS.to_vec();
        pairs.push(("MOVIEFY_POLL_ATTEMPTS", "six"));
        let err = Config::from_lookup(lookup(&pairs)).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "MOVIEFY_POLL_ATTEMPTS", .. }));
    }

    #[test]
    fn test_zero_concurrency_is_rejected() {
        let mut pairs = KEYS.to_vec();
        pairs.push(("MOVIEFY_CONCURRENCY", "0"));
        assert!(Config::from_lookup(lookup(&pairs)).is_err());
    }
}
