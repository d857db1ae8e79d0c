use std::{
    env,
    fmt::Debug,
    str::FromStr,
};

use tracing_subscriber::EnvFilter;

/// Reads a typed knob from the environment, falling back to `default` when the
/// variable is unset or does not parse.
pub fn env_config<T: Debug + FromStr>(name: &str, default: T) -> T
where
    <T as FromStr>::Err: Debug,
{
    let raw = match env::var(name) {
        Ok(raw) => raw,
        Err(env::VarError::NotPresent) => return default,
        Err(env::VarError::NotUnicode(..)) => {
            tracing::warn!("Invalid value for {name}, falling back to {default:?}.");
            return default;
        },
    };
    match raw.trim().parse::<T>() {
        Ok(value) => {
            tracing::info!("Overriding {name} to {value:?} from environment");
            value
        },
        Err(e) => {
            tracing::warn!("Invalid value {raw} for {name}, falling back to {default:?}: {e:?}");
            default
        },
    }
}

/// Like [`env_config`] for booleans, but also accepts the spellings operators
/// tend to type into deployment manifests (`1`, `yes`, `on`, ...).
pub fn env_flag(name: &str, default: bool) -> bool {
    let Ok(raw) = env::var(name) else {
        return default;
    };
    match parse_flag(&raw) {
        Some(value) => {
            tracing::info!("Overriding {name} to {value} from environment");
            value
        },
        None => {
            tracing::warn!("Invalid flag {raw} for {name}, falling back to {default}");
            default
        },
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "t" | "yes" | "y" | "on" => Some(true),
        "0" | "false" | "f" | "no" | "n" | "off" | "" => Some(false),
        _ => None,
    }
}

pub fn config_test() {
    // Many test helpers call this, so a second initialization failing is fine.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .compact()
        .try_init();
}
