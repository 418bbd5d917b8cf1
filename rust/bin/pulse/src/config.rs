//! Config file location and layering for the CLI.

use std::path::{Path, PathBuf};

use pulse_core::ClientConfig;
use tracing::debug;

/// Default config file path: ~/.pulse/config.toml.
pub fn default_path() -> PathBuf {
    dirs_path().join("config.toml")
}

/// Defaults, then the file, then `PULSE_*` variables, then `--set` pairs.
pub fn resolve(path: &Path, overrides: &[String]) -> anyhow::Result<ClientConfig> {
    let args = override_args(overrides)?;
    let config = ClientConfig::load(path)?.with_env().with_args(&args);
    debug!(path = %path.display(), overrides = args.len(), "config resolved");
    Ok(config)
}

/// `key=value` pairs as `--key=value` arguments.
fn override_args(overrides: &[String]) -> anyhow::Result<Vec<String>> {
    overrides
        .iter()
        .map(|pair| match pair.split_once('=') {
            Some((key, value)) if !key.is_empty() => Ok(format!("--{}={}", key, value)),
            _ => Err(anyhow::anyhow!("Expected KEY=VALUE, got '{}'", pair)),
        })
        .collect()
}

fn dirs_path() -> PathBuf {
    let home = std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".pulse")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_become_arguments() {
        let args = override_args(&["feed-page-size=5".into(), "ai-model=x=y".into()]).unwrap();
        assert_eq!(args, vec!["--feed-page-size=5", "--ai-model=x=y"]);
    }

    #[test]
    fn malformed_override_is_rejected() {
        assert!(override_args(&["nokey".into()]).is_err());
        assert!(override_args(&["=v".into()]).is_err());
    }

    #[test]
    fn missing_file_layers_overrides_on_defaults() {
        let config = resolve(Path::new("/nonexistent/pulse.toml"), &["feed-page-size=7".into()]).unwrap();
        assert_eq!(config.feed_page_size, 7);
        assert_eq!(config.media_bucket, "media");
    }
}
