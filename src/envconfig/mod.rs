use crate::core::OverflowPolicy;
use std::env;
use std::path::{Path, PathBuf};

const DEFAULT_MODELS_DIR: &str = "~/.llambo/models";
const DEFAULT_LOG_FILTER: &str = "info";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvConfig {
    pub models_dir: PathBuf,
    pub overflow: OverflowPolicy,
    pub log_filter: String,
}

impl EnvConfig {
    pub fn from_env() -> Self {
        let overflow = match env::var("LLAMBO_OUTPUT_OVERFLOW") {
            Ok(value) => value.parse().unwrap_or_else(|_| {
                tracing::warn!(
                    "Ignoring LLAMBO_OUTPUT_OVERFLOW={:?}, expected `stop` or `truncate`",
                    value
                );
                OverflowPolicy::default()
            }),
            Err(_) => OverflowPolicy::default(),
        };

        Self {
            models_dir: models_dir(),
            overflow,
            log_filter: log_filter(),
        }
    }

    /// Absolute paths pass through; relative ones are looked up in the models
    /// directory when a file exists there.
    pub fn resolve_model_path(&self, path: &str) -> PathBuf {
        let candidate = Path::new(path);
        if candidate.is_absolute() || candidate.exists() {
            return candidate.to_path_buf();
        }

        let in_models_dir = self.models_dir.join(candidate);
        if in_models_dir.exists() {
            in_models_dir
        } else {
            candidate.to_path_buf()
        }
    }
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

pub fn models_dir() -> PathBuf {
    let path = env::var("LLAMBO_MODELS").unwrap_or_else(|_| DEFAULT_MODELS_DIR.to_string());
    expand_home(&path)
}

pub fn log_filter() -> String {
    env::var("LLAMBO_LOG").unwrap_or_else(|_| DEFAULT_LOG_FILTER.to_string())
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Installs the stderr fmt subscriber. Safe to call more than once.
pub fn init_tracing(filter: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(models_dir: PathBuf) -> EnvConfig {
        EnvConfig {
            models_dir,
            overflow: OverflowPolicy::Stop,
            log_filter: "info".to_string(),
        }
    }

    #[test]
    fn test_expand_home() {
        assert_eq!(expand_home("/srv/models"), PathBuf::from("/srv/models"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_home("~/models"), home.join("models"));
        }
    }

    #[test]
    fn test_resolve_relative_path_in_models_dir() {
        let dir = env::temp_dir().join(format!("llambo-envconfig-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("tiny.gguf"), b"GGUF").unwrap();

        let config = config(dir.clone());
        assert_eq!(config.resolve_model_path("tiny.gguf"), dir.join("tiny.gguf"));
        assert_eq!(config.resolve_model_path("missing.gguf"), PathBuf::from("missing.gguf"));
        assert_eq!(config.resolve_model_path("/abs/x.gguf"), PathBuf::from("/abs/x.gguf"));

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
