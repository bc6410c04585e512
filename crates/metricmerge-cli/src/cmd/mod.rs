pub mod authorize;
pub mod completions;
pub mod merge;
pub mod run;
pub mod stage;

use metricmerge_core::config::{AppConfig, KeyTracking, MergeConfig};

/// Engine settings from config, with per-invocation overrides.
pub fn merge_settings(
    config: &AppConfig,
    chunk_size: Option<usize>,
    rolling: bool,
) -> anyhow::Result<MergeConfig> {
    let mut settings = config.merge_config()?;
    if let Some(size) = chunk_size {
        anyhow::ensure!(size > 0, "--chunk-size must be greater than zero");
        settings.chunk_size = size;
    }
    if rolling {
        settings.key_tracking = KeyTracking::Rolling;
    }
    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_apply_on_top_of_config() {
        let settings = merge_settings(&AppConfig::default(), Some(10), true).expect("valid");
        assert_eq!(settings.chunk_size, 10);
        assert_eq!(settings.key_tracking, KeyTracking::Rolling);
        assert_eq!(settings.delimiter, b';');
    }

    #[test]
    fn zero_chunk_size_is_rejected() {
        assert!(merge_settings(&AppConfig::default(), Some(0), false).is_err());
    }

    #[test]
    fn invalid_delimiter_surfaces() {
        let mut config = AppConfig::default();
        config.csv.delimiter = ";;".into();
        assert!(merge_settings(&config, None, false).is_err());
    }
}
