use crate::error::Error;
use config::{Config, Environment, File as ConfigFile};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub thresholds: Thresholds,
    pub checks: Checks,
    pub engine: EngineSettings,
    pub repair: RepairSettings,
}

/// How ghost rows are recognised.
///
/// `Slack` flags a sheet when the used range holds more rows than its
/// non-blank cell count plus a fixed slack. `Ratio` flags a sheet whose last
/// data row lies beyond `phantom_ratio_min_rows` while the used range counts
/// fewer than half that many rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PhantomPolicy {
    Slack,
    Ratio,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    pub phantom_policy: PhantomPolicy,
    pub phantom_slack_rows: u64,
    pub phantom_ratio_min_rows: u64,
    pub row_bloat_rows: u64,
    pub column_bloat_columns: u64,
    pub shape_count: u64,
    pub heavy_formula_count: u64,
    pub large_file_mb: f64,
    pub slow_load_secs: f64,
    pub slow_calc_secs: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            phantom_policy: PhantomPolicy::Slack,
            phantom_slack_rows: 5000,
            phantom_ratio_min_rows: 5000,
            row_bloat_rows: 10_000,
            column_bloat_columns: 50,
            shape_count: 10,
            heavy_formula_count: 5000,
            large_file_mb: 20.0,
            slow_load_secs: 5.0,
            slow_calc_secs: 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Checks {
    pub legacy_format: bool,
    pub full_column_refs: bool,
    pub measure_calculation: bool,
}

impl Default for Checks {
    fn default() -> Self {
        Self {
            legacy_format: true,
            full_column_refs: true,
            measure_calculation: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub reset_before_batch: bool,
    pub stale_process_names: Vec<String>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            reset_before_batch: false,
            stale_process_names: vec!["EXCEL.EXE".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RepairSettings {
    pub output_suffix: String,
}

impl Default for RepairSettings {
    fn default() -> Self {
        Self {
            output_suffix: "_OPTIMIZED".to_string(),
        }
    }
}

/// Loads `Auditor.toml` (optional) and `AUDITOR__*` environment overrides,
/// e.g. `AUDITOR__THRESHOLDS__SLOW_LOAD_SECS=2.5`.
pub fn load_configuration() -> Result<AppConfig, Error> {
    let builder = Config::builder()
        .add_source(ConfigFile::with_name("Auditor").required(false))
        .add_source(Environment::with_prefix("AUDITOR").separator("__"))
        .build()?;
    settings(builder)
}

fn settings(source: Config) -> Result<AppConfig, Error> {
    Ok(source.try_deserialize::<AppConfig>()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::FileFormat;

    fn from_toml(text: &str) -> AppConfig {
        Config::builder()
            .add_source(ConfigFile::from_str(text, FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize::<AppConfig>()
            .unwrap()
    }

    #[test]
    fn test_empty_source_yields_defaults() {
        let config = from_toml("");
        assert_eq!(config.thresholds.phantom_policy, PhantomPolicy::Slack);
        assert_eq!(config.thresholds.phantom_slack_rows, 5000);
        assert_eq!(config.thresholds.row_bloat_rows, 10_000);
        assert_eq!(config.thresholds.column_bloat_columns, 50);
        assert!(config.checks.legacy_format);
        assert!(config.checks.full_column_refs);
        assert_eq!(config.thresholds.heavy_formula_count, 5000);
        assert_eq!(config.thresholds.large_file_mb, 20.0);
        assert_eq!(config.repair.output_suffix, "_OPTIMIZED");
        assert_eq!(config.engine.stale_process_names, vec!["EXCEL.EXE"]);
    }

    #[test]
    fn test_bad_value_is_a_config_error() {
        let source = Config::builder()
            .add_source(ConfigFile::from_str("[thresholds]\nrow_bloat_rows = \"many\"", FileFormat::Toml))
            .build()
            .unwrap();
        assert!(matches!(settings(source), Err(Error::Config(_))));
    }

    #[test]
    fn test_partial_override_keeps_other_defaults() {
        let config = from_toml(
            r#"
            [thresholds]
            phantom_policy = "ratio"
            slow_load_secs = 2.5

            [repair]
            output_suffix = "_FIXED"
            "#,
        );
        assert_eq!(config.thresholds.phantom_policy, PhantomPolicy::Ratio);
        assert_eq!(config.thresholds.slow_load_secs, 2.5);
        assert_eq!(config.thresholds.slow_calc_secs, 1.0);
        assert_eq!(config.repair.output_suffix, "_FIXED");
    }
}
