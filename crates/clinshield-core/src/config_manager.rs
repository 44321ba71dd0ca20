use crate::attributes::default_initial_epsilon;
use crate::{
    AttributeKind, CategoricalAttribute, FieldPath, FieldShape, GeneralizationRule, Mechanism,
    NestedCombinationFilter, NumericAttribute, ResourceType, ValueKind, ValueRange,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(String),

    #[error("Failed to read config: {0}")]
    ReadError(String),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// `resourceType -> attributeName -> descriptor`
pub type AttributeTable<T> = BTreeMap<ResourceType, BTreeMap<String, T>>;

/// Main configuration for an anonymization run
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AnonymizerConfig {
    /// Iteration budget, controller constants and seeding
    #[serde(default)]
    pub calibration: CalibrationConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Stage toggles
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Date/decimal attributes calibrated against an RMSE band
    #[serde(default)]
    pub numeric: AttributeTable<NumericAttribute>,

    /// Enumerated attributes calibrated against a TVD band
    #[serde(default)]
    pub categorical: AttributeTable<CategoricalAttribute>,

    /// Date coarsening applied before numeric calibration
    #[serde(default)]
    pub generalization: AttributeTable<GeneralizationRule>,

    /// Reference graph calibration
    #[serde(default)]
    pub graph: GraphConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationConfig {
    /// Iteration cap shared by the numeric and categorical calibrators
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,

    /// Starting epsilon of every categorical attribute
    #[serde(default = "default_initial_epsilon")]
    pub initial_epsilon: f64,

    /// Weight of the previous adjustment in the smoothed update
    #[serde(default = "default_momentum")]
    pub momentum: f64,

    /// Master seed; a fresh one is drawn and logged when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            initial_epsilon: default_initial_epsilon(),
            momentum: default_momentum(),
            seed: None,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: "pretty", "json", "compact"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_true")]
    pub numeric: bool,
    #[serde(default = "default_true")]
    pub categorical: bool,
    #[serde(default = "default_true")]
    pub graph: bool,
    /// Replace every record id with a fresh UUID before writing
    #[serde(default)]
    pub remap_ids: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            numeric: true,
            categorical: true,
            graph: true,
            remap_ids: false,
        }
    }
}

/// Noise and tolerance of one graph metric target
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricSettings {
    pub epsilon: f64,
    pub sensitivity: f64,
    pub tolerance: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphMetricsConfig {
    #[serde(default = "default_degree_centrality")]
    pub degree_centrality: MetricSettings,
    #[serde(default = "default_degree_distribution")]
    pub degree_distribution: MetricSettings,
    #[serde(default = "default_clustering_coefficient")]
    pub clustering_coefficient: MetricSettings,
}

impl Default for GraphMetricsConfig {
    fn default() -> Self {
        Self {
            degree_centrality: default_degree_centrality(),
            degree_distribution: default_degree_distribution(),
            clustering_coefficient: default_clustering_coefficient(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphConfig {
    /// Resource type whose nodes the metrics are measured on
    #[serde(default = "default_primary_type")]
    pub primary_type: String,

    /// Lightweight entities represented by their display name
    #[serde(default = "default_display_types")]
    pub display_types: Vec<String>,

    /// Records per type scanned when deriving the schema graph
    #[serde(default = "default_schema_sample_size")]
    pub schema_sample_size: usize,

    /// Hard cap on calibration rounds
    #[serde(default = "default_max_rounds")]
    pub max_rounds: usize,

    /// Upper bound on edits in one clustering round
    #[serde(default = "default_max_clustering_batch")]
    pub max_clustering_batch: usize,

    /// Drop nodes left without edges after calibration
    #[serde(default = "default_true")]
    pub remove_isolated: bool,

    #[serde(default)]
    pub metrics: GraphMetricsConfig,

    /// Explicit `type -> {referenced type -> label}`; derived when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<BTreeMap<String, BTreeMap<String, String>>>,

    /// Explicit dummy record shapes; derived when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_shapes: Option<BTreeMap<String, FieldShape>>,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            primary_type: default_primary_type(),
            display_types: default_display_types(),
            schema_sample_size: default_schema_sample_size(),
            max_rounds: default_max_rounds(),
            max_clustering_batch: default_max_clustering_batch(),
            remove_isolated: true,
            metrics: GraphMetricsConfig::default(),
            schema: None,
            node_shapes: None,
        }
    }
}

// Default value functions
fn default_max_iterations() -> usize {
    1000
}
fn default_momentum() -> f64 {
    0.9
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "pretty".to_string()
}
fn default_true() -> bool {
    true
}
fn default_primary_type() -> String {
    "Patient".to_string()
}
fn default_display_types() -> Vec<String> {
    vec![
        "Practitioner".to_string(),
        "Organization".to_string(),
        "Location".to_string(),
    ]
}
fn default_schema_sample_size() -> usize {
    10
}
fn default_max_rounds() -> usize {
    10_000
}
fn default_max_clustering_batch() -> usize {
    5_000
}
fn default_degree_centrality() -> MetricSettings {
    MetricSettings {
        epsilon: 0.1,
        sensitivity: 1.0,
        tolerance: 100.1,
    }
}
fn default_degree_distribution() -> MetricSettings {
    MetricSettings {
        epsilon: 0.1,
        sensitivity: 100.0,
        tolerance: 10_000.0,
    }
}
fn default_clustering_coefficient() -> MetricSettings {
    MetricSettings {
        epsilon: 0.1,
        sensitivity: 1.0,
        tolerance: 0.0002,
    }
}

type RawTable = BTreeMap<String, BTreeMap<String, toml::Value>>;

/// File layout before attribute entries are checked one by one.
#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    calibration: CalibrationConfig,
    #[serde(default)]
    logging: LoggingConfig,
    #[serde(default)]
    pipeline: PipelineConfig,
    #[serde(default)]
    numeric: RawTable,
    #[serde(default)]
    categorical: RawTable,
    #[serde(default)]
    generalization: RawTable,
    #[serde(default)]
    graph: GraphConfig,
}

impl AnonymizerConfig {
    /// Parses a TOML document. Attribute entries that are malformed are
    /// logged and dropped without affecting their siblings.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig =
            toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        let numeric = resolve_table("numeric", raw.numeric, |name, attr: &NumericAttribute| {
            check_numeric(name, attr)
        });
        let categorical = resolve_table(
            "categorical",
            raw.categorical,
            |_, attr: &CategoricalAttribute| check_categorical(attr),
        );
        let generalization =
            resolve_table("generalization", raw.generalization, |_, _: &GeneralizationRule| {
                Ok(())
            });

        Ok(Self {
            calibration: raw.calibration,
            logging: raw.logging,
            pipeline: raw.pipeline,
            numeric,
            categorical,
            generalization,
            graph: raw.graph,
        })
    }

    /// Sample configuration for a FHIR-style corpus.
    pub fn example() -> Self {
        let mut config = Self::default();
        if let Err(e) = config.add_example_attributes() {
            warn!("Example configuration incomplete: {}", e);
        }
        config
    }

    fn add_example_attributes(&mut self) -> crate::Result<()> {
        let path = |p: &str| p.parse::<FieldPath>();
        let range = |min, max| ValueRange { min, max };

        self.numeric.entry("Patient".into()).or_default().insert(
            "birthDate".into(),
            NumericAttribute {
                path: path(".//birthDate")?,
                mechanism: Mechanism::Laplace,
                value: Some(ValueKind::Date),
                rmse_range: range(30.0, 365.0),
                epsilon: 0.5,
                sensitivity: 1.0,
                delta: 1e-5,
            },
        );
        self.numeric.entry("Observation".into()).or_default().insert(
            "valueDecimal".into(),
            NumericAttribute {
                path: path(".//valueQuantity/value")?,
                mechanism: Mechanism::Gaussian,
                value: Some(ValueKind::Decimal),
                rmse_range: range(0.5, 5.0),
                epsilon: 0.5,
                sensitivity: 1.0,
                delta: 1e-5,
            },
        );
        let patient = self.categorical.entry("Patient".into()).or_default();
        patient.insert(
            "gender".into(),
            CategoricalAttribute {
                kind: AttributeKind::Simple {
                    path: path(".//gender")?,
                },
                tvd_range: range(0.1, 0.4),
            },
        );
        patient.insert(
            "maritalStatus".into(),
            CategoricalAttribute {
                kind: AttributeKind::Combination {
                    paths: vec![
                        path(".//maritalStatus/coding/item/code")?,
                        path(".//maritalStatus/coding/item/display")?,
                    ],
                },
                tvd_range: range(0.05, 0.3),
            },
        );
        patient.insert(
            "race".into(),
            CategoricalAttribute {
                kind: AttributeKind::NestedCombination {
                    path: path(".//extension/item")?,
                    filter: NestedCombinationFilter {
                        url: "http://hl7.org/fhir/us/core/StructureDefinition/us-core-race"
                            .into(),
                        value_paths: vec![
                            path(".//valueCoding/code")?,
                            path(".//valueCoding/display")?,
                        ],
                    },
                },
                tvd_range: range(0.05, 0.3),
            },
        );
        Ok(())
    }
}

fn resolve_table<T, F>(section: &str, raw: RawTable, check: F) -> AttributeTable<T>
where
    T: DeserializeOwned,
    F: Fn(&str, &T) -> Result<(), String>,
{
    let mut table = AttributeTable::new();
    for (resource, attributes) in raw {
        let entries = table.entry(resource.clone()).or_insert_with(BTreeMap::new);
        for (name, value) in attributes {
            let parsed = value
                .try_into::<T>()
                .map_err(|e| e.to_string())
                .and_then(|attr| check(&name, &attr).map(|_| attr));
            match parsed {
                Ok(attr) => {
                    entries.insert(name, attr);
                }
                Err(reason) => warn!(
                    section,
                    resource = %resource,
                    attribute = %name,
                    "Dropping attribute: {}",
                    reason
                ),
            }
        }
    }
    table.retain(|_, attributes| !attributes.is_empty());
    table
}

fn check_numeric(name: &str, attr: &NumericAttribute) -> Result<(), String> {
    if attr.value_kind(name).is_none() {
        return Err("value kind is neither given nor inferable from the name".to_string());
    }
    if attr.epsilon <= 0.0 || attr.sensitivity <= 0.0 {
        return Err("epsilon and sensitivity must be positive".to_string());
    }
    if attr.mechanism == Mechanism::Gaussian && !(attr.delta > 0.0 && attr.delta < 1.0) {
        return Err("delta must lie in (0, 1)".to_string());
    }
    Ok(())
}

fn check_categorical(attr: &CategoricalAttribute) -> Result<(), String> {
    if attr.kind.arity() == 0 {
        return Err(format!("{} attribute without value paths", attr.kind.name()));
    }
    Ok(())
}

/// Configuration manager with file discovery, env overrides and validation
pub struct ConfigManager {
    config: AnonymizerConfig,
    config_path: Option<PathBuf>,
}

impl ConfigManager {
    /// Load configuration with the following precedence:
    /// 1. Environment variables (.env file)
    /// 2. Config file (explicit path, .clinshield.toml, ~/.clinshield/config.toml)
    /// 3. Defaults
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        info!("Loading ClinShield configuration");

        Self::load_dotenv();

        let (config, config_path) = Self::load_config_file(explicit)?;
        let config = Self::apply_env_overrides(config);
        Self::validate_config(&config)?;

        match config_path {
            Some(ref path) => info!(path = %path.display(), "Configuration loaded"),
            None => info!("Configuration loaded (defaults, no file)"),
        }
        info!(
            numeric = config.numeric.values().map(BTreeMap::len).sum::<usize>(),
            categorical = config.categorical.values().map(BTreeMap::len).sum::<usize>(),
            max_iterations = config.calibration.max_iterations,
            "Protected attributes"
        );

        Ok(Self {
            config,
            config_path,
        })
    }

    /// Load .env file if it exists
    fn load_dotenv() {
        if Path::new(".env").exists() {
            if let Err(e) = dotenv::from_filename(".env") {
                warn!("Failed to load .env file: {}", e);
            }
        }
    }

    /// Find and load config file
    /// Search order:
    /// 1. explicit path (must exist)
    /// 2. ./.clinshield.toml (current directory)
    /// 3. ~/.clinshield/config.toml (user config)
    /// 4. Use defaults
    fn load_config_file(
        explicit: Option<&Path>,
    ) -> Result<(AnonymizerConfig, Option<PathBuf>), ConfigError> {
        if let Some(path) = explicit {
            if !path.exists() {
                return Err(ConfigError::NotFound(path.display().to_string()));
            }
            let config = Self::read_toml_file(path)?;
            return Ok((config, Some(path.to_path_buf())));
        }

        let local_config = Path::new(".clinshield.toml");
        if local_config.exists() {
            let config = Self::read_toml_file(local_config)?;
            return Ok((config, Some(local_config.to_path_buf())));
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".clinshield").join("config.toml");
            if user_config.exists() {
                let config = Self::read_toml_file(&user_config)?;
                return Ok((config, Some(user_config)));
            }
        }

        info!("No config file found, using defaults");
        Ok((AnonymizerConfig::default(), None))
    }

    /// Read TOML config file
    fn read_toml_file(path: &Path) -> Result<AnonymizerConfig, ConfigError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError(e.to_string()))?;
        AnonymizerConfig::from_toml_str(&content)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(mut config: AnonymizerConfig) -> AnonymizerConfig {
        if let Ok(seed) = std::env::var("CLINSHIELD_SEED") {
            if let Ok(seed) = seed.parse() {
                config.calibration.seed = Some(seed);
            }
        }
        if let Ok(max) = std::env::var("CLINSHIELD_MAX_ITERATIONS") {
            if let Ok(max) = max.parse() {
                config.calibration.max_iterations = max;
            }
        }
        if let Ok(rounds) = std::env::var("CLINSHIELD_GRAPH_MAX_ROUNDS") {
            if let Ok(rounds) = rounds.parse() {
                config.graph.max_rounds = rounds;
            }
        }

        // Directive strings such as "clinshield=debug" are left to the EnvFilter
        if let Ok(level) = std::env::var("RUST_LOG") {
            if is_log_level(&level) {
                config.logging.level = level;
            }
        }

        config
    }

    /// Validate configuration
    pub fn validate_config(config: &AnonymizerConfig) -> Result<(), ConfigError> {
        if !is_log_level(&config.logging.level) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log level: {}. Must be one of: trace, debug, info, warn, error",
                config.logging.level
            )));
        }

        match config.logging.format.as_str() {
            "pretty" | "json" | "compact" => {}
            other => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log format: {}. Must be one of: pretty, json, compact",
                    other
                )))
            }
        }

        let calibration = &config.calibration;
        if calibration.max_iterations == 0 {
            return Err(ConfigError::ValidationError(
                "calibration.max_iterations must be at least 1".to_string(),
            ));
        }
        if calibration.initial_epsilon <= 0.0 {
            return Err(ConfigError::ValidationError(
                "calibration.initial_epsilon must be positive".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&calibration.momentum) {
            return Err(ConfigError::ValidationError(
                "calibration.momentum must lie in [0, 1)".to_string(),
            ));
        }

        let graph = &config.graph;
        if graph.primary_type.is_empty() {
            return Err(ConfigError::ValidationError(
                "graph.primary_type must not be empty".to_string(),
            ));
        }
        if graph.max_rounds == 0 || graph.max_clustering_batch == 0 {
            return Err(ConfigError::ValidationError(
                "graph.max_rounds and graph.max_clustering_batch must be at least 1".to_string(),
            ));
        }
        for (name, settings) in [
            ("degree_centrality", &graph.metrics.degree_centrality),
            ("degree_distribution", &graph.metrics.degree_distribution),
            ("clustering_coefficient", &graph.metrics.clustering_coefficient),
        ] {
            if settings.epsilon <= 0.0 || settings.sensitivity < 0.0 || settings.tolerance < 0.0 {
                return Err(ConfigError::ValidationError(format!(
                    "graph.metrics.{}: epsilon must be positive, sensitivity and tolerance non-negative",
                    name
                )));
            }
        }

        Ok(())
    }

    /// Get the loaded configuration
    pub fn config(&self) -> &AnonymizerConfig {
        &self.config
    }

    pub fn into_config(self) -> AnonymizerConfig {
        self.config
    }

    /// Get the path to the config file that was loaded, if any
    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    /// Create a config file populated with the example attributes
    pub fn create_default_config(path: &Path) -> Result<(), ConfigError> {
        let config = AnonymizerConfig::example();
        let toml_str =
            toml::to_string_pretty(&config).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        // Create parent directory if needed
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::ReadError(e.to_string()))?;
        }

        std::fs::write(path, toml_str).map_err(|e| ConfigError::ReadError(e.to_string()))?;

        Ok(())
    }
}

fn is_log_level(level: &str) -> bool {
    matches!(level, "trace" | "debug" | "info" | "warn" | "error")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AnonymizerConfig::default();
        assert_eq!(config.calibration.max_iterations, 1000);
        assert_eq!(config.graph.primary_type, "Patient");
        assert_eq!(config.graph.metrics.clustering_coefficient.tolerance, 0.0002);
        assert_eq!(config.graph.metrics.degree_distribution.sensitivity, 100.0);
        assert!(!config.pipeline.remap_ids);
    }

    #[test]
    fn test_config_validation() {
        let config = AnonymizerConfig::default();
        assert!(ConfigManager::validate_config(&config).is_ok());

        let mut bad_config = config.clone();
        bad_config.logging.level = "loud".to_string();
        assert!(ConfigManager::validate_config(&bad_config).is_err());

        let mut bad_config = config;
        bad_config.calibration.momentum = 1.0;
        assert!(ConfigManager::validate_config(&bad_config).is_err());
    }

    #[test]
    fn test_malformed_attribute_is_dropped_alone() {
        let config = AnonymizerConfig::from_toml_str(
            r#"
            [categorical.Patient.gender]
            kind = "simple"
            path = ".//gender"
            tvd_range = [0.1, 0.4]

            [categorical.Patient.race]
            kind = "hologram"
            path = ".//race"
            tvd_range = [0.1, 0.4]

            [numeric.Patient.weight]
            path = ".//weight"
            rmse_range = [1.0, 2.0]
            "#,
        )
        .unwrap();
        let patient = &config.categorical["Patient"];
        assert!(patient.contains_key("gender"));
        assert!(!patient.contains_key("race"));
        // no value kind can be inferred from "weight"
        assert!(config.numeric.is_empty());
    }

    #[test]
    fn test_example_round_trips_through_toml() {
        let example = AnonymizerConfig::example();
        let text = toml::to_string_pretty(&example).unwrap();
        let parsed = AnonymizerConfig::from_toml_str(&text).unwrap();
        assert_eq!(parsed.categorical["Patient"].len(), 3);
        assert_eq!(parsed.numeric["Observation"]["valueDecimal"].mechanism, Mechanism::Gaussian);
        assert!(ConfigManager::validate_config(&parsed).is_ok());
    }
}
