//! JSON configuration for both services.
//!
//! Baked-in defaults are merged with an operator `config.json` (top-level
//! keys override). The config path can be overridden per service through
//! `EXPO_CONFIG_PATH` / `AFFICHE_CONFIG_PATH`.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::info;

pub const EXPO_CONFIG_PATH_VAR: &str = "EXPO_CONFIG_PATH";
pub const AFFICHE_CONFIG_PATH_VAR: &str = "AFFICHE_CONFIG_PATH";

/// Merge the operator config file (if any) over the baked-in defaults.
fn load_merged(
    mut defaults: JsonValue,
    env_var: &str,
    explicit_path: Option<&Path>,
) -> Result<JsonValue> {
    let path: PathBuf = match explicit_path {
        Some(path) => path.to_path_buf(),
        None => std::env::var(env_var)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config.json")),
    };

    if path.exists() {
        info!("Loading configuration from {:?}", path);
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read config file {:?}", path))?;
        let overrides: JsonValue = serde_json::from_str(&text)
            .with_context(|| format!("invalid JSON in config file {:?}", path))?;
        let Some(overrides) = overrides.as_object() else {
            bail!("config file {:?} must hold a JSON object", path);
        };
        let merged = defaults
            .as_object_mut()
            .expect("defaults are always an object");
        for (key, value) in overrides {
            merged.insert(key.clone(), value.clone());
        }
    }
    Ok(defaults)
}

// =============================================================================
// Curator (expo)
// =============================================================================

#[derive(Debug, Clone, Deserialize)]
struct ExpoFileConfig {
    #[serde(rename = "DB_PATH")]
    db_path: String,
    #[serde(rename = "POST_COMMANDS")]
    post_commands: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct ExpoConfig {
    pub db_path: PathBuf,
    pub post_commands: BTreeMap<String, Vec<String>>,
}

impl ExpoConfig {
    fn defaults() -> JsonValue {
        json!({
            "DB_PATH": "photos.db",
            "POST_COMMANDS": {},
        })
    }

    pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
        let merged = load_merged(Self::defaults(), EXPO_CONFIG_PATH_VAR, explicit_path)?;
        let file: ExpoFileConfig =
            serde_json::from_value(merged).context("invalid curator configuration")?;
        Ok(Self {
            db_path: PathBuf::from(file.db_path),
            post_commands: file.post_commands,
        })
    }
}

// =============================================================================
// Display agent (affiche)
// =============================================================================

/// One quantizer option exposed to clients and forwarded to the conversion
/// subprocess.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisplayWriterOption {
    #[serde(rename = "type")]
    pub value_type: String,
    pub default: JsonValue,
    #[serde(rename = "enum", skip_serializing_if = "Option::is_none")]
    pub allowed_values: Option<Vec<JsonValue>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub placeholder: Option<String>,
    pub display_name: String,
}

#[derive(Debug, Clone, Deserialize)]
struct AfficheFileConfig {
    #[serde(rename = "TEMP_PATH")]
    temp_path: String,
    #[serde(rename = "DISPLAY_WRITER_COMMAND")]
    display_writer_command: Vec<String>,
    #[serde(rename = "DISPLAY_WRITER_OPTIONS_SCHEMA_PATH")]
    options_schema_path: Option<String>,
    #[serde(rename = "DISPLAY_WRITER_OPTIONS")]
    display_writer_options: BTreeMap<String, DisplayWriterOption>,
    #[serde(rename = "EXPO_ADDRESS")]
    expo_address: Option<String>,
    #[serde(rename = "MAP_TILES")]
    map_tiles: JsonValue,
}

#[derive(Debug, Clone)]
pub struct AfficheConfig {
    pub temp_path: PathBuf,
    pub display_writer_command: Vec<String>,
    pub options_schema_path: Option<PathBuf>,
    pub display_writer_options: BTreeMap<String, DisplayWriterOption>,
    pub expo_address: Option<String>,
    pub map_tiles: JsonValue,
}

impl AfficheConfig {
    fn defaults() -> JsonValue {
        json!({
            "TEMP_PATH": "temp",
            "DISPLAY_WRITER_COMMAND": [],
            "DISPLAY_WRITER_OPTIONS_SCHEMA_PATH": null,
            "DISPLAY_WRITER_OPTIONS": {
                "rotation": {
                    "type": "string",
                    "default": "automatic",
                    "enum": ["automatic", "landscape", "portrait"],
                    "display_name": "Rotation",
                },
                "dynamic_range": {
                    "type": "number",
                    "default": 1.0,
                    "display_name": "Dynamic range",
                },
                "exposure": {
                    "type": "number",
                    "default": 1.0,
                    "display_name": "Exposure",
                },
                "brightness": {
                    "type": "number",
                    "default": 0.0,
                    "display_name": "Brightness",
                },
                "contrast": {
                    "type": "number",
                    "default": 1.0,
                    "display_name": "Contrast",
                },
                "sharpening": {
                    "type": "number",
                    "default": 0.5,
                    "display_name": "Sharpening",
                },
                "clipped_chroma_recovery": {
                    "type": "number",
                    "default": 1.0,
                    "display_name": "Clipped chroma recovery",
                },
            },
            "EXPO_ADDRESS": null,
            "MAP_TILES": {},
        })
    }

    pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
        let merged = load_merged(Self::defaults(), AFFICHE_CONFIG_PATH_VAR, explicit_path)?;
        let file: AfficheFileConfig =
            serde_json::from_value(merged).context("invalid display agent configuration")?;
        Ok(Self {
            temp_path: PathBuf::from(file.temp_path),
            display_writer_command: file.display_writer_command,
            options_schema_path: file.options_schema_path.map(PathBuf::from),
            display_writer_options: file.display_writer_options,
            expo_address: file.expo_address,
            map_tiles: file.map_tiles,
        })
    }

    /// JSON-schema document describing the configured options.
    pub fn options_schema(&self) -> JsonValue {
        let mut properties = serde_json::Map::new();
        for (name, option) in &self.display_writer_options {
            let mut property = serde_json::Map::new();
            property.insert("type".to_string(), json!(option.value_type));
            property.insert("title".to_string(), json!(option.display_name));
            if let Some(allowed) = &option.allowed_values {
                property.insert("enum".to_string(), json!(allowed));
            }
            if let Some(placeholder) = &option.placeholder {
                property.insert("placeholder".to_string(), json!(placeholder));
            }
            properties.insert(name.clone(), JsonValue::Object(property));
        }
        json!({
            "type": "object",
            "properties": properties,
        })
    }

    /// Default value per option name.
    pub fn options_defaults(&self) -> JsonValue {
        let defaults: serde_json::Map<String, JsonValue> = self
            .display_writer_options
            .iter()
            .map(|(name, option)| (name.clone(), option.default.clone()))
            .collect();
        JsonValue::Object(defaults)
    }

    /// Coerce a raw form value to its configured type. Unknown option names
    /// and unparseable values yield `None` and the field is dropped.
    pub fn coerce_option_value(&self, name: &str, raw: &str) -> Option<JsonValue> {
        let option = self.display_writer_options.get(name)?;
        match option.value_type.as_str() {
            "number" => raw.parse::<f64>().ok().map(|n| json!(n)),
            _ => Some(JsonValue::String(raw.to_string())),
        }
    }
}
