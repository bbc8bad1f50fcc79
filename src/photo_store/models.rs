use serde_json::Value as JsonValue;

/// A `collections` row. `id` is `None` until the record has been stored.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionRecord {
    pub id: Option<i64>,
    pub identifier: String,
    pub display_name: String,
    pub schedule: String,
    pub enabled: bool,
    pub class_name: String,
    pub settings: JsonValue,
}

/// A `refresh_jobs` row. Filter and order are stored in their wire forms and
/// parsed by the refresh layer.
#[derive(Debug, Clone, PartialEq)]
pub struct RefreshJobRecord {
    pub id: Option<i64>,
    pub identifier: String,
    pub display_name: String,
    pub hostname: String,
    pub schedule: String,
    pub enabled: bool,
    pub filter: String,
    pub order: String,
    pub affiche_options: JsonValue,
    pub post_command_id: String,
}

/// Result of one selector call.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectedPhoto {
    pub photo_id: i64,
    pub collection_id: i64,
    pub capture_date: Option<String>,
}
