//! SQLite schema for the curator database.
//!
//! One database holds refresh jobs, collections, photos, and the per-strategy
//! locator tables. Evolution is additive: tables are created when missing and
//! validated when present.

use crate::sqlite_column;
use crate::sqlite_persistence::{Column, ForeignKey, ForeignKeyOnChange, Schema, SqlType, Table};

const COLLECTIONS_FK: ForeignKey = ForeignKey {
    foreign_table: "collections",
    foreign_column: "id",
    on_delete: ForeignKeyOnChange::Cascade,
};

const PHOTOS_FK: ForeignKey = ForeignKey {
    foreign_table: "photos",
    foreign_column: "id",
    on_delete: ForeignKeyOnChange::Cascade,
};

const REFRESH_JOBS_TABLE: Table = Table {
    name: "refresh_jobs",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("identifier", &SqlType::Text, non_null = true, is_unique = true),
        sqlite_column!("display_name", &SqlType::Text, non_null = true),
        sqlite_column!("hostname", &SqlType::Text, non_null = true),
        sqlite_column!("schedule", &SqlType::Text, non_null = true),
        sqlite_column!("enabled", &SqlType::Integer, non_null = true),
        sqlite_column!("filter", &SqlType::Text, non_null = true),
        sqlite_column!("order", &SqlType::Text, non_null = true),
        sqlite_column!("affiche_options_json", &SqlType::Text, non_null = true),
        sqlite_column!("post_command_id", &SqlType::Text, non_null = true),
    ],
    indices: &[],
};

const COLLECTIONS_TABLE: Table = Table {
    name: "collections",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("identifier", &SqlType::Text, non_null = true, is_unique = true),
        sqlite_column!("display_name", &SqlType::Text, non_null = true),
        sqlite_column!("schedule", &SqlType::Text, non_null = true),
        sqlite_column!("enabled", &SqlType::Integer, non_null = true),
        sqlite_column!("class_name", &SqlType::Text, non_null = true),
        sqlite_column!("settings_json", &SqlType::Text),
    ],
    indices: &[],
};

const PHOTOS_TABLE: Table = Table {
    name: "photos",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!(
            "collection_id",
            &SqlType::Integer,
            non_null = true,
            foreign_key = Some(&COLLECTIONS_FK)
        ),
        sqlite_column!("display_date", &SqlType::Text),
        sqlite_column!("format", &SqlType::Text),
        sqlite_column!("width", &SqlType::Integer),
        sqlite_column!("height", &SqlType::Integer),
        sqlite_column!("favorite", &SqlType::Integer),
        sqlite_column!("capture_date", &SqlType::Text),
        sqlite_column!(
            "cycle_count",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
    ],
    indices: &[("idx_photos_collection_id", "collection_id")],
};

const FS_COLLECTIONS_DATA_TABLE: Table = Table {
    name: "fs_collections_data",
    columns: &[
        sqlite_column!(
            "photo_id",
            &SqlType::Integer,
            is_primary_key = true,
            foreign_key = Some(&PHOTOS_FK)
        ),
        sqlite_column!(
            "collection_id",
            &SqlType::Integer,
            non_null = true,
            foreign_key = Some(&COLLECTIONS_FK)
        ),
        sqlite_column!("path", &SqlType::Text, non_null = true, is_unique = true),
        sqlite_column!("modified_date", &SqlType::Text, non_null = true),
        sqlite_column!("scan_token", &SqlType::Text, non_null = true),
    ],
    indices: &[("idx_fs_collections_data_collection_id", "collection_id")],
};

const AZP_COLLECTIONS_DATA_TABLE: Table = Table {
    name: "azp_collections_data",
    columns: &[
        sqlite_column!(
            "photo_id",
            &SqlType::Integer,
            is_primary_key = true,
            foreign_key = Some(&PHOTOS_FK)
        ),
        sqlite_column!(
            "collection_id",
            &SqlType::Integer,
            non_null = true,
            foreign_key = Some(&COLLECTIONS_FK)
        ),
        sqlite_column!("node_id", &SqlType::Text, non_null = true, is_unique = true),
        sqlite_column!("name", &SqlType::Text, non_null = true),
        sqlite_column!("modified_date", &SqlType::Text, non_null = true),
        sqlite_column!("scan_token", &SqlType::Text, non_null = true),
    ],
    indices: &[("idx_azp_collections_data_collection_id", "collection_id")],
};

pub const PHOTO_DB_SCHEMA: Schema = Schema {
    tables: &[
        REFRESH_JOBS_TABLE,
        COLLECTIONS_TABLE,
        PHOTOS_TABLE,
        FS_COLLECTIONS_DATA_TABLE,
        AZP_COLLECTIONS_DATA_TABLE,
    ],
};
