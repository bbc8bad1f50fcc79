//! The display agent's conversion job engine and upload intake.

mod engine;
mod upload;

pub use engine::{DisplayEngine, EngineSnapshot, Status, SubStatus};
pub use upload::{
    file_name_from_url, prepare_temp_dirs, random_job_id, sanitize_file_name, with_job_suffix,
};
