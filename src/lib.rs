pub mod config;
pub mod manifest;
pub mod pipeline;
pub mod report;
pub mod sandbox;
pub mod submission;
pub mod workspace;

pub fn create_timestamp() -> String {
    use chrono::{SecondsFormat, Utc};
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
