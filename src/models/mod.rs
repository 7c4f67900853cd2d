//! Domain model module declarations.

use serde::{Deserialize, Deserializer};

pub mod task;

/// Deserialize a task id written either as a JSON string or a number.
///
/// Older snapshots wrote numeric ids; both forms key the same task.
pub(crate) fn deserialize_task_id<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Text(String),
        Number(serde_json::Number),
    }

    match RawId::deserialize(deserializer)? {
        RawId::Text(text) => Ok(text),
        RawId::Number(number) => Ok(number.to_string()),
    }
}
