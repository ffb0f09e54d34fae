//! Portable profile export format.
//!
//! The file is a JSON array of
//! `{name, apiEndpoint, apiKey, modelName, parameters, isDefault}` objects.

use core_types::{ModelParameters, Profile};
use serde::{Deserialize, Serialize};

/// Whether an export carries API keys in clear text. Plaintext must be asked
/// for explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretExport {
    IncludePlaintext,
    Redact,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportReport {
    pub imported: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ExportedProfile {
    pub name: String,
    pub api_endpoint: String,
    #[serde(default)]
    pub api_key: String,
    pub model_name: String,
    pub parameters: ModelParameters,
    #[serde(default)]
    pub is_default: bool,
}

impl ExportedProfile {
    pub(crate) fn from_profile(profile: &Profile, api_key: String) -> Self {
        Self {
            name: profile.name.clone(),
            api_endpoint: profile.api_endpoint.clone(),
            api_key,
            model_name: profile.model_name.clone(),
            parameters: profile.parameters,
            is_default: profile.is_default,
        }
    }
}

pub(crate) const IMPORTED_SUFFIX: &str = " (Imported)";

/// Appends the import suffix until `name` no longer collides.
pub(crate) fn unique_import_name<F>(name: &str, taken: F) -> String
where
    F: Fn(&str) -> bool,
{
    let mut candidate = name.to_string();
    while taken(&candidate) {
        candidate.push_str(IMPORTED_SUFFIX);
    }
    candidate
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn reads_the_portable_shape() {
        let entry = json!({
            "name": "Work",
            "apiEndpoint": "https://api.openai.com/v1",
            "apiKey": "sk-1",
            "modelName": "gpt-4o",
            "parameters": {
                "temperature": 0.2,
                "maxTokens": 1024,
                "topP": 1.0,
                "frequencyPenalty": 0.0,
                "presencePenalty": 0.0
            },
            "isDefault": true
        });
        let parsed: ExportedProfile = serde_json::from_value(entry).expect("parse");
        assert_eq!(parsed.api_key, "sk-1");
        assert_eq!(parsed.parameters.max_tokens, 1024);
        assert!(parsed.is_default);
    }

    #[test]
    fn collisions_gain_a_suffix_each_time() {
        let taken = ["Work".to_string(), "Work (Imported)".to_string()];
        let name = unique_import_name("Work", |n| taken.iter().any(|t| t == n));
        assert_eq!(name, "Work (Imported) (Imported)");
        assert_eq!(unique_import_name("Home", |_| false), "Home");
    }
}
