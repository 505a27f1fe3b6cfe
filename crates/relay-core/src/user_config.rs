//! Per-chat user configuration and its overlay rules.
//!
//! Resolution order: built-in defaults ← process config (`[defaults]` /
//! `RELAY_DEFAULTS__*`) ← per-chat overrides persisted by `/setenv`.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::error::{RelayError, Result};

/// Chat completion backend family.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    #[default]
    OpenAi,
    Azure,
    Workers,
    Anthropic,
}

impl ProviderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::Azure => "azure",
            ProviderKind::Workers => "workers",
            ProviderKind::Anthropic => "anthropic",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Image generation backend family.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageProviderKind {
    #[default]
    OpenAi,
    Azure,
    Workers,
}

impl ImageProviderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ImageProviderKind::OpenAi => "openai",
            ImageProviderKind::Azure => "azure",
            ImageProviderKind::Workers => "workers",
        }
    }
}

impl fmt::Display for ImageProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Provider selection, prompt and credential settings for one chat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserConfig {
    pub ai_provider: ProviderKind,
    pub ai_image_provider: ImageProviderKind,
    pub system_init_message: Option<String>,
    pub system_init_message_role: String,

    pub openai_api_key: Vec<String>,
    pub openai_chat_model: String,
    pub openai_api_base: String,
    /// Extra top-level fields merged into every OpenAI request body.
    pub openai_api_extra_params: Map<String, Value>,

    pub dall_e_model: String,
    pub dall_e_image_size: String,
    pub dall_e_image_quality: String,
    pub dall_e_image_style: String,

    pub azure_api_key: Option<String>,
    /// Full chat completions URL including deployment and api-version.
    pub azure_completions_api: Option<String>,
    pub azure_dalle_api: Option<String>,

    pub cloudflare_account_id: Option<String>,
    pub cloudflare_token: Option<String>,
    pub workers_chat_model: String,
    pub workers_image_model: String,

    pub anthropic_api_key: Option<String>,
    pub anthropic_api_base: String,
    pub anthropic_chat_model: String,

    /// Keys set by per-chat overrides (filled in by `with_overrides`).
    pub define_keys: Vec<String>,
}

impl Default for UserConfig {
    fn default() -> Self {
        Self {
            ai_provider: ProviderKind::default(),
            ai_image_provider: ImageProviderKind::default(),
            system_init_message: None,
            system_init_message_role: "system".to_string(),
            openai_api_key: Vec::new(),
            openai_chat_model: "gpt-4o-mini".to_string(),
            openai_api_base: "https://api.openai.com/v1".to_string(),
            openai_api_extra_params: Map::new(),
            dall_e_model: "dall-e-2".to_string(),
            dall_e_image_size: "512x512".to_string(),
            dall_e_image_quality: "standard".to_string(),
            dall_e_image_style: "vivid".to_string(),
            azure_api_key: None,
            azure_completions_api: None,
            azure_dalle_api: None,
            cloudflare_account_id: None,
            cloudflare_token: None,
            workers_chat_model: "@cf/mistral/mistral-7b-instruct-v0.1".to_string(),
            workers_image_model: "@cf/stabilityai/stable-diffusion-xl-base-1.0".to_string(),
            anthropic_api_key: None,
            anthropic_api_base: "https://api.anthropic.com/v1".to_string(),
            anthropic_chat_model: "claude-3-haiku-20240307".to_string(),
            define_keys: Vec::new(),
        }
    }
}

const RESERVED_KEYS: &[&str] = &["define_keys"];

/// Endpoint settings stay process-wide: a chat may bring its own key, but it
/// may not point the operator's key at another host.
const LOCKED_KEYS: &[&str] = &[
    "openai_api_base",
    "anthropic_api_base",
    "azure_completions_api",
    "azure_dalle_api",
    "cloudflare_account_id",
];

fn is_locked(key: &str) -> bool {
    LOCKED_KEYS.contains(&key)
}

impl UserConfig {
    /// Apply persisted per-chat overrides on top of `self`.
    ///
    /// Keys are matched case-insensitively. Unknown keys and values of the
    /// wrong type are skipped with a warning; they never fail the request.
    pub fn with_overrides(&self, overrides: &Map<String, Value>) -> UserConfig {
        let mut merged = match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => return self.clone(),
        };
        let mut applied = Vec::new();

        for (raw_key, value) in overrides {
            let key = raw_key.to_ascii_lowercase();
            if RESERVED_KEYS.contains(&key.as_str()) || !merged.contains_key(&key) {
                warn!(key = %raw_key, "ignoring unknown user config override");
                continue;
            }
            if is_locked(&key) {
                warn!(key = %raw_key, "ignoring override of a locked endpoint setting");
                continue;
            }
            let mut candidate = merged.clone();
            candidate.insert(key.clone(), value.clone());
            match serde_json::from_value::<UserConfig>(Value::Object(candidate.clone())) {
                Ok(_) => {
                    merged = candidate;
                    applied.push(key);
                }
                Err(e) => warn!(key = %raw_key, error = %e, "ignoring ill-typed user config override"),
            }
        }

        let mut resolved: UserConfig =
            serde_json::from_value(Value::Object(merged)).unwrap_or_else(|_| self.clone());
        resolved.define_keys = applied;
        resolved
    }

    /// Convert a raw `/setenv KEY=VALUE` value into JSON shaped like the
    /// existing field, so `openai_api_key=sk-1` becomes `["sk-1"]`.
    pub fn parse_override(&self, key: &str, raw: &str) -> Result<(String, Value)> {
        let key = key.trim().to_ascii_lowercase();
        let current = match serde_json::to_value(self)? {
            Value::Object(map) => map.get(&key).cloned(),
            _ => None,
        };
        let current = match current {
            Some(v) if !RESERVED_KEYS.contains(&key.as_str()) => v,
            _ => return Err(RelayError::UnknownKey(key)),
        };
        let raw = raw.trim();
        let invalid = |reason: String| RelayError::InvalidOverride {
            key: key.clone(),
            reason,
        };
        if is_locked(&key) {
            return Err(invalid("endpoint settings cannot be changed per chat".to_string()));
        }

        let value = match current {
            Value::Bool(_) => raw
                .parse::<bool>()
                .map(Value::Bool)
                .map_err(|e| invalid(e.to_string()))?,
            Value::Number(_) => serde_json::from_str::<serde_json::Number>(raw)
                .map(Value::Number)
                .map_err(|e| invalid(e.to_string()))?,
            Value::Array(_) => match serde_json::from_str::<Value>(raw) {
                Ok(v @ Value::Array(_)) => v,
                _ => Value::Array(
                    raw.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(|s| Value::String(s.to_string()))
                        .collect(),
                ),
            },
            Value::Object(_) => match serde_json::from_str::<Value>(raw) {
                Ok(v @ Value::Object(_)) => v,
                Ok(_) => return Err(invalid("expected a JSON object".to_string())),
                Err(e) => return Err(invalid(e.to_string())),
            },
            Value::String(_) | Value::Null => Value::String(raw.to_string()),
        };

        // Reject values that would not deserialize, e.g. an unknown provider name.
        let mut trial = Map::new();
        trial.insert(key.clone(), value.clone());
        if self.with_overrides(&trial).define_keys.is_empty() {
            return Err(invalid(format!("`{raw}` is not a valid value")));
        }
        Ok((key, value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn overrides(v: Value) -> Map<String, Value> {
        match v {
            Value::Object(m) => m,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn overrides_win_over_process_defaults() {
        let process = UserConfig {
            openai_chat_model: "gpt-process".into(),
            ..UserConfig::default()
        };
        let resolved = process.with_overrides(&overrides(json!({
            "OPENAI_CHAT_MODEL": "gpt-chat",
            "ai_provider": "workers",
        })));
        assert_eq!(resolved.openai_chat_model, "gpt-chat");
        assert_eq!(resolved.ai_provider, ProviderKind::Workers);
        assert_eq!(resolved.define_keys.len(), 2);
        // untouched keys keep the process value
        assert_eq!(resolved.dall_e_model, "dall-e-2");
    }

    #[test]
    fn unknown_and_ill_typed_keys_are_skipped() {
        let base = UserConfig::default();
        let resolved = base.with_overrides(&overrides(json!({
            "no_such_key": 1,
            "ai_provider": "palm",
            "define_keys": ["x"],
            "system_init_message": "be brief",
        })));
        assert_eq!(resolved.ai_provider, ProviderKind::OpenAi);
        assert_eq!(resolved.system_init_message.as_deref(), Some("be brief"));
        assert_eq!(resolved.define_keys, vec!["system_init_message".to_string()]);
    }

    #[test]
    fn parse_override_shapes_values_like_the_field() {
        let cfg = UserConfig::default();
        let (key, value) = cfg.parse_override("OPENAI_API_KEY", "sk-1, sk-2").unwrap();
        assert_eq!(key, "openai_api_key");
        assert_eq!(value, json!(["sk-1", "sk-2"]));

        let (_, value) = cfg
            .parse_override("openai_api_extra_params", r#"{"temperature":0.2}"#)
            .unwrap();
        assert_eq!(value, json!({"temperature": 0.2}));

        let (_, value) = cfg.parse_override("azure_api_key", "abc").unwrap();
        assert_eq!(value, json!("abc"));
    }

    #[test]
    fn parse_override_rejects_unknown_and_invalid() {
        let cfg = UserConfig::default();
        assert!(matches!(
            cfg.parse_override("nope", "1"),
            Err(RelayError::UnknownKey(_))
        ));
        assert!(matches!(
            cfg.parse_override("define_keys", "a"),
            Err(RelayError::UnknownKey(_))
        ));
        assert!(matches!(
            cfg.parse_override("ai_provider", "palm"),
            Err(RelayError::InvalidOverride { .. })
        ));
    }

    #[test]
    fn endpoint_settings_are_locked() {
        let operator = UserConfig {
            openai_api_key: vec!["sk-operator".into()],
            ..UserConfig::default()
        };
        assert!(matches!(
            operator.parse_override("OPENAI_API_BASE", "https://elsewhere.example/v1"),
            Err(RelayError::InvalidOverride { .. })
        ));
        assert!(operator.parse_override("azure_dalle_api", "https://x").is_err());

        let resolved = operator.with_overrides(&overrides(json!({
            "openai_api_base": "https://elsewhere.example/v1",
            "anthropic_api_base": "https://elsewhere.example",
            "azure_completions_api": "https://elsewhere.example",
            "cloudflare_account_id": "other",
        })));
        assert_eq!(resolved.openai_api_base, "https://api.openai.com/v1");
        assert_eq!(resolved.anthropic_api_base, "https://api.anthropic.com/v1");
        assert_eq!(resolved.azure_completions_api, None);
        assert_eq!(resolved.cloudflare_account_id, None);
        assert!(resolved.define_keys.is_empty());
    }
}
