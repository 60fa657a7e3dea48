use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const API_URL_KEY: &str = "TRIP_CHAT_API_URL";
pub const PUSH_URL_KEY: &str = "TRIP_CHAT_PUSH_URL";
pub const USER_ID_KEY: &str = "TRIP_CHAT_USER_ID";
pub const TOKEN_KEY: &str = "TRIP_CHAT_TOKEN";

pub const SETTING_KEYS: &[&str] = &[API_URL_KEY, PUSH_URL_KEY, USER_ID_KEY, TOKEN_KEY];

const DEFAULT_API_URL: &str = "http://localhost:5001/api";
const DEFAULT_PUSH_URL: &str = "ws://localhost:5001/ws";

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Settings {
    pub api_base_url: String,
    pub push_url: String,
    pub user_id: String,
    pub auth_token: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing setting: {0}")]
    Missing(&'static str),
    #[error("invalid {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let read = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let api_base_url = read(API_URL_KEY).unwrap_or_else(|| DEFAULT_API_URL.to_string());
        check_scheme(API_URL_KEY, &api_base_url, &["http", "https"])?;

        let push_url = read(PUSH_URL_KEY).unwrap_or_else(|| DEFAULT_PUSH_URL.to_string());
        check_scheme(PUSH_URL_KEY, &push_url, &["ws", "wss"])?;

        let user_id = read(USER_ID_KEY).ok_or(ConfigError::Missing(USER_ID_KEY))?;

        Ok(Self {
            api_base_url,
            push_url,
            user_id,
            auth_token: read(TOKEN_KEY),
        })
    }

    /// Settings for display and logs, with the token masked.
    pub fn display_map(&self) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        map.insert(API_URL_KEY.to_string(), self.api_base_url.clone());
        map.insert(PUSH_URL_KEY.to_string(), self.push_url.clone());
        map.insert(USER_ID_KEY.to_string(), self.user_id.clone());
        if let Some(token) = &self.auth_token {
            map.insert(TOKEN_KEY.to_string(), mask(token));
        }
        map
    }
}

fn check_scheme(key: &'static str, value: &str, schemes: &[&str]) -> Result<(), ConfigError> {
    let url = Url::parse(value).map_err(|e| ConfigError::Invalid {
        key,
        reason: e.to_string(),
    })?;
    if !schemes.contains(&url.scheme()) {
        return Err(ConfigError::Invalid {
            key,
            reason: format!("unsupported scheme {}", url.scheme()),
        });
    }
    Ok(())
}

fn mask(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() > 8 {
        let head: String = chars[..4].iter().collect();
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("{}...{}", head, tail)
    } else {
        "****".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn settings(pairs: &[(&str, &str)]) -> Result<Settings, ConfigError> {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Settings::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn defaults_fill_urls() {
        let settings = settings(&[(USER_ID_KEY, "u1")]).unwrap();
        assert_eq!(settings.api_base_url, DEFAULT_API_URL);
        assert_eq!(settings.push_url, DEFAULT_PUSH_URL);
        assert_eq!(settings.auth_token, None);
    }

    #[test]
    fn user_id_is_required() {
        assert!(matches!(
            settings(&[(USER_ID_KEY, "  ")]),
            Err(ConfigError::Missing(USER_ID_KEY))
        ));
    }

    #[test]
    fn push_url_must_be_websocket() {
        let err = settings(&[(USER_ID_KEY, "u1"), (PUSH_URL_KEY, "http://localhost/ws")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: PUSH_URL_KEY, .. }));
    }

    #[test]
    fn token_is_masked_for_display() {
        let settings = settings(&[(USER_ID_KEY, "u1"), (TOKEN_KEY, "abcd1234efgh5678")]).unwrap();
        let map = settings.display_map();
        assert_eq!(map[TOKEN_KEY], "abcd...5678");
        assert_eq!(SETTING_KEYS.len(), 4);
    }
}
