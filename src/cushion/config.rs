use serde::Deserialize;

use crate::error::Result;

/// Connection settings for a document server.
///
/// Every field has a default, so partial JSON is accepted:
///
/// ```
/// use yieldpoint::cushion::CushionConfig;
///
/// let config = CushionConfig::from_json(r#"{"default_db": "accounts"}"#).unwrap();
/// assert_eq!(config.default_db, "accounts");
/// assert_eq!(config.uri, "http://localhost:5984");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CushionConfig {
    pub uri: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Database used when an operation names none.
    pub default_db: String,
    /// Create databases that do not exist yet when opening them implicitly.
    pub create_missing: bool,
}

impl Default for CushionConfig {
    fn default() -> Self {
        Self {
            uri: "http://localhost:5984".to_string(),
            username: None,
            password: None,
            default_db: String::new(),
            create_missing: false,
        }
    }
}

impl CushionConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::YieldError;

    #[test]
    fn test_full_config() {
        let config = CushionConfig::from_json(
            r#"{
                "uri": "http://couch:5984",
                "username": "admin",
                "password": "secret",
                "default_db": "accounts",
                "create_missing": true
            }"#,
        )
        .unwrap();

        assert_eq!(config.uri, "http://couch:5984");
        assert_eq!(config.username.as_deref(), Some("admin"));
        assert_eq!(config.password.as_deref(), Some("secret"));
        assert!(config.create_missing);
    }

    #[test]
    fn test_empty_config_is_default() {
        assert_eq!(CushionConfig::from_json("{}").unwrap(), CushionConfig::default());
    }

    #[test]
    fn test_malformed_config() {
        assert!(matches!(
            CushionConfig::from_json(r#"{"create_missing": "yes"}"#),
            Err(YieldError::Json(_))
        ));
    }
}
