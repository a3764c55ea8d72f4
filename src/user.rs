//! User contexts that flags are evaluated against.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// A user seen by the application.
///
/// Only `key` is required. The built-in attributes and the free-form
/// `custom` map are all addressable from targeting clauses.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct User {
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secondary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anonymous: Option<bool>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub custom: HashMap<String, Value>,
}

impl User {
    /// Create a user based on a key
    pub fn new<K: Into<String>>(key: K) -> Self {
        Self {
            key: key.into(),
            ..Self::default()
        }
    }

    /// Attach a custom attribute.
    pub fn custom_attribute<K: Into<String>, V: Into<Value>>(mut self, name: K, value: V) -> Self {
        self.custom.insert(name.into(), value.into());
        self
    }

    /// Look up an attribute by the name clauses use for it.
    ///
    /// Built-in attributes shadow custom ones of the same name. Unknown
    /// attributes resolve to `None` and never match a clause.
    pub fn attribute(&self, name: &str) -> Option<Value> {
        match name {
            "key" => Some(Value::String(self.key.clone())),
            "secondary" => self.secondary.clone().map(Value::String),
            "ip" => self.ip.clone().map(Value::String),
            "country" => self.country.clone().map(Value::String),
            "email" => self.email.clone().map(Value::String),
            "firstName" => self.first_name.clone().map(Value::String),
            "lastName" => self.last_name.clone().map(Value::String),
            "avatar" => self.avatar.clone().map(Value::String),
            "name" => self.name.clone().map(Value::String),
            "anonymous" => self.anonymous.map(Value::Bool),
            _ => self.custom.get(name).cloned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn built_in_attributes_resolve() {
        let user = User {
            key: "u".into(),
            country: Some("de".into()),
            first_name: Some("Ada".into()),
            ..User::default()
        };
        assert_eq!(user.attribute("key"), Some(json!("u")));
        assert_eq!(user.attribute("country"), Some(json!("de")));
        assert_eq!(user.attribute("firstName"), Some(json!("Ada")));
        assert_eq!(user.attribute("email"), None);
        assert_eq!(user.attribute("shoe-size"), None);
    }

    #[test]
    fn custom_attributes_resolve() {
        let user = User::new("u")
            .custom_attribute("groups", json!(["beta", "qa"]))
            .custom_attribute("logins", 42);
        assert_eq!(user.attribute("groups"), Some(json!(["beta", "qa"])));
        assert_eq!(user.attribute("logins"), Some(json!(42)));
    }

    #[test]
    fn serializes_with_wire_names() {
        let user = User {
            key: "u".into(),
            first_name: Some("Ada".into()),
            ..User::default()
        };
        let raw = serde_json::to_value(&user).expect("serialize");
        assert_eq!(raw, json!({"key": "u", "firstName": "Ada"}));
    }
}
