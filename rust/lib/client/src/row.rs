//! Backend row shapes.
//!
//! Rows travel as JSON objects exactly as the hosted backend returns them.
//! Typed decoding into view models happens in the social layer's
//! normalizer; this module only names the tables and offers column access.

use serde_json::{Map, Value};

/// A single backend record (a JSON object).
pub type Row = Value;

/// Table names of the hosted schema.
pub mod table {
    pub const PROFILES: &str = "profiles";
    pub const POSTS: &str = "posts";
    pub const COMMENTS: &str = "comments";
    pub const LIKES: &str = "likes";
    pub const REELS: &str = "reels";
    pub const REEL_COMMENTS: &str = "reel_comments";
    pub const REEL_LIKES: &str = "reel_likes";
    pub const FOLLOWERS: &str = "followers";
    pub const STORIES: &str = "stories";
    pub const MESSAGES: &str = "messages";
    pub const NOTIFICATIONS: &str = "notifications";
    pub const BUCKETS: &str = "buckets";
    pub const BUCKET_POSTS: &str = "bucket_posts";
}

/// Column value, or `None` when absent or not an object.
pub fn column<'a>(row: &'a Row, name: &str) -> Option<&'a Value> {
    row.as_object().and_then(|o| o.get(name))
}

/// Column as a string slice.
pub fn column_str<'a>(row: &'a Row, name: &str) -> Option<&'a str> {
    column(row, name).and_then(Value::as_str)
}

/// Render a scalar for comparisons and topic keys: strings unquoted,
/// numbers and booleans via their JSON text. Objects, arrays and null
/// have no scalar form.
pub fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Whether two values are equal under scalar comparison, so that `42`
/// and `"42"` match the way the backend's text filters do.
pub fn scalar_eq(a: &Value, b: &Value) -> bool {
    match (scalar_text(a), scalar_text(b)) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

/// Build a row from `(column, value)` pairs.
pub fn row_from<I, K>(pairs: I) -> Row
where
    I: IntoIterator<Item = (K, Value)>,
    K: Into<String>,
{
    let map: Map<String, Value> = pairs.into_iter().map(|(k, v)| (k.into(), v)).collect();
    Value::Object(map)
}

/// Shallow-merge `patch` into `row`. Non-object inputs leave `row` as is.
pub fn merge_into(row: &mut Row, patch: &Row) {
    if let (Some(target), Some(source)) = (row.as_object_mut(), patch.as_object()) {
        for (k, v) in source {
            target.insert(k.clone(), v.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn scalar_comparison_ignores_json_type() {
        assert!(scalar_eq(&json!(1001), &json!("1001")));
        assert!(scalar_eq(&json!(true), &json!("true")));
        assert!(!scalar_eq(&json!("a"), &json!("b")));
        assert!(scalar_eq(&json!(null), &json!(null)));
    }

    #[test]
    fn merge_overwrites_present_keys_only() {
        let mut row = json!({"id": "p1", "content": "old", "shares": 2});
        merge_into(&mut row, &json!({"content": "new"}));
        assert_eq!(row, json!({"id": "p1", "content": "new", "shares": 2}));
    }

    #[test]
    fn column_access() {
        let row = row_from([("id", json!("u1")), ("online", json!(true))]);
        assert_eq!(column_str(&row, "id"), Some("u1"));
        assert_eq!(column_str(&row, "online"), None);
        assert!(column(&json!([1, 2]), "id").is_none());
    }
}
