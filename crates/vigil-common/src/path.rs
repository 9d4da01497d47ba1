//! Dotted-path lookup and `${...}` interpolation over JSON values.

use serde_json::Value;

/// Resolves a dotted path (`site.pump.pressure`) inside a JSON value.
///
/// Numeric segments index into arrays. An empty path resolves to `root` itself.
///
/// # Examples
///
/// ```
/// use serde_json::json;
/// use vigil_common::path::lookup;
///
/// let ctx = json!({"site": {"pumps": [{"id": "P-1"}]}});
/// assert_eq!(lookup(&ctx, "site.pumps.0.id"), Some(&json!("P-1")));
/// assert_eq!(lookup(&ctx, "site.cranes"), None);
/// ```
pub fn lookup<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let path = path.trim();
    if path.is_empty() {
        return Some(root);
    }
    path.split('.').try_fold(root, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Renders a JSON value for inclusion in text. Strings are inserted without quotes,
/// `null` renders empty, everything else uses its JSON form.
pub fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Replaces every `${path}` token with the value found at `path` in `context`.
///
/// Unresolved tokens and unterminated `${` sequences are kept verbatim.
///
/// # Examples
///
/// ```
/// use serde_json::json;
/// use vigil_common::path::interpolate;
///
/// let ctx = json!({"alert": {"title": "Pump failure"}});
/// assert_eq!(interpolate("${alert.title}", &ctx), "Pump failure");
/// assert_eq!(interpolate("${alert.missingField}", &ctx), "${alert.missingField}");
/// ```
pub fn interpolate(template: &str, context: &Value) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            out.push_str(&rest[start..]);
            return out;
        };
        let token = &rest[start..start + 2 + end + 1];
        match lookup(context, &after[..end]) {
            Some(value) if !after[..end].trim().is_empty() => out.push_str(&display_value(value)),
            _ => out.push_str(token),
        }
        rest = &after[end + 1..];
    }

    out.push_str(rest);
    out
}
