//! Expansion of flattened attribute paths into a document.
//!
//! Stack templates store their configuration as flat `path = value` pairs,
//! for example:
//!
//! ```text
//! azurerm_container_app.app-1.template.container[0].image = "registry/app:latest"
//! azurerm_container_app.app-1.template.container[0].env.value?name=MONGO_URI = "..."
//! ```
//!
//! The first two segments are the resource kind and name. Remaining
//! segments are object keys, `key[n]` array positions, or `field?key=value`
//! selectors that pick (or append) the array element whose `key` equals
//! `value` and set its `field`. Values that parse as JSON are stored as JSON.

use serde_json::{Map, Value};

use crate::error::{ConfigError, Result};

use super::model::Document;

/// Largest `key[n]` position accepted. Missing positions below it are
/// filled with `null`.
pub const MAX_ARRAY_INDEX: usize = 255;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Key(String),
    Index(String, usize),
    Select {
        field: String,
        key: String,
        value: String,
    },
}

/// Expands flattened attribute pairs into a document.
///
/// Pairs are applied in the order given; later pairs win.
///
/// # Errors
///
/// Returns a validation error for malformed paths or paths that walk
/// through a value of the wrong shape.
pub fn expand_attributes<I, K, V>(pairs: I) -> Result<Document>
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: AsRef<str>,
{
    let mut document = Document::new();

    for (path, raw) in pairs {
        let path = path.as_ref();
        let segments = parse_path(path)?;
        let (kind, name, rest) = match segments.as_slice() {
            [Segment::Key(kind), Segment::Key(name), rest @ ..] => (kind, name, rest),
            _ => return Err(invalid(path, "expected '<kind>.<name>' prefix")),
        };

        let value = parse_value(raw.as_ref());
        let resource = document
            .resource
            .entry(kind.clone())
            .or_default()
            .entry(name.clone())
            .or_insert_with(|| Value::Object(Map::new()));

        if rest.is_empty() {
            if !value.is_object() {
                return Err(invalid(path, "a whole resource must be a JSON object"));
            }
            *resource = value;
            continue;
        }

        assign(resource, rest, value, path)?;
    }

    Ok(document)
}

fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn invalid(path: &str, reason: &str) -> crate::error::DeployBoxError {
    ConfigError::validation(format!("Invalid attribute path '{path}': {reason}"), path).into()
}

fn parse_path(path: &str) -> Result<Vec<Segment>> {
    path.split('.').map(|raw| parse_segment(raw, path)).collect()
}

fn parse_segment(raw: &str, path: &str) -> Result<Segment> {
    if raw.is_empty() {
        return Err(invalid(path, "empty segment"));
    }

    if let Some((field, selector)) = raw.split_once('?') {
        let (key, value) = selector
            .split_once('=')
            .ok_or_else(|| invalid(path, "selector must look like 'field?key=value'"))?;
        if field.is_empty() || key.is_empty() {
            return Err(invalid(path, "selector field and key cannot be empty"));
        }
        return Ok(Segment::Select {
            field: field.to_string(),
            key: key.to_string(),
            value: value.to_string(),
        });
    }

    if let Some(open) = raw.find('[') {
        let (key, index) = raw.split_at(open);
        let index = index
            .strip_prefix('[')
            .and_then(|s| s.strip_suffix(']'))
            .and_then(|s| s.parse::<usize>().ok())
            .ok_or_else(|| invalid(path, "array index must look like 'key[n]'"))?;
        if key.is_empty() {
            return Err(invalid(path, "array segment needs a key"));
        }
        if index > MAX_ARRAY_INDEX {
            return Err(invalid(
                path,
                &format!("array index {index} exceeds the limit of {MAX_ARRAY_INDEX}"),
            ));
        }
        return Ok(Segment::Index(key.to_string(), index));
    }

    Ok(Segment::Key(raw.to_string()))
}

/// Container a segment expects its parent to provide.
fn empty_container(next: Option<&Segment>) -> Value {
    match next {
        Some(Segment::Select { .. }) => Value::Array(Vec::new()),
        _ => Value::Object(Map::new()),
    }
}

fn assign(target: &mut Value, segments: &[Segment], value: Value, path: &str) -> Result<()> {
    let Some((segment, rest)) = segments.split_first() else {
        *target = value;
        return Ok(());
    };
    let terminal = rest.is_empty();

    match segment {
        Segment::Key(key) => {
            let object = target
                .as_object_mut()
                .ok_or_else(|| invalid(path, &format!("'{key}' parent is not an object")))?;
            if terminal {
                object.insert(key.clone(), value);
                return Ok(());
            }
            let child = object
                .entry(key.clone())
                .or_insert_with(|| empty_container(rest.first()));
            assign(child, rest, value, path)
        }
        Segment::Index(key, index) => {
            let object = target
                .as_object_mut()
                .ok_or_else(|| invalid(path, &format!("'{key}' parent is not an object")))?;
            let items = object
                .entry(key.clone())
                .or_insert_with(|| Value::Array(Vec::new()))
                .as_array_mut()
                .ok_or_else(|| invalid(path, &format!("'{key}' is not an array")))?;
            if items.len() <= *index {
                items.resize(*index + 1, Value::Null);
            }
            let slot = &mut items[*index];
            if terminal {
                *slot = value;
                return Ok(());
            }
            if slot.is_null() {
                *slot = empty_container(rest.first());
            }
            assign(slot, rest, value, path)
        }
        Segment::Select {
            field,
            key,
            value: wanted,
        } => {
            let items = target
                .as_array_mut()
                .ok_or_else(|| invalid(path, &format!("selector '{key}={wanted}' needs an array")))?;
            let position = items
                .iter()
                .position(|item| item.get(key).and_then(Value::as_str) == Some(wanted.as_str()));
            let position = position.unwrap_or_else(|| {
                let mut element = Map::new();
                element.insert(key.clone(), Value::String(wanted.clone()));
                items.push(Value::Object(element));
                items.len() - 1
            });
            let element = items[position]
                .as_object_mut()
                .ok_or_else(|| invalid(path, "selected element is not an object"))?;
            if terminal {
                element.insert(field.clone(), value);
                return Ok(());
            }
            let child = element
                .entry(field.clone())
                .or_insert_with(|| empty_container(rest.first()));
            assign(child, rest, value, path)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_expand_nested_paths() {
        let document = expand_attributes([
            ("azurerm_container_app.app-1.secret", "[]"),
            (
                "azurerm_container_app.app-1.template.container[0].image",
                "acr.azurecr.io/backend:latest",
            ),
            (
                "azurerm_container_app.app-1.template.container[0].env.value?name=MONGO_URI",
                "mongodb+srv://db",
            ),
            (
                "azurerm_container_app.app-1.template.container[0].env.value?name=PORT",
                "8080",
            ),
            ("azurerm_container_app.app-1.ingress.target_port", "8080"),
        ])
        .expect("attributes should expand");

        let app = &document.resource["azurerm_container_app"]["app-1"];
        assert_eq!(app["secret"], json!([]));
        assert_eq!(app["template"]["container"][0]["image"], "acr.azurecr.io/backend:latest");
        assert_eq!(
            app["template"]["container"][0]["env"],
            json!([
                {"name": "MONGO_URI", "value": "mongodb+srv://db"},
                {"name": "PORT", "value": 8080}
            ])
        );
        assert_eq!(app["ingress"]["target_port"], 8080);
    }

    #[test]
    fn test_selector_updates_existing_element() {
        let document = expand_attributes([
            ("azurerm_container_app.a.env", r#"[{"name": "X", "value": "old"}]"#),
            ("azurerm_container_app.a.env.value?name=X", "new"),
        ])
        .expect("attributes should expand");

        assert_eq!(
            document.resource["azurerm_container_app"]["a"]["env"],
            json!([{"name": "X", "value": "new"}])
        );
    }

    #[test]
    fn test_whole_resource_value() {
        let document = expand_attributes([(
            "azurerm_resource_group.rg",
            r#"{"location": "westeurope"}"#,
        )])
        .expect("attributes should expand");
        assert_eq!(document.resource["azurerm_resource_group"]["rg"]["location"], "westeurope");
    }

    #[test]
    fn test_malformed_paths() {
        assert!(expand_attributes([("lonely", "x")]).is_err());
        assert!(expand_attributes([("kind.name..field", "x")]).is_err());
        assert!(expand_attributes([("kind.name.items[x]", "x")]).is_err());
        assert!(expand_attributes([("kind.name.field?novalue", "x")]).is_err());
        assert!(expand_attributes([("kind.name", "not-an-object")]).is_err());
    }

    #[test]
    fn test_array_index_is_bounded() {
        let err = expand_attributes([(
            "azurerm_container_app.a.template.container[1000000000].image",
            "nginx",
        )])
        .expect_err("huge index");
        assert!(err.to_string().contains("exceeds the limit"));

        let document = expand_attributes([(
            format!("azurerm_container_app.a.items[{MAX_ARRAY_INDEX}]"),
            String::from("last"),
        )])
        .expect("index at the limit");
        let items = &document.resource["azurerm_container_app"]["a"]["items"];
        assert_eq!(items.as_array().map(Vec::len), Some(MAX_ARRAY_INDEX + 1));
        assert_eq!(items[MAX_ARRAY_INDEX], "last");
    }
}
