//! Manifest decoding
//!
//! Turns a byte stream of concatenated YAML or JSON documents into
//! `DynamicObject`s ready for server-side apply. JSON is accepted as-is
//! since every JSON document is also a YAML document.

use kube::api::DynamicObject;
use serde_json::Value;
use tracing::debug;

use crate::resource::ResourceRef;
use crate::yaml::parse_yaml_multi;
use crate::{Error, Result};

/// Decode every object in a multi-document stream.
///
/// Empty and comment-only documents are skipped. `*List` documents
/// (`kind: List`, `kind: ConfigMapList`, ...) are flattened into their items.
/// Every object must carry `apiVersion`, `kind` and `metadata.name`.
pub fn decode_manifests(input: &str) -> Result<Vec<DynamicObject>> {
    let docs = parse_yaml_multi(input)
        .map_err(|e| Error::serialization(format!("failed to parse manifest: {}", e)))?;

    let mut objects = Vec::new();
    for (index, doc) in docs.into_iter().enumerate() {
        match doc {
            Value::Null => {
                debug!(document = index, "skipping empty document");
            }
            Value::Object(_) if is_list(&doc) => {
                let items = match doc.get("items") {
                    Some(Value::Array(items)) => items.clone(),
                    Some(Value::Null) | None => Vec::new(),
                    Some(_) => {
                        return Err(Error::validation_for_field(
                            format!("documents[{index}].items"),
                            "list items must be an array",
                        ))
                    }
                };
                for (item_index, item) in items.into_iter().enumerate() {
                    objects.push(decode_object(
                        item,
                        &format!("documents[{index}].items[{item_index}]"),
                    )?);
                }
            }
            Value::Object(_) => objects.push(decode_object(doc, &format!("documents[{index}]"))?),
            other => {
                return Err(Error::validation_for_field(
                    format!("documents[{index}]"),
                    format!("expected an object, found {}", json_type(&other)),
                ))
            }
        }
    }
    Ok(objects)
}

fn is_list(doc: &Value) -> bool {
    doc.get("kind")
        .and_then(Value::as_str)
        .is_some_and(|kind| kind.ends_with("List"))
        && doc.get("items").is_some()
}

fn decode_object(value: Value, path: &str) -> Result<DynamicObject> {
    let kind = value
        .get("kind")
        .and_then(Value::as_str)
        .map(str::to_string);
    let obj: DynamicObject = serde_json::from_value(value).map_err(|e| Error::Serialization {
        message: format!("{path}: {e}"),
        kind: kind.clone(),
    })?;
    // Surface the missing field with the document position attached
    ResourceRef::from_object(&obj).map_err(|e| match e {
        Error::Validation { message, field } => Error::Validation {
            message: format!("{path}: {message}"),
            field,
        },
        other => other,
    })?;
    Ok(obj)
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
