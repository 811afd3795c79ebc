//! Conversion of arbitrary bundles and contained resources into
//! dependency-ordered transaction bundles.

use std::collections::HashMap;

use serde_json::{Value, json};
use uuid::Uuid;

use crate::reorder::reorder_bundle;

/// Convert a bundle of resources into a transaction bundle.
///
/// Each entry receives a fresh `urn:uuid:` fullUrl; references that pointed
/// at a sibling entry's previous `fullUrl` or `ResourceType/id` identity are
/// rewritten to the new uuid. A `request` of `POST` to the resource type is
/// filled in where missing. The result is reordered so that rewritten
/// references resolve in creation order.
///
/// References that match nothing in the bundle (external or absolute
/// references) are left untouched.
pub fn convert_to_transaction_bundle(bundle: &Value) -> Value {
    let entries = match bundle.get("entry").and_then(Value::as_array) {
        Some(entries) => entries,
        None => {
            return json!({
                "resourceType": "Bundle",
                "type": "transaction",
                "entry": [],
            });
        }
    };

    let mut rewrites: HashMap<String, String> = HashMap::new();
    let mut new_entries: Vec<Value> = Vec::with_capacity(entries.len());

    for entry in entries {
        let Some(resource) = entry.get("resource") else {
            continue;
        };
        let full_url = format!("urn:uuid:{}", Uuid::new_v4());

        if let Some(old_url) = entry.get("fullUrl").and_then(Value::as_str) {
            rewrites.insert(old_url.to_string(), full_url.clone());
        }
        if let (Some(resource_type), Some(id)) = (
            resource.get("resourceType").and_then(Value::as_str),
            resource.get("id").and_then(Value::as_str),
        ) {
            rewrites.insert(format!("{resource_type}/{id}"), full_url.clone());
        }

        let request = entry.get("request").cloned().unwrap_or_else(|| {
            json!({
                "method": "POST",
                "url": resource.get("resourceType").and_then(Value::as_str).unwrap_or_default(),
            })
        });

        new_entries.push(json!({
            "fullUrl": full_url,
            "resource": resource.clone(),
            "request": request,
        }));
    }

    for entry in &mut new_entries {
        if let Some(resource) = entry.get_mut("resource") {
            rewrite_references(resource, &rewrites);
        }
    }

    reorder_bundle(&json!({
        "resourceType": "Bundle",
        "type": "transaction",
        "entry": new_entries,
    }))
}

/// Hoist a resource's `contained` resources into their own transaction
/// bundle entries, rewriting `#id` local references to the new `urn:uuid:`
/// fullUrls. The root resource becomes an entry of the same bundle.
pub fn convert_contained_resources_to_bundle(resource: &Value) -> Value {
    let mut root = resource.clone();
    let contained = match root.as_object_mut() {
        Some(map) => map.remove("contained"),
        None => None,
    };
    let contained = contained
        .and_then(|v| v.as_array().cloned())
        .unwrap_or_default();

    let mut rewrites: HashMap<String, String> = HashMap::new();
    let mut entries: Vec<Value> = Vec::with_capacity(contained.len() + 1);

    for inner in &contained {
        let full_url = format!("urn:uuid:{}", Uuid::new_v4());
        let mut hoisted = inner.clone();
        if let Some(map) = hoisted.as_object_mut() {
            let removed = map.remove("id");
            if let Some(id) = removed.as_ref().and_then(Value::as_str) {
                // The local id only existed to anchor `#id` references.
                rewrites.insert(format!("#{id}"), full_url.clone());
            }
        }
        entries.push(json!({
            "fullUrl": full_url,
            "resource": hoisted,
            "request": {
                "method": "POST",
                "url": inner.get("resourceType").and_then(Value::as_str).unwrap_or_default(),
            },
        }));
    }

    entries.push(json!({
        "fullUrl": format!("urn:uuid:{}", Uuid::new_v4()),
        "resource": root,
        "request": {
            "method": "POST",
            "url": resource.get("resourceType").and_then(Value::as_str).unwrap_or_default(),
        },
    }));

    for entry in &mut entries {
        if let Some(resource) = entry.get_mut("resource") {
            rewrite_references(resource, &rewrites);
        }
    }

    reorder_bundle(&json!({
        "resourceType": "Bundle",
        "type": "transaction",
        "entry": entries,
    }))
}

/// Replace every `reference` field whose value appears in the rewrite map.
fn rewrite_references(value: &mut Value, rewrites: &HashMap<String, String>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map.iter_mut() {
                if key == "reference"
                    && let Some(target) = child.as_str()
                    && let Some(replacement) = rewrites.get(target)
                {
                    *child = Value::String(replacement.clone());
                    continue;
                }
                rewrite_references(child, rewrites);
            }
        }
        Value::Array(items) => {
            for item in items {
                rewrite_references(item, rewrites);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn is_urn_uuid(value: &Value) -> bool {
        value
            .as_str()
            .is_some_and(|s| s.starts_with("urn:uuid:") && s.len() == "urn:uuid:".len() + 36)
    }

    #[test]
    fn test_builds_requests_from_resource_type() {
        let input = json!({
            "entry": [
                {
                    "fullUrl": "example.com",
                    "resource": { "resourceType": "Patient", "id": "123", "meta": {} },
                },
                {
                    "fullUrl": "app.example.com/123",
                    "resource": { "resourceType": "Patient", "id": "456", "meta": {} },
                },
            ],
        });

        let transaction = convert_to_transaction_bundle(&input);
        assert_eq!(transaction["type"], "transaction");
        let first = &transaction["entry"][0];
        assert_eq!(first["request"]["method"], "POST");
        assert_eq!(first["request"]["url"], "Patient");
        assert!(is_urn_uuid(&first["fullUrl"]));
    }

    #[test]
    fn test_rewrites_type_id_references_between_entries() {
        let input = json!({
            "resourceType": "Bundle",
            "type": "collection",
            "entry": [
                {
                    "fullUrl": "http://hl7.org/fhir/us/cancer-reporting/Specimen/adrenal-example",
                    "resource": {
                        "resourceType": "Specimen",
                        "id": "adrenal-example",
                        "subject": { "reference": "Patient/JoelAlexPatient" },
                    },
                },
                {
                    "fullUrl": "http://hl7.org/fhir/us/cancer-reporting/Patient/JoelAlexPatient",
                    "resource": {
                        "resourceType": "Patient",
                        "id": "JoelAlexPatient",
                        "gender": "male",
                    },
                },
            ],
        });

        let transaction = convert_to_transaction_bundle(&input);
        let entries = transaction["entry"].as_array().unwrap();
        assert_eq!(entries[0]["resource"]["resourceType"], "Patient");
        assert_eq!(entries[1]["resource"]["resourceType"], "Specimen");

        // The Specimen's subject now points at the Patient entry's new uuid.
        let subject = &entries[1]["resource"]["subject"]["reference"];
        assert_eq!(subject, &entries[0]["fullUrl"]);
    }

    #[test]
    fn test_unrecognized_references_are_untouched() {
        let input = json!({
            "resourceType": "Bundle",
            "entry": [
                {
                    "fullUrl": "https://example.com/Specimen/xyz",
                    "resource": {
                        "resourceType": "Specimen",
                        "subject": { "reference": "Patient/xyz" },
                    },
                },
            ],
        });

        let transaction = convert_to_transaction_bundle(&input);
        assert_eq!(
            transaction["entry"][0]["resource"]["subject"]["reference"],
            "Patient/xyz"
        );
    }

    #[test]
    fn test_simple_resource_becomes_single_entry() {
        let input = json!({ "resourceType": "Patient" });
        let bundle = convert_contained_resources_to_bundle(&input);

        assert_eq!(bundle["resourceType"], "Bundle");
        assert_eq!(bundle["type"], "transaction");
        let entries = bundle["entry"].as_array().unwrap();
        assert_eq!(entries.len(), 1);
        assert!(is_urn_uuid(&entries[0]["fullUrl"]));
        assert_eq!(entries[0]["request"]["method"], "POST");
        assert_eq!(entries[0]["request"]["url"], "Patient");
        assert_eq!(entries[0]["resource"]["resourceType"], "Patient");
    }

    #[test]
    fn test_contained_observations_are_hoisted_and_ordered() {
        let input = json!({
            "resourceType": "DiagnosticReport",
            "contained": [
                {
                    "resourceType": "Observation",
                    "id": "123",
                    "hasMember": [{ "reference": "#456" }],
                },
                {
                    "resourceType": "Observation",
                    "id": "456",
                },
            ],
            "result": [{ "reference": "#123" }],
        });

        let bundle = convert_contained_resources_to_bundle(&input);
        let entries = bundle["entry"].as_array().unwrap();
        assert_eq!(entries.len(), 3);

        // Leaf observation first, then its referrer, then the root report.
        assert_eq!(entries[0]["resource"]["resourceType"], "Observation");
        assert!(entries[0]["resource"].get("hasMember").is_none());
        assert_eq!(entries[1]["resource"]["resourceType"], "Observation");
        assert_eq!(
            &entries[1]["resource"]["hasMember"][0]["reference"],
            &entries[0]["fullUrl"]
        );
        assert_eq!(entries[2]["resource"]["resourceType"], "DiagnosticReport");
        assert_eq!(
            &entries[2]["resource"]["result"][0]["reference"],
            &entries[1]["fullUrl"]
        );
    }
}
