//! Dependency-ordered reordering of transaction bundle entries.

use std::collections::HashMap;

use serde_json::Value;

const URN_UUID_PREFIX: &str = "urn:uuid:";

/// Reorder the entries of a transaction bundle so that every `urn:uuid:`
/// reference points at an entry appearing earlier in the list.
///
/// Entries in a reference cycle keep their original `POST` position (in
/// traversal order) and are additionally duplicated at the end of the bundle
/// with `request.method` overridden to `PUT`; the creates go through with
/// the cyclic references unresolved and the updates add them back once every
/// member exists.
///
/// References that do not match any entry's `fullUrl` are ignored; absolute
/// and external references are common and not resolvable within the bundle.
/// Entries without a `fullUrl` have no referenceable identity and are
/// emitted after the ordered entries (before any `PUT` duplicates) in input
/// order.
pub fn reorder_bundle(bundle: &Value) -> Value {
    let entries = match bundle.get("entry").and_then(Value::as_array) {
        Some(entries) if !entries.is_empty() => entries,
        _ => return bundle.clone(),
    };

    let graph = EntryGraph::build(entries);
    let sorted = graph.topological_sort();

    let mut reordered: Vec<Value> = sorted
        .order
        .iter()
        .map(|&idx| entries[idx].clone())
        .collect();

    // Entries excluded from the graph keep their relative order.
    for (idx, entry) in entries.iter().enumerate() {
        if entry.get("fullUrl").and_then(Value::as_str).is_none() {
            reordered.push(entry.clone());
        } else {
            debug_assert!(sorted.order.contains(&idx));
        }
    }

    for cycle in &sorted.cycles {
        tracing::debug!(len = cycle.len(), "breaking reference cycle with PUT updates");
        for &idx in cycle {
            let mut duplicate = entries[idx].clone();
            duplicate["request"]["method"] = Value::String("PUT".to_string());
            reordered.push(duplicate);
        }
    }

    let mut result = bundle.clone();
    result["entry"] = Value::Array(reordered);
    result
}

/// Collect the values of `reference` fields starting with `urn:uuid:`,
/// anywhere in the resource tree.
fn collect_urn_references(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                if key == "reference"
                    && let Some(target) = child.as_str()
                    && target.starts_with(URN_UUID_PREFIX)
                {
                    out.push(target.to_string());
                }
                collect_urn_references(child, out);
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_urn_references(item, out);
            }
        }
        _ => {}
    }
}

/// Per-call dependency graph over the entries that carry a `fullUrl`.
/// Edges run from a referenced entry to each entry referencing it, so a
/// depth-first reverse postorder yields "referenced before referencing".
struct EntryGraph {
    /// Entry indices (into the input array) that participate in the graph,
    /// in input order.
    nodes: Vec<usize>,
    /// Adjacency lists, keyed by entry index.
    edges: HashMap<usize, Vec<usize>>,
}

struct SortResult {
    /// Entry indices in dependency order.
    order: Vec<usize>,
    /// One entry-index path per detected cycle, in traversal order.
    cycles: Vec<Vec<usize>>,
}

#[derive(Clone, Copy, PartialEq)]
enum Mark {
    Unvisited,
    Visiting,
    Visited,
}

impl EntryGraph {
    fn build(entries: &[Value]) -> Self {
        let mut index_by_url: HashMap<&str, usize> = HashMap::new();
        let mut nodes = Vec::new();
        for (idx, entry) in entries.iter().enumerate() {
            if let Some(full_url) = entry.get("fullUrl").and_then(Value::as_str) {
                index_by_url.insert(full_url, idx);
                nodes.push(idx);
            }
        }

        let mut edges: HashMap<usize, Vec<usize>> = HashMap::new();
        for &idx in &nodes {
            let Some(resource) = entries[idx].get("resource") else {
                continue;
            };
            let mut references = Vec::new();
            collect_urn_references(resource, &mut references);
            for target in references {
                if let Some(&referenced) = index_by_url.get(target.as_str()) {
                    edges.entry(referenced).or_default().push(idx);
                }
            }
        }

        Self { nodes, edges }
    }

    fn topological_sort(&self) -> SortResult {
        let mut state = SortState {
            mark: HashMap::new(),
            path: Vec::new(),
            postorder: Vec::new(),
            cycles: Vec::new(),
        };
        for &node in &self.nodes {
            self.visit(node, &mut state);
        }
        state.postorder.reverse();
        SortResult {
            order: state.postorder,
            cycles: state.cycles,
        }
    }

    fn visit(&self, node: usize, state: &mut SortState) {
        match state.mark.get(&node).copied().unwrap_or(Mark::Unvisited) {
            Mark::Visited => return,
            Mark::Visiting => {
                // Back edge: the contiguous path segment from the first
                // occurrence of this node is one cycle.
                if let Some(pos) = state.path.iter().position(|&p| p == node) {
                    state.cycles.push(state.path[pos..].to_vec());
                }
                return;
            }
            Mark::Unvisited => {}
        }

        state.mark.insert(node, Mark::Visiting);
        state.path.push(node);
        if let Some(next) = self.edges.get(&node) {
            for &referencing in next {
                self.visit(referencing, state);
            }
        }
        state.path.pop();
        state.mark.insert(node, Mark::Visited);
        state.postorder.push(node);
    }
}

struct SortState {
    mark: HashMap<usize, Mark>,
    path: Vec<usize>,
    postorder: Vec<usize>,
    cycles: Vec<Vec<usize>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_json_diff::assert_json_eq;
    use serde_json::json;

    fn entry(resource_type: &str, full_url: &str, extra: Value) -> Value {
        let mut resource = json!({
            "resourceType": resource_type,
            "id": full_url.split(':').next_back().unwrap(),
        });
        if let (Some(resource_map), Some(extra_map)) =
            (resource.as_object_mut(), extra.as_object())
        {
            for (key, value) in extra_map {
                resource_map.insert(key.clone(), value.clone());
            }
        }
        json!({
            "fullUrl": full_url,
            "resource": resource,
            "request": { "method": "POST", "url": resource_type },
        })
    }

    fn resource_types(bundle: &Value) -> Vec<&str> {
        bundle["entry"]
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["resource"]["resourceType"].as_str().unwrap())
            .collect()
    }

    fn methods(bundle: &Value) -> Vec<&str> {
        bundle["entry"]
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["request"]["method"].as_str().unwrap())
            .collect()
    }

    #[test]
    fn test_reorders_two_element_bundle() {
        let bundle = json!({
            "resourceType": "Bundle",
            "type": "transaction",
            "entry": [
                entry("DiagnosticReport", "urn:uuid:3d8b6e96-6de4-48c1-b7ff-e2c26c924620", json!({
                    "subject": { "reference": "urn:uuid:70653c8f-95e1-4b4e-84e8-8d64c15e4a13" },
                })),
                entry("Patient", "urn:uuid:70653c8f-95e1-4b4e-84e8-8d64c15e4a13", json!({})),
            ],
        });

        let reordered = reorder_bundle(&bundle);
        assert_eq!(resource_types(&reordered), vec!["Patient", "DiagnosticReport"]);
    }

    #[test]
    fn test_already_ordered_bundle_is_unchanged() {
        let bundle = json!({
            "resourceType": "Bundle",
            "type": "transaction",
            "entry": [
                entry("Patient", "urn:uuid:70653c8f-95e1-4b4e-84e8-8d64c15e4a13", json!({})),
                entry("DiagnosticReport", "urn:uuid:3d8b6e96-6de4-48c1-b7ff-e2c26c924620", json!({
                    "subject": { "reference": "urn:uuid:70653c8f-95e1-4b4e-84e8-8d64c15e4a13" },
                })),
            ],
        });

        let reordered = reorder_bundle(&bundle);
        assert_eq!(resource_types(&reordered), vec!["Patient", "DiagnosticReport"]);
        assert_eq!(methods(&reordered), vec!["POST", "POST"]);
    }

    #[test]
    fn test_cycle_appends_put_duplicates() {
        let bundle = json!({
            "resourceType": "Bundle",
            "type": "transaction",
            "entry": [
                entry("ServiceRequest", "urn:uuid:c3d8f926-1f10-41b5-bd20-1d3d6e1f63b5", json!({
                    "subject": { "reference": "urn:uuid:b3e7d3f5-f7c0-41c3-b1c2-8b39e271b2c8" },
                })),
                entry("Specimen", "urn:uuid:b3e7d3f5-f7c0-41c3-b1c2-8b39e271b2c8", json!({
                    "request": [{ "reference": "urn:uuid:c3d8f926-1f10-41b5-bd20-1d3d6e1f63b5" }],
                })),
            ],
        });

        let reordered = reorder_bundle(&bundle);
        assert_eq!(
            resource_types(&reordered),
            vec!["ServiceRequest", "Specimen", "ServiceRequest", "Specimen"]
        );
        assert_eq!(methods(&reordered), vec!["POST", "POST", "PUT", "PUT"]);
    }

    #[test]
    fn test_self_reference_is_a_one_node_cycle() {
        let bundle = json!({
            "resourceType": "Bundle",
            "type": "transaction",
            "entry": [
                entry("Task", "urn:uuid:0a4bbf69-53ba-4e1e-a35e-ce2e7fc62a43", json!({
                    "partOf": [{ "reference": "urn:uuid:0a4bbf69-53ba-4e1e-a35e-ce2e7fc62a43" }],
                })),
            ],
        });

        let reordered = reorder_bundle(&bundle);
        assert_eq!(resource_types(&reordered), vec!["Task", "Task"]);
        assert_eq!(methods(&reordered), vec!["POST", "PUT"]);
    }

    #[test]
    fn test_reorders_lab_bundle() {
        let bundle = json!({
            "resourceType": "Bundle",
            "type": "transaction",
            "entry": [
                entry("Patient", "urn:uuid:ca760a2b-3f5d-4c85-9087-b8b6422970a8", json!({})),
                entry("ServiceRequest", "urn:uuid:76cdff91-2a4d-4c57-8922-2f2ea17f6756", json!({
                    "subject": { "reference": "urn:uuid:ca760a2b-3f5d-4c85-9087-b8b6422970a8" },
                })),
                entry("DiagnosticReport", "urn:uuid:9e1fe992-1e45-4a0e-8dae-cbb8490f449e", json!({
                    "subject": { "reference": "urn:uuid:ca760a2b-3f5d-4c85-9087-b8b6422970a8" },
                    "basedOn": [{ "reference": "urn:uuid:76cdff91-2a4d-4c57-8922-2f2ea17f6756" }],
                    "result": [{ "reference": "urn:uuid:e2d7f292-1e1d-4d5c-9f3a-fae792856f71" }],
                })),
                entry("Observation", "urn:uuid:e2d7f292-1e1d-4d5c-9f3a-fae792856f71", json!({
                    "subject": { "reference": "urn:uuid:ca760a2b-3f5d-4c85-9087-b8b6422970a8" },
                })),
            ],
        });

        let reordered = reorder_bundle(&bundle);
        assert_eq!(
            resource_types(&reordered),
            vec!["Patient", "Observation", "ServiceRequest", "DiagnosticReport"]
        );
    }

    #[test]
    fn test_three_entry_chain_resolves_dependencies() {
        let bundle = json!({
            "resourceType": "Bundle",
            "type": "transaction",
            "entry": [
                entry("Observation", "urn:uuid:1", json!({
                    "subject": { "reference": "urn:uuid:2" },
                })),
                entry("Patient", "urn:uuid:2", json!({})),
                entry("DiagnosticReport", "urn:uuid:3", json!({
                    "result": [{ "reference": "urn:uuid:1" }],
                })),
            ],
        });

        let reordered = reorder_bundle(&bundle);
        let urls: Vec<&str> = reordered["entry"]
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["fullUrl"].as_str().unwrap())
            .collect();
        assert_eq!(urls, vec!["urn:uuid:2", "urn:uuid:1", "urn:uuid:3"]);
    }

    #[test]
    fn test_unresolvable_reference_is_ignored() {
        let bundle = json!({
            "resourceType": "Bundle",
            "type": "transaction",
            "entry": [
                entry("Specimen", "urn:uuid:b3e7d3f5-f7c0-41c3-b1c2-8b39e271b2c8", json!({
                    "subject": { "reference": "urn:uuid:00000000-0000-0000-0000-000000000000" },
                })),
            ],
        });

        let reordered = reorder_bundle(&bundle);
        assert_eq!(resource_types(&reordered), vec!["Specimen"]);
        assert_eq!(methods(&reordered), vec!["POST"]);
    }

    #[test]
    fn test_entries_without_full_url_keep_relative_order() {
        let bundle = json!({
            "resourceType": "Bundle",
            "type": "transaction",
            "entry": [
                { "resource": { "resourceType": "Provenance" }, "request": { "method": "POST", "url": "Provenance" } },
                entry("Patient", "urn:uuid:ca760a2b-3f5d-4c85-9087-b8b6422970a8", json!({})),
                { "resource": { "resourceType": "AuditEvent" }, "request": { "method": "POST", "url": "AuditEvent" } },
            ],
        });

        let reordered = reorder_bundle(&bundle);
        assert_eq!(
            resource_types(&reordered),
            vec!["Patient", "Provenance", "AuditEvent"]
        );
    }

    #[test]
    fn test_empty_and_entryless_bundles_pass_through() {
        let bundle = json!({ "resourceType": "Bundle", "type": "transaction" });
        assert_json_eq!(reorder_bundle(&bundle), bundle);

        let bundle = json!({ "resourceType": "Bundle", "type": "transaction", "entry": [] });
        assert_json_eq!(reorder_bundle(&bundle), bundle);
    }
}
