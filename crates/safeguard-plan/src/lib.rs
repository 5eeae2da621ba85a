#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use safeguard_domain::{
    ensure_non_empty, hash_bytes, hash_json, ChangeSetDocument, ChangeSetEnvelope, PatchOperation,
};

/// Load a change-set document (YAML or JSON) from disk and normalize it.
///
/// # Errors
/// Returns an error when the file cannot be read, parsed, validated, or normalized.
pub fn load_change_set_from_path(path: &Path) -> Result<ChangeSetEnvelope> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read change set at {}", path.display()))?;
    let source_format = match path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => "json",
        _ => "yaml",
    };
    normalize_change_set(&content, source_format)
}

/// Normalize a change-set document into deterministic canonical JSON + hash.
///
/// JSON input is accepted through the YAML parser.
///
/// # Errors
/// Returns an error when parsing, validation, or serialization fails.
pub fn normalize_change_set(source: &str, source_format: &str) -> Result<ChangeSetEnvelope> {
    let source_hash = hash_bytes(source.as_bytes());
    let mut document: ChangeSetDocument = serde_yaml::from_str(source)
        .map_err(|err| anyhow!("invalid change set structure: {err}"))?;

    validate_document(&document)?;
    normalize_document(&mut document);
    validate_document(&document)?;

    let normalized_json = serde_json::to_value(&document)?;
    let normalized_hash = hash_json(&normalized_json)?;

    Ok(ChangeSetEnvelope {
        source_format: source_format.to_string(),
        source_hash,
        normalized_hash,
        document,
        normalized_json,
    })
}

fn validate_document(document: &ChangeSetDocument) -> Result<()> {
    ensure_non_empty("change_set_name", &document.change_set.change_set_name)?;
    if document.change_set.operations.is_empty() {
        return Err(anyhow!("change set MUST contain at least one operation"));
    }

    for (resource, fields) in &document.scope.resources {
        ensure_non_empty("scope resource", resource.as_str())?;
        for field in fields {
            ensure_non_empty("scope field", field)?;
        }
    }

    let mut seen: BTreeSet<(&str, &str)> = BTreeSet::new();
    for operation in &document.change_set.operations {
        validate_operation(operation)?;
        for field in operation.fields.keys() {
            if !seen.insert((operation.resource.as_str(), field.as_str())) {
                return Err(anyhow!(
                    "field {}.{} is modified by more than one operation",
                    operation.resource,
                    field
                ));
            }
        }
    }

    Ok(())
}

fn validate_operation(operation: &PatchOperation) -> Result<()> {
    ensure_non_empty("operation resource", operation.resource.as_str())?;
    if operation.fields.is_empty() {
        return Err(anyhow!(
            "operation on {} MUST modify at least one field",
            operation.resource
        ));
    }
    for field in operation.fields.keys() {
        ensure_non_empty("operation field", field)?;
    }
    Ok(())
}

fn normalize_document(document: &mut ChangeSetDocument) {
    document.change_set.change_set_name = document.change_set.change_set_name.trim().to_string();
    document.change_set.description = document
        .change_set
        .description
        .as_ref()
        .map(|text| text.trim().to_string())
        .filter(|text| !text.is_empty());

    // Stable sort keeps the submitted order of operations on the same resource.
    document
        .change_set
        .operations
        .sort_by(|lhs, rhs| lhs.resource.cmp(&rhs.resource));
}

#[cfg(test)]
mod tests {
    use super::normalize_change_set;
    use safeguard_domain::{ApplyMode, ResourceRef};

    const DOCUMENT: &str = r#"
scope:
  resources:
    page/home: [title, body]
    page/about: [title]
mode: publish
change_set:
  change_set_name: "  spring refresh  "
  operations:
    - resource: page/home
      fields: { title: "Welcome", body: "Hello" }
    - resource: page/about
      fields: { title: "About us" }
"#;

    #[test]
    fn normalize_hash_is_stable() {
        let first = normalize_change_set(DOCUMENT, "yaml");
        let second = normalize_change_set(DOCUMENT, "yaml");
        assert!(first.is_ok());
        assert!(second.is_ok());
        match (first, second) {
            (Ok(first), Ok(second)) => assert_eq!(first.normalized_hash, second.normalized_hash),
            _ => unreachable!(),
        }
    }

    #[test]
    fn operations_are_ordered_by_resource_and_name_is_trimmed() {
        let envelope = normalize_change_set(DOCUMENT, "yaml");
        assert!(envelope.is_ok());
        let envelope = envelope.unwrap_or_else(|_| unreachable!());
        assert_eq!(envelope.document.mode, ApplyMode::Publish);
        assert_eq!(
            envelope.document.change_set.change_set_name,
            "spring refresh"
        );
        assert_eq!(
            envelope.document.change_set.touched_resources(),
            vec![ResourceRef::new("page/about"), ResourceRef::new("page/home")]
        );
        assert_eq!(
            envelope.document.change_set.operations[0].resource,
            ResourceRef::new("page/about")
        );
    }

    #[test]
    fn json_documents_are_accepted() {
        let json = r#"{
            "scope": {"resources": {"r1": ["a"]}},
            "change_set": {
                "change_set_name": "cs",
                "operations": [{"resource": "r1", "fields": {"a": 1}}]
            }
        }"#;
        let envelope = normalize_change_set(json, "json");
        assert!(envelope.is_ok());
        let envelope = envelope.unwrap_or_else(|_| unreachable!());
        assert_eq!(envelope.source_format, "json");
        assert_eq!(envelope.document.mode, ApplyMode::Draft);
    }

    #[test]
    fn empty_operations_and_duplicate_fields_are_rejected() {
        let empty = r"
scope: { resources: { r1: [a] } }
change_set: { change_set_name: cs, operations: [] }
";
        assert!(normalize_change_set(empty, "yaml").is_err());

        let duplicate = r"
scope: { resources: { r1: [a] } }
change_set:
  change_set_name: cs
  operations:
    - { resource: r1, fields: { a: 1 } }
    - { resource: r1, fields: { a: 2 } }
";
        assert!(normalize_change_set(duplicate, "yaml").is_err());

        let no_fields = r"
scope: { resources: { r1: [a] } }
change_set:
  change_set_name: cs
  operations:
    - { resource: r1, fields: {} }
";
        assert!(normalize_change_set(no_fields, "yaml").is_err());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let unknown = r"
scope: { resources: { r1: [a] } }
change_set:
  change_set_name: cs
  operations:
    - { resource: r1, fields: { a: 1 }, force: true }
";
        assert!(normalize_change_set(unknown, "yaml").is_err());
    }
}
