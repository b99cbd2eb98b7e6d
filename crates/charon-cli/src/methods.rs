//! Selection of the RPC methods a binary forwards.
//!
//! Methods come from the `--methods` list and/or a JSON interface
//! specification file, minus the `--methods_exclude` list.  The JSON
//! specification is an array of method descriptions; entries without a
//! `returns` member are notifications and are skipped.

use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{ensure, Context, Result};
use serde_json::Value;
use tracing::info;

fn parse_comma_separated(list: &str) -> BTreeSet<String> {
    if list.is_empty() {
        return BTreeSet::new();
    }
    list.split(',').map(str::to_string).collect()
}

/// Loads the method names from a JSON interface specification file.
pub fn methods_from_json_spec(file: &Path) -> Result<BTreeSet<String>> {
    info!(file = %file.display(), "loading JSON specification file");
    let text = std::fs::read_to_string(file)
        .with_context(|| format!("failed to open JSON spec file {}", file.display()))?;
    let spec: Value = serde_json::from_str(&text)
        .with_context(|| format!("failed to parse JSON spec file {}", file.display()))?;

    let entries = spec
        .as_array()
        .with_context(|| format!("invalid JSON specification: {spec}"))?;

    let mut result = BTreeSet::new();
    for entry in entries {
        ensure!(entry.is_object(), "invalid spec entry: {entry}");
        let name = entry
            .get("name")
            .and_then(Value::as_str)
            .with_context(|| format!("spec entry without name: {entry}"))?;
        if entry.get("returns").is_some() {
            info!(name, "using method from JSON spec");
            result.insert(name.to_string());
        } else {
            info!(name, "ignoring notification");
        }
    }

    Ok(result)
}

/// Computes the selected method set: (methods ∪ json spec) − excluded.
pub fn selected_methods(
    methods: &str,
    json_spec: Option<&Path>,
    exclude: &str,
) -> Result<BTreeSet<String>> {
    let mut selected = parse_comma_separated(methods);
    if let Some(file) = json_spec {
        selected.extend(methods_from_json_spec(file)?);
    }

    for excluded in parse_comma_separated(exclude) {
        selected.remove(&excluded);
    }

    Ok(selected)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comma_separated_lists_are_parsed() {
        assert!(parse_comma_separated("").is_empty());
        assert_eq!(
            parse_comma_separated("foo,bar"),
            BTreeSet::from(["foo".to_string(), "bar".to_string()])
        );
    }

    #[test]
    fn exclusion_is_applied_after_union() {
        let selected = selected_methods("a,b,c", None, "b").unwrap();
        assert_eq!(
            selected,
            BTreeSet::from(["a".to_string(), "c".to_string()])
        );
    }

    #[test]
    fn json_spec_skips_notifications() {
        let dir = std::env::temp_dir();
        let file = dir.join(format!("charon-methods-spec-{}.json", std::process::id()));
        std::fs::write(
            &file,
            r#"[
                {"name": "getstate", "returns": {}},
                {"name": "notifyme", "params": []}
            ]"#,
        )
        .unwrap();

        let methods = methods_from_json_spec(&file).unwrap();
        assert_eq!(methods, BTreeSet::from(["getstate".to_string()]));

        let selected = selected_methods("extra", Some(&file), "").unwrap();
        assert_eq!(
            selected,
            BTreeSet::from(["extra".to_string(), "getstate".to_string()])
        );

        std::fs::remove_file(&file).unwrap();
    }

    #[test]
    fn malformed_spec_is_rejected() {
        let dir = std::env::temp_dir();
        let file = dir.join(format!("charon-methods-bad-{}.json", std::process::id()));
        std::fs::write(&file, r#"{"not": "an array"}"#).unwrap();

        assert!(methods_from_json_spec(&file).is_err());
        std::fs::remove_file(&file).unwrap();
    }
}
