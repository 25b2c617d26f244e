// Helpers for pulling typed values out of KDL nodes.

use kdl::KdlNode;

use crate::{ConfigError, ConfigResult};

pub(crate) fn first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

pub(crate) fn all_string_args(node: &KdlNode) -> Vec<String> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .filter_map(|e| e.value().as_string())
        .map(|s| s.to_string())
        .collect()
}

pub(crate) fn string_prop(node: &KdlNode, name: &str) -> Option<String> {
    node.get(name)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

pub(crate) fn bool_prop(node: &KdlNode, name: &str) -> ConfigResult<Option<bool>> {
    match node.get(name) {
        None => Ok(None),
        Some(value) => value
            .as_bool()
            .map(Some)
            .ok_or_else(|| invalid(node, name, "expected #true or #false")),
    }
}

pub(crate) fn u64_prop(node: &KdlNode, name: &str) -> ConfigResult<Option<u64>> {
    match node.get(name) {
        None => Ok(None),
        Some(value) => value
            .as_integer()
            .and_then(|i| u64::try_from(i).ok())
            .map(Some)
            .ok_or_else(|| invalid(node, name, "expected a non-negative integer")),
    }
}

/// Values of a property that may repeat (`next="a" next="b"`) or be given as
/// a child node (`next "a" "b"`).
pub(crate) fn string_list_prop(node: &KdlNode, name: &str) -> Vec<String> {
    let repeated: Vec<String> = node
        .entries()
        .iter()
        .filter(|e| e.name().is_some_and(|n| n.value() == name))
        .filter_map(|e| e.value().as_string())
        .map(|s| s.to_string())
        .collect();
    if !repeated.is_empty() {
        return repeated;
    }

    node.children()
        .and_then(|children| {
            children
                .nodes()
                .iter()
                .find(|child| child.name().value() == name)
        })
        .map(all_string_args)
        .unwrap_or_default()
}

fn invalid(node: &KdlNode, name: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: format!("{}.{}", node.name().value(), name),
        message: message.to_string(),
    }
}
