use std::collections::BTreeMap;

use indexmap::IndexMap;

use crate::value::FormValue;

/// Validity and value a child reports to its parent.
#[derive(Clone, Debug, PartialEq)]
pub struct NodeEntry {
    pub valid: bool,
    pub value: FormValue,
}

impl NodeEntry {
    pub fn new(valid: bool, value: impl Into<FormValue>) -> Self {
        Self {
            valid,
            value: value.into(),
        }
    }
}

/// Folds object-group children in insertion order.
pub fn flatten_object(children: &IndexMap<String, NodeEntry>) -> NodeEntry {
    let mut valid = true;
    let mut value = IndexMap::with_capacity(children.len());
    for (name, entry) in children {
        valid &= entry.valid;
        value.insert(name.clone(), entry.value.clone());
    }
    NodeEntry {
        valid,
        value: FormValue::Map(value),
    }
}

/// Folds array-group children by ascending index.
pub fn flatten_array(children: &BTreeMap<usize, NodeEntry>) -> NodeEntry {
    let mut valid = true;
    let mut items = Vec::with_capacity(children.len());
    for entry in children.values() {
        valid &= entry.valid;
        items.push(entry.value.clone());
    }
    NodeEntry {
        valid,
        value: FormValue::List(items),
    }
}
