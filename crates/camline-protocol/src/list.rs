//! Compact tabular list decoding.
//!
//! Bulk-list messages encode many records in one payload: the first element
//! is a schema describing field positions, the rest are rows. A schema entry
//! is either a bare field name or a single-key mapping from a group name to
//! its subfield names (a nested record flattened for transmission):
//!
//! ```text
//! [["uid", {"session": ["vs", "camscore"]}],   <- schema
//!  [12345, [0, 99]],                           <- row (array form)
//!  {"uid": 67890}]                             <- row (already a mapping)
//! ```

use serde_json::{Map, Value};

/// One schema entry: a scalar field, or a group whose row item is a nested
/// array of subfield values.
enum Slot<'a> {
    Field(&'a str),
    Group(&'a str, Vec<&'a str>),
}

/// Ordered slot list matching row positions, one slot per schema entry.
fn schema_slots(schema: &Value) -> Vec<Slot<'_>> {
    let mut slots = Vec::new();
    let Some(entries) = schema.as_array() else {
        return slots;
    };
    for entry in entries {
        match entry {
            Value::String(name) => slots.push(Slot::Field(name)),
            Value::Object(groups) => {
                for (group, subfields) in groups {
                    let Some(subfields) = subfields.as_array() else {
                        continue;
                    };
                    let names = subfields.iter().filter_map(Value::as_str).collect();
                    slots.push(Slot::Group(group, names));
                }
            }
            _ => {}
        }
    }
    slots
}

/// Expands a schema-plus-rows list into a sequence of mappings, one per row,
/// in input order.
///
/// Array rows are walked in lockstep with the schema slots, one row item
/// per slot: a scalar slot sets the field directly; a group slot takes the
/// row item as a nested array and zips it against the group's subfield
/// names into a mapping under the group key. Rows that are already mappings pass
/// through unchanged. Input that is not a non-empty array is returned
/// unchanged, a deliberate leniency for already-decoded or empty payloads.
pub fn expand_rows(data: &Value) -> Value {
    let rows = match data.as_array() {
        Some(rows) if !rows.is_empty() => rows,
        _ => return data.clone(),
    };

    let slots = schema_slots(&rows[0]);
    let mut result = Vec::with_capacity(rows.len() - 1);

    for row in &rows[1..] {
        match row {
            Value::Array(items) => {
                let mut record = Map::new();
                for (item, slot) in items.iter().zip(&slots) {
                    match slot {
                        Slot::Field(field) => {
                            record.insert((*field).to_string(), item.clone());
                        }
                        Slot::Group(group, subfields) => {
                            let mut nested = Map::new();
                            match item.as_array() {
                                Some(values) => {
                                    for (value, subfield) in values.iter().zip(subfields) {
                                        nested.insert((*subfield).to_string(), value.clone());
                                    }
                                }
                                // A non-array group item keeps its first
                                // subfield's name rather than being dropped.
                                None => {
                                    if let Some(subfield) = subfields.first() {
                                        nested.insert((*subfield).to_string(), item.clone());
                                    }
                                }
                            }
                            record.insert((*group).to_string(), Value::Object(nested));
                        }
                    }
                }
                result.push(Value::Object(record));
            }
            Value::Object(_) => result.push(row.clone()),
            _ => {}
        }
    }

    Value::Array(result)
}
