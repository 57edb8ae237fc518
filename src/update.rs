use serde_json::{Map, Value, json};

use crate::ClientError;
use crate::identifiers::Identifier;

/// Fields the service maintains itself; never sent in an update.
const READ_ONLY_FIELDS: &[&str] = &["createdTime", "lastUpdatedTime"];

/// How a full resource is turned into an update object.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum UpdateMode {
    /// Every field is overwritten; `null` clears it.
    #[default]
    Replace,
    /// Objects and arrays are merged into what is stored; `null` fields are left alone.
    Patch,
}

/// Builds `{"id"|"externalId": ..., "update": {...}}` from a full resource.
///
/// The item is addressed by `id` when it has one, which leaves `externalId`
/// free to be updated.
pub fn to_update_item(item: &Value, mode: UpdateMode) -> Result<Value, ClientError> {
    let fields = item
        .as_object()
        .ok_or_else(|| ClientError::InvalidItem("update items must be JSON objects".to_owned()))?;
    let identifier = Identifier::from_json(item).ok_or_else(|| {
        ClientError::InvalidItem(format!("item has no id or externalId: {item}"))
    })?;
    let address = match &identifier {
        Identifier::Id(_) => "id",
        Identifier::ExternalId(_) => "externalId",
        Identifier::Composite { .. } => {
            return Err(ClientError::InvalidItem(
                "instances are written with create, not update objects".to_owned(),
            ));
        }
    };

    let mut update = Map::new();
    for (name, value) in fields {
        if name == address || READ_ONLY_FIELDS.contains(&name.as_str()) {
            continue;
        }
        if let Some(operation) = field_operation(value, mode) {
            update.insert(name.clone(), operation);
        }
    }

    let mut shaped = identifier.to_json();
    if let Value::Object(object) = &mut shaped {
        object.insert("update".to_owned(), Value::Object(update));
    }
    Ok(shaped)
}

fn field_operation(value: &Value, mode: UpdateMode) -> Option<Value> {
    match (mode, value) {
        (UpdateMode::Replace, Value::Null) => Some(json!({ "setNull": true })),
        (UpdateMode::Replace, value) => Some(json!({ "set": value })),
        (UpdateMode::Patch, Value::Null) => None,
        (UpdateMode::Patch, Value::Object(_) | Value::Array(_)) => Some(json!({ "add": value })),
        (UpdateMode::Patch, value) => Some(json!({ "set": value })),
    }
}
