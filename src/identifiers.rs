use serde_json::{Map, Value, json};

use crate::ClientError;

/// Reference to a single remote resource.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Identifier {
    /// Internal numeric id assigned by the service.
    Id(i64),
    /// Caller-assigned external id.
    ExternalId(String),
    /// Data-modeling reference scoped to a space, optionally versioned.
    Composite {
        space: String,
        external_id: String,
        version: Option<String>,
    },
}

impl Identifier {
    pub fn composite(space: impl Into<String>, external_id: impl Into<String>) -> Self {
        Self::Composite {
            space: space.into(),
            external_id: external_id.into(),
            version: None,
        }
    }

    pub fn versioned(
        space: impl Into<String>,
        external_id: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self::Composite {
            space: space.into(),
            external_id: external_id.into(),
            version: Some(version.into()),
        }
    }

    /// Wire form: `{"id": ..}`, `{"externalId": ..}` or
    /// `{"space": .., "externalId": .., "version": ..}`.
    pub fn to_json(&self) -> Value {
        match self {
            Self::Id(id) => json!({ "id": id }),
            Self::ExternalId(external_id) => json!({ "externalId": external_id }),
            Self::Composite {
                space,
                external_id,
                version,
            } => {
                let mut object = Map::new();
                object.insert("space".to_owned(), json!(space));
                object.insert("externalId".to_owned(), json!(external_id));
                if let Some(version) = version {
                    object.insert("version".to_owned(), json!(version));
                }
                Value::Object(object)
            }
        }
    }

    /// Extracts the identifier of a resource or identifier object.
    ///
    /// Composite identifiers take precedence when `space` is present, then
    /// `id`, then `externalId`.
    pub fn from_json(value: &Value) -> Option<Self> {
        let external_id = value.get("externalId").and_then(Value::as_str);
        if let (Some(space), Some(external_id)) =
            (value.get("space").and_then(Value::as_str), external_id)
        {
            return Some(Self::Composite {
                space: space.to_owned(),
                external_id: external_id.to_owned(),
                version: value
                    .get("version")
                    .and_then(Value::as_str)
                    .map(str::to_owned),
            });
        }
        if let Some(id) = value.get("id").and_then(Value::as_i64) {
            return Some(Self::Id(id));
        }
        external_id.map(|external_id| Self::ExternalId(external_id.to_owned()))
    }

    /// True when `resource` is the one this identifier refers to.
    ///
    /// Versions are not compared.
    pub fn addresses(&self, resource: &Value) -> bool {
        let field = |key: &str| resource.get(key).and_then(Value::as_str);
        match self {
            Self::Id(id) => resource.get("id").and_then(Value::as_i64) == Some(*id),
            Self::ExternalId(external_id) => field("externalId") == Some(external_id.as_str()),
            Self::Composite {
                space, external_id, ..
            } => {
                field("space") == Some(space.as_str())
                    && field("externalId") == Some(external_id.as_str())
            }
        }
    }
}

impl From<i64> for Identifier {
    fn from(id: i64) -> Self {
        Self::Id(id)
    }
}

impl From<&str> for Identifier {
    fn from(external_id: &str) -> Self {
        Self::ExternalId(external_id.to_owned())
    }
}

impl From<String> for Identifier {
    fn from(external_id: String) -> Self {
        Self::ExternalId(external_id)
    }
}

/// Ordered identifiers for one call.
///
/// A sequence built from a single identifier (rather than a one-element
/// list) is a singleton request: its result is one optional resource, and
/// an unknown identifier yields `None` instead of an error.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IdentifierSequence {
    identifiers: Vec<Identifier>,
    is_singleton: bool,
}

impl IdentifierSequence {
    /// A batch request, even when `identifiers` has one element.
    pub fn new(identifiers: Vec<Identifier>) -> Self {
        Self {
            identifiers,
            is_singleton: false,
        }
    }

    /// A singleton request for exactly one resource.
    pub fn single(identifier: impl Into<Identifier>) -> Self {
        Self {
            identifiers: vec![identifier.into()],
            is_singleton: true,
        }
    }

    /// Batch request mixing internal and external ids, ids first.
    pub fn load(ids: &[i64], external_ids: &[&str]) -> Self {
        let identifiers = ids
            .iter()
            .copied()
            .map(Identifier::Id)
            .chain(external_ids.iter().map(|&external_id| external_id.into()))
            .collect();
        Self::new(identifiers)
    }

    pub fn is_singleton(&self) -> bool {
        self.is_singleton
    }

    pub fn len(&self) -> usize {
        self.identifiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identifiers.is_empty()
    }

    pub fn identifiers(&self) -> &[Identifier] {
        &self.identifiers
    }

    /// Fails with [`ClientError::EmptyInput`] for an empty sequence.
    pub fn ensure_non_empty(&self) -> Result<(), ClientError> {
        if self.is_empty() {
            Err(ClientError::EmptyInput)
        } else {
            Ok(())
        }
    }

    /// Splits into consecutive sub-sequences of at most `size` identifiers.
    ///
    /// Chunks are never singletons. A zero `size` is treated as one.
    pub fn chunks(&self, size: usize) -> Vec<Self> {
        self.identifiers
            .chunks(size.max(1))
            .map(|chunk| Self::new(chunk.to_vec()))
            .collect()
    }

    /// Wire form of every identifier, in order.
    pub fn as_items(&self) -> Vec<Value> {
        self.identifiers.iter().map(Identifier::to_json).collect()
    }
}

impl FromIterator<Identifier> for IdentifierSequence {
    fn from_iter<T: IntoIterator<Item = Identifier>>(iter: T) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a IdentifierSequence {
    type Item = &'a Identifier;
    type IntoIter = std::slice::Iter<'a, Identifier>;

    fn into_iter(self) -> Self::IntoIter {
        self.identifiers.iter()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{Identifier, IdentifierSequence};
    use crate::ClientError;

    #[test]
    fn identifiers_address_stored_resources() {
        let stored = json!({"id": 7, "externalId": "pump", "space": "plant", "name": "p"});

        assert!(Identifier::Id(7).addresses(&stored));
        assert!(Identifier::ExternalId("pump".into()).addresses(&stored));
        assert!(Identifier::versioned("plant", "pump", "v2").addresses(&stored));
        assert!(!Identifier::Id(8).addresses(&stored));
        assert!(!Identifier::composite("other", "pump").addresses(&stored));
    }

    #[test]
    fn concatenated_chunks_rebuild_the_sequence() {
        let sequence: IdentifierSequence = (1..=11).map(Identifier::Id).collect();

        for size in 1..=12 {
            let chunks = sequence.chunks(size);
            assert_eq!(chunks.len(), 11usize.div_ceil(size));
            assert!(chunks.iter().all(|chunk| chunk.len() <= size && !chunk.is_singleton()));

            let rebuilt: Vec<Identifier> = chunks
                .iter()
                .flat_map(|chunk| chunk.identifiers().to_vec())
                .collect();
            assert_eq!(rebuilt, sequence.identifiers());
        }
    }

    #[test]
    fn singleton_flag_depends_on_constructor_not_length() {
        assert!(IdentifierSequence::single(7).is_singleton());
        assert!(!IdentifierSequence::new(vec![Identifier::Id(7)]).is_singleton());
    }

    #[test]
    fn load_keeps_ids_before_external_ids() {
        let sequence = IdentifierSequence::load(&[1, 2], &["a"]);
        assert_eq!(
            sequence.as_items(),
            vec![json!({"id": 1}), json!({"id": 2}), json!({"externalId": "a"})]
        );
    }

    #[test]
    fn empty_sequence_is_rejected() {
        let error = IdentifierSequence::new(Vec::new())
            .ensure_non_empty()
            .expect_err("empty input");
        assert!(matches!(error, ClientError::EmptyInput));
    }

    #[test]
    fn identifiers_round_trip_through_resource_json() {
        let resource = json!({"space": "s", "externalId": "x", "version": "2", "name": "n"});
        assert_eq!(
            Identifier::from_json(&resource),
            Some(Identifier::versioned("s", "x", "2"))
        );
        assert_eq!(
            Identifier::from_json(&json!({"id": 4, "externalId": "e"})),
            Some(Identifier::Id(4))
        );
        assert_eq!(Identifier::from_json(&json!({"name": "n"})), None);
        assert_eq!(
            Identifier::composite("s", "x").to_json(),
            json!({"space": "s", "externalId": "x"})
        );
    }
}
