use graphql_ws_transport::Variables;
use serde_json::{Map, Value};

/// Entity of a federated service to resolve via its `_entities` query.
#[derive(Clone, Debug, PartialEq)]
pub struct FederatedEntity {
    /// Name of the entity type.
    pub typename: String,

    /// Key fields identifying the entity.
    pub keys: Map<String, Value>,

    /// Selection set of the entity's fields to query.
    pub type_query: String,
}

impl FederatedEntity {
    /// Creates a new [`FederatedEntity`] of the `typename` type, selecting `type_query` fields.
    pub fn new(typename: impl Into<String>, type_query: impl Into<String>) -> Self {
        Self {
            typename: typename.into(),
            keys: Map::new(),
            type_query: type_query.into(),
        }
    }

    /// Adds a key field identifying the entity.
    pub fn with_key(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.keys.insert(name.into(), value.into());
        self
    }

    pub(crate) fn query(&self) -> String {
        format!(
            "query ($representations: [_Any!]!) {{\n  \
               _entities(representations: $representations) {{\n    \
                 __typename\n    \
                 ... on {} {{\n      {}\n    }}\n  \
               }}\n\
             }}",
            self.typename,
            self.type_query.trim(),
        )
    }

    pub(crate) fn variables(&self) -> Variables {
        let mut representation = Map::with_capacity(self.keys.len() + 1);
        representation.insert("__typename".into(), self.typename.clone().into());
        representation.extend(self.keys.clone());

        let mut variables = Variables::new();
        variables.insert(
            "representations".into(),
            Value::Array(vec![Value::Object(representation)]),
        );
        variables
    }
}

/// Indicates whether the `message` of a GraphQL error reveals that the service doesn't support
/// federation.
pub(crate) fn is_not_federated(message: &str) -> bool {
    message.contains("_entities") || message.contains("_Any")
}
