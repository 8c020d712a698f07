//! Models - typed records stored as JSON field maps.
//!
//! ## Example
//!
//! ```ignore
//! use concurrency_repos::Model;
//!
//! #[derive(Serialize, Deserialize, Clone)]
//! struct Product {
//!     name: String,
//!     quantity: i64,
//! }
//!
//! impl Model for Product {
//!     const TABLE: &'static str = "products";
//! }
//! ```

use serde::{de::DeserializeOwned, Serialize};

use crate::error::RepositoryError;
use crate::store::{Fields, RecordId, Row};

/// Trait for types that can be stored as records.
///
/// The identity is not part of the model: the store assigns it on insert and
/// the repositories carry it next to the data.
pub trait Model: Serialize + DeserializeOwned + Clone + Send + Sync {
    /// The table this model lives in. Maps to a table in SQL or a key prefix
    /// in a KV store. ASCII letters, digits and underscores only.
    const TABLE: &'static str;
}

/// Models that hold a balance, for transfers between records.
pub trait Balance {
    fn balance(&self) -> i64;
    fn set_balance(&mut self, balance: i64);
}

/// A record with a version stamp for optimistic concurrency control.
///
/// `version` is 1 after create and grows by exactly 1 with every accepted
/// update.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<M> {
    pub id: RecordId,
    pub version: u64,
    pub data: M,
}

/// A record protected by pessimistic locks. No version is exposed.
#[derive(Debug, Clone, PartialEq)]
pub struct Record<M> {
    pub id: RecordId,
    pub data: M,
}

impl<M: Model> Versioned<M> {
    pub(crate) fn from_row(row: Row) -> Result<Self, RepositoryError> {
        Ok(Versioned {
            id: row.id,
            version: row.version,
            data: decode::<M>(row.fields)?,
        })
    }
}

impl<M: Model> Record<M> {
    pub(crate) fn from_row(row: Row) -> Result<Self, RepositoryError> {
        Ok(Record {
            id: row.id,
            data: decode::<M>(row.fields)?,
        })
    }
}

pub(crate) fn encode<M: Model>(model: &M) -> Result<Fields, RepositoryError> {
    match serde_json::to_value(model) {
        Ok(serde_json::Value::Object(fields)) => Ok(fields),
        Ok(other) => Err(RepositoryError::Serde {
            table: M::TABLE,
            message: format!("expected a JSON object, got {}", other),
        }),
        Err(err) => Err(RepositoryError::Serde {
            table: M::TABLE,
            message: err.to_string(),
        }),
    }
}

pub(crate) fn decode<M: Model>(fields: Fields) -> Result<M, RepositoryError> {
    serde_json::from_value(serde_json::Value::Object(fields)).map_err(|err| RepositoryError::Serde {
        table: M::TABLE,
        message: err.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct Widget {
        name: String,
        quantity: i64,
    }

    impl Model for Widget {
        const TABLE: &'static str = "widgets";
    }

    #[derive(Clone, Debug, Serialize, Deserialize)]
    struct Bare(i64);

    impl Model for Bare {
        const TABLE: &'static str = "bare";
    }

    #[test]
    fn encodes_to_field_map() {
        let fields = encode(&Widget {
            name: "Widget".into(),
            quantity: 100,
        })
        .unwrap();
        assert_eq!(fields["name"], json!("Widget"));
        assert_eq!(fields["quantity"], json!(100));
    }

    #[test]
    fn non_object_models_are_rejected() {
        let err = encode(&Bare(1)).unwrap_err();
        assert!(matches!(err, RepositoryError::Serde { table: "bare", .. }));
    }

    #[test]
    fn versioned_from_row() {
        let mut fields = Fields::new();
        fields.insert("name".into(), json!("Gadget"));
        fields.insert("quantity".into(), json!(5));

        let record = Versioned::<Widget>::from_row(Row {
            id: RecordId(3),
            version: 4,
            fields,
        })
        .unwrap();
        assert_eq!(record.id, RecordId(3));
        assert_eq!(record.version, 4);
        assert_eq!(record.data.quantity, 5);
    }

    #[test]
    fn decode_reports_missing_fields() {
        let mut fields = Fields::new();
        fields.insert("name".into(), json!("Gadget"));
        let err = Record::<Widget>::from_row(Row {
            id: RecordId(1),
            version: 1,
            fields,
        })
        .unwrap_err();
        assert!(matches!(err, RepositoryError::Serde { table: "widgets", .. }));
    }
}
