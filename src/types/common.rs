use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Represents a Pointer to another Parse object.
/// Pointers are used to create relationships between objects.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Pointer {
    #[serde(rename = "__type")]
    pub __type: String, // Should always be "Pointer"
    #[serde(rename = "className")]
    pub class_name: String,
    #[serde(rename = "objectId")]
    pub object_id: String,
}

impl Pointer {
    /// Creates a new Pointer.
    pub fn new(class_name: impl Into<String>, object_id: impl Into<String>) -> Self {
        Pointer {
            __type: "Pointer".to_string(),
            class_name: class_name.into(),
            object_id: object_id.into(),
        }
    }

    /// Reads a pointer out of a wire value, if it is one.
    pub fn from_value(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        if obj.get("__type").and_then(Value::as_str) != Some("Pointer") {
            return None;
        }
        Some(Pointer::new(
            obj.get("className")?.as_str()?,
            obj.get("objectId")?.as_str()?,
        ))
    }

    pub fn to_value(&self) -> Value {
        json!({
            "__type": "Pointer",
            "className": self.class_name,
            "objectId": self.object_id,
        })
    }
}

/// Represents a relational operation (AddRelation, RemoveRelation).
#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub struct RelationOp {
    #[serde(rename = "__op")]
    op_type: &'static str,
    objects: Vec<Pointer>,
}

impl RelationOp {
    pub fn add(objects: Vec<Pointer>) -> Self {
        RelationOp {
            op_type: "AddRelation",
            objects,
        }
    }

    pub fn remove(objects: Vec<Pointer>) -> Self {
        RelationOp {
            op_type: "RemoveRelation",
            objects,
        }
    }

    pub fn to_value(&self) -> Value {
        json!({ "__op": self.op_type, "objects": self.objects })
    }
}

/// Represents a Parse Relation field on an object.
/// This is how relation columns are rendered on reads; the related objects
/// live in the `_Join:<field>:<class>` table.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ParseRelation {
    #[serde(rename = "__type")]
    pub __type: String, // Should always be "Relation"
    #[serde(rename = "className")]
    pub class_name: String, // The target class of the relation
}

impl ParseRelation {
    pub fn new(class_name: impl Into<String>) -> Self {
        ParseRelation {
            __type: "Relation".to_string(),
            class_name: class_name.into(),
        }
    }

    pub fn to_value(&self) -> Value {
        json!({ "__type": "Relation", "className": self.class_name })
    }
}
