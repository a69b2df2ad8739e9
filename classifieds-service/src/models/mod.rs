pub mod user;

pub use user::{LoginRequest, SignupRequest, UserResponse, USERS_COLLECTION};

use mongodb::bson::{Bson, Document};
use serde_json::Value;

/// String form of a document's `_id`.
pub fn document_id(document: &Document) -> Option<String> {
    match document.get("_id")? {
        Bson::ObjectId(id) => Some(id.to_hex()),
        Bson::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Render a stored document as plain JSON, with `_id` flattened to a string.
pub fn document_to_json(document: Document) -> Value {
    let id = document_id(&document);
    let mut value = Bson::Document(document).into_relaxed_extjson();
    if let (Some(id), Some(object)) = (id, value.as_object_mut()) {
        object.insert("_id".to_string(), Value::String(id));
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;
    use mongodb::bson::{doc, oid::ObjectId};

    #[test]
    fn test_document_to_json_flattens_object_id() {
        let id = ObjectId::new();
        let json = document_to_json(doc! { "_id": id, "name": "Cars", "count": 3 });

        assert_eq!(json["_id"], id.to_hex());
        assert_eq!(json["name"], "Cars");
        assert_eq!(json["count"], 3);
    }

    #[test]
    fn test_document_id_missing() {
        assert_eq!(document_id(&doc! { "name": "x" }), None);
    }
}
