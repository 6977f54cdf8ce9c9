// Field accessors and schema validation over serde_json documents.
//
// Tool invocations, tool definitions and rules all arrive as JSON;
// these helpers keep the extraction call sites short and give the
// registry its "validate this document against this schema"
// predicate.
//
// The schema dialect is the small subset embedded controllers
// actually exchange: "type", "properties", "required", "enum".
// Anything the validator does not understand is permissive rather
// than fatal.

use serde_json::Value as Json;


pub fn get_str<'a>(doc: &'a Json, field: &str) -> Option<&'a str> {
    doc.get(field).and_then(Json::as_str)
}

pub fn get_bool(doc: &Json, field: &str, default: bool) -> bool {
    doc.get(field).and_then(Json::as_bool).unwrap_or(default)
}

pub fn get_i64(doc: &Json, field: &str) -> Option<i64> {
    doc.get(field).and_then(Json::as_i64)
}

pub fn get_f64(doc: &Json, field: &str) -> Option<f64> {
    doc.get(field).and_then(Json::as_f64)
}

pub fn get_object<'a>(doc: &'a Json, field: &str) -> Option<&'a Json> {
    doc.get(field).filter(|v| v.is_object())
}

pub fn get_array<'a>(doc: &'a Json, field: &str) -> Option<&'a Vec<Json>> {
    doc.get(field).and_then(Json::as_array)
}


fn type_matches(value: &Json, type_name: &str) -> bool {
    match type_name {
        "object" => value.is_object(),
        "array" => value.is_array(),
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "null" => value.is_null(),
        _ => true,
    }
}


// True iff `value` satisfies `schema`. A null schema accepts
// everything.
pub fn validate(value: &Json, schema: &Json) -> bool {
    if schema.is_null() {
        return true;
    }

    if let Some(type_name) = get_str(schema, "type") {
        if !type_matches(value, type_name) {
            return false;
        }
    }

    if let Some(allowed) = get_array(schema, "enum") {
        if !allowed.iter().any(|v| v == value) {
            return false;
        }
    }

    if let Some(required) = get_array(schema, "required") {
        for field in required {
            if let Some(name) = field.as_str() {
                if value.get(name).is_none() {
                    return false;
                }
            }
        }
    }

    if let Some(properties) = get_object(schema, "properties") {
        if let Some(map) = properties.as_object() {
            for (name, sub) in map {
                if let Some(field) = value.get(name) {
                    if !validate(field, sub) {
                        return false;
                    }
                }
            }
        }
    }

    true
}


// Validate a tool invocation's params against the tool's stored
// schema document. Tool schemas wrap the parameter description in a
// "params" member next to the advertised name and description; a
// bare schema object is also accepted.
pub fn validate_params(params: &Json, schema: &Json) -> bool {
    let effective = schema.get("params").unwrap_or(schema);
    validate(params, effective)
}


#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_field_helpers() {
        let doc = json!({"s": "x", "b": true, "i": 3, "f": 2.5, "o": {}, "a": [1]});
        assert_eq!(get_str(&doc, "s"), Some("x"));
        assert_eq!(get_str(&doc, "i"), None);
        assert_eq!(get_bool(&doc, "b", false), true);
        assert_eq!(get_bool(&doc, "missing", true), true);
        assert_eq!(get_i64(&doc, "i"), Some(3));
        assert_eq!(get_f64(&doc, "f"), Some(2.5));
        assert!(get_object(&doc, "o").is_some());
        assert!(get_object(&doc, "a").is_none());
        assert_eq!(get_array(&doc, "a").unwrap().len(), 1);
    }

    #[test]
    fn test_null_schema_accepts_all() {
        assert!(validate(&json!({"anything": 1}), &Json::Null));
    }

    #[test]
    fn test_type_and_required() {
        let schema = json!({
            "type": "object",
            "properties": {
                "message": {"type": "string"},
                "count": {"type": "integer"}
            },
            "required": ["message"]
        });

        assert!(validate(&json!({"message": "hi"}), &schema));
        assert!(validate(&json!({"message": "hi", "count": 3}), &schema));
        assert!(!validate(&json!({"count": 3}), &schema));
        assert!(!validate(&json!({"message": 5}), &schema));
        assert!(!validate(&json!({"message": "hi", "count": 2.5}), &schema));
        assert!(!validate(&json!("not an object"), &schema));
    }

    #[test]
    fn test_enum() {
        let schema = json!({"type": "string", "enum": ["on", "off"]});
        assert!(validate(&json!("on"), &schema));
        assert!(!validate(&json!("dim"), &schema));
    }

    #[test]
    fn test_wrapped_tool_schema() {
        let schema = json!({
            "name": "system.defineTool",
            "params": {
                "properties": {"name": {"type": "string"}},
                "required": ["name"]
            }
        });
        assert!(validate_params(&json!({"name": "t"}), &schema));
        assert!(!validate_params(&json!({}), &schema));
    }
}
