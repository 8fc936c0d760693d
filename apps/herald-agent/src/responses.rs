use serde_json::Value;
use uuid::Uuid;

pub fn attach_corr(payload: &mut Value) {
    if let Value::Object(map) = payload {
        if !map.contains_key("corr_id") {
            map.insert("corr_id".into(), Value::String(Uuid::new_v4().to_string()));
        }
    }
}
