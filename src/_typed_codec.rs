use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;

/// Encoding used for workflow payloads and every stored request/reply body.
pub trait Codec {
    fn encode<T: Serialize>(v: &T) -> Result<Value, String>;
    fn decode<T: DeserializeOwned>(v: &Value) -> Result<T, String>;
}

pub struct Json;

impl Codec for Json {
    fn encode<T: Serialize>(v: &T) -> Result<Value, String> {
        serde_json::to_value(v).map_err(|e| format!("encode: {e}"))
    }

    fn decode<T: DeserializeOwned>(v: &Value) -> Result<T, String> {
        T::deserialize(v).map_err(|e| format!("decode: {e}"))
    }
}
