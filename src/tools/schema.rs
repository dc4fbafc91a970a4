//! 工具参数 JSON Schema 生成（schemars）

use schemars::{schema_for, JsonSchema};
use serde_json::{json, Value};

/// 由参数结构体生成 input schema；生成失败时退化为无参数对象
pub fn parameters_schema<T: JsonSchema>() -> Value {
    let schema = schema_for!(T);
    serde_json::to_value(&schema).unwrap_or_else(|_| {
        json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[allow(dead_code)]
    #[derive(JsonSchema)]
    struct Args {
        /// City name
        city: String,
        days: Option<u32>,
    }

    #[test]
    fn schema_has_properties_and_required() {
        let schema = parameters_schema::<Args>();
        assert_eq!(schema["type"], "object");
        assert_eq!(schema["properties"]["city"]["description"], "City name");
        assert_eq!(schema["required"], json!(["city"]));
    }
}
