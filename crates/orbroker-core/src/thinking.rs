use std::sync::LazyLock;

use orbroker_contracts::ChatCompletionBody;
use regex::Regex;
use serde_json::Value;

static THINKING_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<think>.*?</think>|<thinking>.*?</thinking>")
        .expect("thinking block pattern is valid")
});

pub fn strip_thinking(text: &str) -> String {
    if !THINKING_BLOCK.is_match(text) {
        return text.to_string();
    }
    THINKING_BLOCK.replace_all(text, "").trim().to_string()
}

pub fn strip_thinking_from_body(body: &mut ChatCompletionBody) {
    let Some(message) = body.first_message_mut() else {
        return;
    };
    match message.content.as_mut() {
        Some(Value::String(text)) => *text = strip_thinking(text),
        Some(Value::Array(parts)) => {
            for part in parts {
                if let Some(Value::String(text)) = part.get_mut("text") {
                    *text = strip_thinking(text);
                }
            }
        }
        _ => {}
    }
}
