//! Purpose: Pretty JSON with optional ANSI color for terminal output.
//! Exports: colorize_json.
//! Role: Pure formatter used by `emit_json` when stdout is a terminal.
//! Invariants: With color disabled, output equals serde_json::to_string_pretty.
//! Invariants: Hex address strings ("0x...") are colored like numbers.
use serde_json::{Map, Value};

const KEY: &str = "36";
const TEXT: &str = "32";
const NUMBER: &str = "33";
const LITERAL: &str = "35";

pub fn colorize_json(value: &Value, use_color: bool) -> String {
    let mut painter = Painter {
        use_color,
        out: String::new(),
    };
    painter.value(value, 0);
    painter.out
}

struct Painter {
    use_color: bool,
    out: String,
}

impl Painter {
    fn value(&mut self, value: &Value, depth: usize) {
        match value {
            Value::Null => self.paint("null", LITERAL),
            Value::Bool(flag) => self.paint(if *flag { "true" } else { "false" }, LITERAL),
            Value::Number(number) => self.paint(&number.to_string(), NUMBER),
            Value::String(text) => {
                let color = if is_address(text) { NUMBER } else { TEXT };
                self.paint(&encode(text), color);
            }
            Value::Array(items) => self.array(items, depth),
            Value::Object(map) => self.object(map, depth),
        }
    }

    fn array(&mut self, items: &[Value], depth: usize) {
        if items.is_empty() {
            self.out.push_str("[]");
            return;
        }
        self.out.push('[');
        for (index, item) in items.iter().enumerate() {
            self.separator(index, depth + 1);
            self.value(item, depth + 1);
        }
        self.close(']', depth);
    }

    fn object(&mut self, map: &Map<String, Value>, depth: usize) {
        if map.is_empty() {
            self.out.push_str("{}");
            return;
        }
        self.out.push('{');
        for (index, (key, value)) in map.iter().enumerate() {
            self.separator(index, depth + 1);
            self.paint(&encode(key), KEY);
            self.out.push_str(": ");
            self.value(value, depth + 1);
        }
        self.close('}', depth);
    }

    fn separator(&mut self, index: usize, depth: usize) {
        if index > 0 {
            self.out.push(',');
        }
        self.out.push('\n');
        self.indent(depth);
    }

    fn close(&mut self, bracket: char, depth: usize) {
        self.out.push('\n');
        self.indent(depth);
        self.out.push(bracket);
    }

    fn indent(&mut self, depth: usize) {
        for _ in 0..depth {
            self.out.push_str("  ");
        }
    }

    fn paint(&mut self, text: &str, color: &str) {
        if self.use_color {
            self.out.push_str(&format!("\u{1b}[{color}m{text}\u{1b}[0m"));
        } else {
            self.out.push_str(text);
        }
    }
}

fn encode(text: &str) -> String {
    serde_json::to_string(text).unwrap_or_else(|_| "\"\"".to_string())
}

fn is_address(text: &str) -> bool {
    text.strip_prefix("0x")
        .is_some_and(|digits| !digits.is_empty() && digits.chars().all(|c| c.is_ascii_hexdigit()))
}

#[cfg(test)]
mod tests {
    use super::colorize_json;
    use serde_json::json;

    #[test]
    fn uncolored_output_matches_serde_pretty() {
        let value = json!({
            "pool": "0x100",
            "locations": [{"handle": 10, "slot_address": "0x1330", "directory": null}],
            "empty": [],
            "nested": {},
            "in_place": false
        });
        let expected = serde_json::to_string_pretty(&value).expect("pretty");
        assert_eq!(colorize_json(&value, false), expected);
    }

    #[test]
    fn addresses_use_number_color() {
        let painted = colorize_json(&json!({"slot": "0x1330", "name": "lobby"}), true);
        assert!(painted.contains("\u{1b}[33m\"0x1330\"\u{1b}[0m"));
        assert!(painted.contains("\u{1b}[32m\"lobby\"\u{1b}[0m"));
        assert!(painted.contains("\u{1b}[36m\"slot\"\u{1b}[0m"));
    }
}
