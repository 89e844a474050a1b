//! Purpose: Render pretty JSON with optional ANSI colorization for CLI output.
//! Exports: colorize_json.
//! Invariants: With color off, output equals serde_json::to_string_pretty.
use serde_json::Value;

const INDENT: &str = "  ";

#[derive(Clone, Copy)]
enum Tone {
    Key,
    Str,
    Num,
    Bool,
    Null,
    Punct,
}

impl Tone {
    // Plain 8-color codes; bright variants wash out on light themes.
    fn code(self) -> &'static str {
        match self {
            Tone::Key => "36",
            Tone::Str => "32",
            Tone::Num => "33",
            Tone::Bool => "35",
            Tone::Null | Tone::Punct => "39",
        }
    }
}

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
            Value::Null => self.paint("null", Tone::Null),
            Value::Bool(b) => self.paint(if *b { "true" } else { "false" }, Tone::Bool),
            Value::Number(n) => self.paint(&n.to_string(), Tone::Num),
            Value::String(s) => self.paint(&quote(s), Tone::Str),
            Value::Array(items) => {
                self.container(('[', ']'), items.len(), depth, |painter, idx| {
                    painter.value(&items[idx], depth + 1);
                });
            }
            Value::Object(map) => {
                let entries: Vec<(&String, &Value)> = map.iter().collect();
                self.container(('{', '}'), entries.len(), depth, |painter, idx| {
                    let (key, item) = entries[idx];
                    painter.paint(&quote(key), Tone::Key);
                    painter.paint(":", Tone::Punct);
                    painter.out.push(' ');
                    painter.value(item, depth + 1);
                });
            }
        }
    }

    fn container<F>(&mut self, (open, close): (char, char), len: usize, depth: usize, mut item: F)
    where
        F: FnMut(&mut Self, usize),
    {
        if len == 0 {
            self.paint(&format!("{open}{close}"), Tone::Punct);
            return;
        }
        self.paint(&open.to_string(), Tone::Punct);
        self.out.push('\n');
        for idx in 0..len {
            self.indent(depth + 1);
            item(self, idx);
            if idx + 1 < len {
                self.paint(",", Tone::Punct);
            }
            self.out.push('\n');
        }
        self.indent(depth);
        self.paint(&close.to_string(), Tone::Punct);
    }

    fn indent(&mut self, depth: usize) {
        self.out.push_str(&INDENT.repeat(depth));
    }

    fn paint(&mut self, text: &str, tone: Tone) {
        if self.use_color {
            self.out.push_str("\u{1b}[");
            self.out.push_str(tone.code());
            self.out.push('m');
            self.out.push_str(text);
            self.out.push_str("\u{1b}[0m");
        } else {
            self.out.push_str(text);
        }
    }
}

fn quote(text: &str) -> String {
    serde_json::to_string(text).unwrap_or_else(|_| "\"\"".to_string())
}

#[cfg(test)]
mod tests {
    use super::colorize_json;
    use serde_json::json;

    #[test]
    fn plain_output_matches_serde_pretty() {
        let value = json!({
            "keys": ["k1", "k2"],
            "groups": [{"group": null, "keys": []}],
            "entries": {"k1": 1.5, "k2": {"nested": true}}
        });
        let plain = colorize_json(&value, false);
        let pretty = serde_json::to_string_pretty(&value).expect("pretty");
        assert_eq!(plain, pretty);
    }

    #[test]
    fn colored_output_tags_each_token_kind() {
        let value = json!({"k":"v","n":1,"b":true,"z":null});
        let colored = colorize_json(&value, true);
        assert!(colored.contains("\u{1b}[36m\"k\"\u{1b}[0m"));
        assert!(colored.contains("\u{1b}[32m\"v\"\u{1b}[0m"));
        assert!(colored.contains("\u{1b}[33m1\u{1b}[0m"));
        assert!(colored.contains("\u{1b}[35mtrue\u{1b}[0m"));
        assert!(colored.contains("\u{1b}[39mnull\u{1b}[0m"));
    }
}
