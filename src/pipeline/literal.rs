//! Reader for the small subset of Python literals that maps onto JSON:
//! strings, numbers, `None`, `True`, `False`, lists, tuples and dicts with
//! string keys.

use std::iter::Peekable;
use std::str::Chars;

use serde_json::{Map, Number, Value};

struct Literal<'a> {
    chars: Peekable<Chars<'a>>,
}

/// Parses `text` as a single literal, optionally followed by a comment.
pub(super) fn parse(text: &str) -> Result<Value, String> {
    let mut literal = Literal {
        chars: text.chars().peekable(),
    };

    let value = literal.value()?;
    literal.skip_space();

    match literal.chars.peek() {
        None | Some('#') => Ok(value),
        Some(c) => Err(format!("unexpected {c:?} after the value")),
    }
}

impl Literal<'_> {
    fn skip_space(&mut self) {
        while self.chars.next_if(|c| c.is_whitespace()).is_some() {}
    }

    fn value(&mut self) -> Result<Value, String> {
        self.skip_space();

        match self.chars.peek().copied() {
            Some(quote @ ('\'' | '"')) => {
                self.chars.next();
                self.string(quote).map(Value::String)
            }
            Some('[') => {
                self.chars.next();
                self.list(']')
            }
            Some('(') => {
                self.chars.next();
                self.list(')')
            }
            Some('{') => {
                self.chars.next();
                self.map()
            }
            Some(c) if c.is_alphanumeric() || matches!(c, '-' | '.') => self.atom(),
            Some(c) => Err(format!("unexpected {c:?}")),
            None => Err("missing value".into()),
        }
    }

    fn string(&mut self, quote: char) -> Result<String, String> {
        let mut text = String::new();

        while let Some(c) = self.chars.next() {
            match c {
                c if c == quote => return Ok(text),
                '\\' => match self.chars.next() {
                    Some('n') => text.push('\n'),
                    Some('t') => text.push('\t'),
                    Some(c @ ('\\' | '\'' | '"')) => text.push(c),
                    Some(c) => {
                        text.push('\\');
                        text.push(c);
                    }
                    None => break,
                },
                c => text.push(c),
            }
        }

        Err("unterminated string".into())
    }

    fn list(&mut self, close: char) -> Result<Value, String> {
        let mut items = Vec::new();

        loop {
            self.skip_space();
            if self.chars.next_if_eq(&close).is_some() {
                return Ok(Value::Array(items));
            }

            items.push(self.value()?);
            self.skip_space();

            match self.chars.next() {
                Some(',') => {}
                Some(c) if c == close => return Ok(Value::Array(items)),
                Some(c) => return Err(format!("expected ',' or {close:?}, got {c:?}")),
                None => return Err(format!("missing {close:?}")),
            }
        }
    }

    fn map(&mut self) -> Result<Value, String> {
        let mut map = Map::new();

        loop {
            self.skip_space();
            if self.chars.next_if_eq(&'}').is_some() {
                return Ok(Value::Object(map));
            }

            let key = match self.value()? {
                Value::String(key) => key,
                other => return Err(format!("dict keys must be strings, got {other}")),
            };

            self.skip_space();
            if self.chars.next_if_eq(&':').is_none() {
                return Err(format!("expected ':' after {key:?}"));
            }

            let value = self.value()?;
            map.insert(key, value);
            self.skip_space();

            match self.chars.next() {
                Some(',') => {}
                Some('}') => return Ok(Value::Object(map)),
                Some(c) => return Err(format!("expected ',' or '}}', got {c:?}")),
                None => return Err("missing '}'".into()),
            }
        }
    }

    /// Keywords and numbers.
    fn atom(&mut self) -> Result<Value, String> {
        let mut word = String::new();
        while let Some(c) = self
            .chars
            .next_if(|c| c.is_alphanumeric() || matches!(c, '_' | '.' | '-' | '+'))
        {
            word.push(c);
        }

        match word.as_str() {
            "None" => Ok(Value::Null),
            "True" => Ok(Value::Bool(true)),
            "False" => Ok(Value::Bool(false)),
            _ => serde_json::from_str::<Number>(&word)
                .map(Value::Number)
                .map_err(|_| format!("unsupported value {word:?}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_keywords_inside_strings_are_kept() {
        assert_eq!(
            parse("'out/None_report.ipynb'").unwrap(),
            json!("out/None_report.ipynb")
        );
        assert_eq!(parse("\"True False\"").unwrap(), json!("True False"));
    }

    #[test]
    fn test_quotes_inside_strings() {
        assert_eq!(parse(r#"["it's", 'say "hi"']"#).unwrap(), json!(["it's", "say \"hi\""]));
        assert_eq!(parse(r"'it\'s'").unwrap(), json!("it's"));
    }

    #[test]
    fn test_nested_values() {
        assert_eq!(
            parse("{'nb': 'a.ipynb', 'flags': (True, None, -1.5,)}  # outputs").unwrap(),
            json!({ "nb": "a.ipynb", "flags": [true, null, -1.5] })
        );
        assert_eq!(parse("[]").unwrap(), json!([]));
    }

    #[test]
    fn test_rejects_expressions() {
        assert!(parse("Path('out') / 'a.ipynb'").is_err());
        assert!(parse("'unterminated").is_err());
        assert!(parse("['a' 'b']").is_err());
        assert!(parse("{1: 'a'}").is_err());
    }
}
