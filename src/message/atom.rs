/// `message/atom.rs` — host message atoms and typed messages
///
/// The host protocol only knows two atom types (number, symbol) and
/// messages made of a selector followed by atoms.
use std::fmt;

use serde::{Deserialize, Serialize};

/// Well-known selectors.
pub mod selector {
    pub const BANG: &str = "bang";
    pub const FLOAT: &str = "float";
    pub const SYMBOL: &str = "symbol";
    pub const LIST: &str = "list";
    pub const LOADBANG: &str = "loadbang";
    /// Leading symbol of the two-atom opaque handle form.
    pub const JSOBJECT: &str = "jsobject";
}

/// One typed unit of a host message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Atom {
    Number(f64),
    Symbol(String),
}

impl Atom {
    pub fn symbol(s: impl Into<String>) -> Self {
        Atom::Symbol(s.into())
    }

    pub fn as_symbol(&self) -> Option<&str> {
        match self {
            Atom::Symbol(s) => Some(s.as_str()),
            Atom::Number(_) => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Atom::Number(n) => Some(*n),
            Atom::Symbol(_) => None,
        }
    }

    /// Read one whitespace-free token of the host's text form.
    pub fn parse(token: &str) -> Self {
        match token.parse::<f64>() {
            Ok(n) if n.is_finite() => Atom::Number(n),
            _ => Atom::Symbol(token.to_string()),
        }
    }
}

impl fmt::Display for Atom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Atom::Number(n) => write!(f, "{n}"),
            Atom::Symbol(s) => f.write_str(s),
        }
    }
}

impl From<f64> for Atom {
    fn from(n: f64) -> Self {
        Atom::Number(n)
    }
}

impl From<&str> for Atom {
    fn from(s: &str) -> Self {
        Atom::Symbol(s.to_string())
    }
}

impl From<String> for Atom {
    fn from(s: String) -> Self {
        Atom::Symbol(s)
    }
}

/// A typed message: selector plus payload atoms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub selector: String,
    pub atoms: Vec<Atom>,
}

impl Message {
    pub fn new(selector: impl Into<String>, atoms: Vec<Atom>) -> Self {
        Self {
            selector: selector.into(),
            atoms,
        }
    }

    pub fn bang() -> Self {
        Self::new(selector::BANG, Vec::new())
    }

    pub fn float(n: f64) -> Self {
        Self::new(selector::FLOAT, vec![Atom::Number(n)])
    }

    pub fn symbol(s: impl Into<String>) -> Self {
        Self::new(selector::SYMBOL, vec![Atom::Symbol(s.into())])
    }

    /// Parse the host text form, e.g. `foo 1 2`, `bang`, `3.5`, `1 2 3`.
    ///
    /// A leading number makes the message `float` (single atom) or `list`.
    /// Returns `None` for blank input.
    pub fn parse(line: &str) -> Option<Self> {
        let mut atoms: Vec<Atom> = line.split_whitespace().map(Atom::parse).collect();
        if atoms.is_empty() {
            return None;
        }
        match atoms.remove(0) {
            Atom::Symbol(sel) => Some(Self::new(sel, atoms)),
            first @ Atom::Number(_) => {
                let sel = if atoms.is_empty() { selector::FLOAT } else { selector::LIST };
                atoms.insert(0, first);
                Some(Self::new(sel, atoms))
            }
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.selector)?;
        for atom in &self.atoms {
            write!(f, " {atom}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_selector_and_payload() {
        let msg = Message::parse("foo 1 bar 2.5").unwrap();
        assert_eq!(msg.selector, "foo");
        assert_eq!(
            msg.atoms,
            vec![Atom::Number(1.0), Atom::symbol("bar"), Atom::Number(2.5)]
        );
    }

    #[test]
    fn parse_leading_number_is_float_or_list() {
        assert_eq!(Message::parse("  7 ").unwrap(), Message::float(7.0));
        let list = Message::parse("1 2 3").unwrap();
        assert_eq!(list.selector, selector::LIST);
        assert_eq!(list.atoms.len(), 3);
        assert!(Message::parse("   ").is_none());
    }

    #[test]
    fn display_uses_host_text_form() {
        let msg = Message::new("list", vec![Atom::Number(1.0), Atom::Number(0.5), "x".into()]);
        assert_eq!(msg.to_string(), "list 1 0.5 x");
        assert_eq!(Message::bang().to_string(), "bang");
    }
}
