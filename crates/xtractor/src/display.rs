//! Extraction output model: the recovered XML tree, emitted as produced.

use std::fmt;

/// One recovered node. `serialized` is set instead of the structured
/// fields when a whole subtree arrived over the OOB channel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct XmlNode {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub text: Option<String>,
    pub children: Vec<XmlNode>,
    pub serialized: Option<String>,
}

impl XmlNode {
    pub fn leaf(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            text: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn from_serialized(raw: impl Into<String>) -> Self {
        Self {
            serialized: Some(raw.into()),
            ..Self::default()
        }
    }

    fn write_indented(&self, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
        let indent = "  ".repeat(depth);
        if let Some(raw) = &self.serialized {
            for line in raw.lines() {
                writeln!(f, "{}{}", indent, line)?;
            }
            return Ok(());
        }

        let mut open = format!("<{}", self.name);
        for (name, value) in &self.attributes {
            open.push_str(&format!(" {}=\"{}\"", name, value));
        }

        match (&self.text, self.children.is_empty()) {
            (Some(text), true) if !text.is_empty() => {
                writeln!(f, "{}{}>{}</{}>", indent, open, text, self.name)
            }
            (_, true) => writeln!(f, "{}{}/>", indent, open),
            _ => {
                writeln!(f, "{}{}>", indent, open)?;
                for child in &self.children {
                    child.write_indented(f, depth + 1)?;
                }
                writeln!(f, "{}</{}>", indent, self.name)
            }
        }
    }
}

impl fmt::Display for XmlNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.write_indented(f, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_leaf_rendering() {
        let node = XmlNode::leaf("title", "Genesis");
        assert_eq!(node.to_string(), "<title>Genesis</title>\n");
    }

    #[test]
    fn test_nested_rendering_with_attributes() {
        let mut root = XmlNode {
            name: "lib".to_string(),
            ..XmlNode::default()
        };
        let mut book = XmlNode::leaf("book", "Genesis");
        book.attributes.push(("id".to_string(), "1".to_string()));
        root.children.push(book);

        assert_eq!(
            root.to_string(),
            "<lib>\n  <book id=\"1\">Genesis</book>\n</lib>\n"
        );
    }

    #[test]
    fn test_empty_leaf_self_closes() {
        let node = XmlNode::leaf("empty", "");
        assert_eq!(node.to_string(), "<empty/>\n");
    }

    #[test]
    fn test_serialized_passthrough() {
        let node = XmlNode::from_serialized("<raw><x/></raw>");
        assert_eq!(node.to_string(), "<raw><x/></raw>\n");
    }
}
