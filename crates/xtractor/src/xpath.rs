//! Minimal XPath expression builder
//!
//! Produces wire-form XPath 1.0/2.0/3.x text with precedence-aware
//! parenthesization. This is a string model, not an evaluator: the only
//! consumers are the injection payloads, the feature probes, and the
//! extraction algorithms, so only the operators and functions they need
//! exist here.

use std::fmt;

/// Operator precedence, lowest first. An operand is parenthesized when its
/// own precedence is below the operator combining it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Prec {
    Or,
    And,
    Cmp,
    Path,
}

/// A fragment of XPath source text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expression {
    text: String,
    prec: Prec,
}

impl Expression {
    /// Wrap pre-rendered XPath text. The fragment is treated as opaque: it
    /// is never re-parenthesized, so callers embedding raw text inside an
    /// operator should use [`Expression::group`] when grouping matters.
    pub fn raw(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            prec: Prec::Path,
        }
    }

    /// A quoted string literal. Picks the quote character not present in
    /// the value; values containing both kinds are stitched with
    /// `concat()`.
    pub fn string(value: &str) -> Self {
        Self {
            text: quote(value),
            prec: Prec::Path,
        }
    }

    /// A numeric literal
    pub fn number(value: i64) -> Self {
        Self {
            text: value.to_string(),
            prec: Prec::Path,
        }
    }

    /// Explicit parentheses
    pub fn group(expr: Expression) -> Self {
        Self {
            text: format!("({})", expr.text),
            prec: Prec::Path,
        }
    }

    /// A function call `name(arg, ...)`
    pub fn call(name: &str, args: Vec<Expression>) -> Self {
        let rendered: Vec<String> = args.into_iter().map(|a| a.text).collect();
        Self {
            text: format!("{}({})", name, rendered.join(", ")),
            prec: Prec::Path,
        }
    }

    pub fn and(self, rhs: impl Into<Expression>) -> Self {
        self.binary(Prec::And, "and", rhs.into())
    }

    pub fn or(self, rhs: impl Into<Expression>) -> Self {
        self.binary(Prec::Or, "or", rhs.into())
    }

    pub fn eq(self, rhs: impl Into<Expression>) -> Self {
        self.binary(Prec::Cmp, "=", rhs.into())
    }

    pub fn ne(self, rhs: impl Into<Expression>) -> Self {
        self.binary(Prec::Cmp, "!=", rhs.into())
    }

    pub fn gt(self, rhs: impl Into<Expression>) -> Self {
        self.binary(Prec::Cmp, ">", rhs.into())
    }

    pub fn ge(self, rhs: impl Into<Expression>) -> Self {
        self.binary(Prec::Cmp, ">=", rhs.into())
    }

    pub fn lt(self, rhs: impl Into<Expression>) -> Self {
        self.binary(Prec::Cmp, "<", rhs.into())
    }

    pub fn le(self, rhs: impl Into<Expression>) -> Self {
        self.binary(Prec::Cmp, "<=", rhs.into())
    }

    /// Positional or boolean predicate: `self[pred]`
    pub fn index(self, pred: impl Into<Expression>) -> Self {
        let base = self.wrap_below(Prec::Path);
        Self {
            text: format!("{}[{}]", base, pred.into().text),
            prec: Prec::Path,
        }
    }

    /// Append a path step verbatim, e.g. `.add_path("/data")`
    pub fn add_path(self, path: &str) -> Self {
        let base = self.wrap_below(Prec::Path);
        Self {
            text: format!("{}{}", base, path),
            prec: Prec::Path,
        }
    }

    fn binary(self, prec: Prec, op: &str, rhs: Expression) -> Self {
        let l = self.wrap_below(prec);
        let r = rhs.wrap_below(prec);
        Self {
            text: format!("{} {} {}", l, op, r),
            prec,
        }
    }

    fn wrap_below(self, required: Prec) -> String {
        if self.prec < required {
            format!("({})", self.text)
        } else {
            self.text
        }
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl From<&str> for Expression {
    fn from(value: &str) -> Self {
        Expression::string(value)
    }
}

impl From<String> for Expression {
    fn from(value: String) -> Self {
        Expression::string(&value)
    }
}

impl From<i64> for Expression {
    fn from(value: i64) -> Self {
        Expression::number(value)
    }
}

impl From<u64> for Expression {
    fn from(value: u64) -> Self {
        Expression::number(value as i64)
    }
}

fn quote(value: &str) -> String {
    if !value.contains('\'') {
        format!("'{}'", value)
    } else if !value.contains('"') {
        format!("\"{}\"", value)
    } else {
        // Both quote kinds present: split on single quotes (the pieces then
        // contain none) and stitch them back with a double-quoted quote
        let parts: Vec<String> = value
            .split('\'')
            .map(|piece| format!("'{}'", piece))
            .collect();
        format!("concat({})", parts.join(", \"'\", "))
    }
}

/// Constructors for the XPath functions the engine uses
pub mod func {
    use super::Expression;

    pub fn count(e: Expression) -> Expression {
        Expression::call("count", vec![e])
    }

    pub fn string_length(e: Expression) -> Expression {
        Expression::call("string-length", vec![e])
    }

    pub fn substring(e: Expression, start: u64, len: u64) -> Expression {
        Expression::call(
            "substring",
            vec![e, Expression::number(start as i64), Expression::number(len as i64)],
        )
    }

    pub fn substring_before(haystack: impl Into<Expression>, needle: Expression) -> Expression {
        Expression::call("substring-before", vec![haystack.into(), needle])
    }

    pub fn normalize_space(e: impl Into<Expression>) -> Expression {
        Expression::call("normalize-space", vec![e.into()])
    }

    pub fn string(e: Expression) -> Expression {
        Expression::call("string", vec![e])
    }

    pub fn concat(parts: Vec<Expression>) -> Expression {
        Expression::call("concat", parts)
    }

    pub fn name(e: Expression) -> Expression {
        Expression::call("name", vec![e])
    }

    pub fn boolean(e: Expression) -> Expression {
        Expression::call("boolean", vec![e])
    }

    pub fn not(e: Expression) -> Expression {
        Expression::call("not", vec![e])
    }

    pub fn exists(e: Expression) -> Expression {
        Expression::call("exists", vec![e])
    }

    pub fn empty(e: Expression) -> Expression {
        Expression::call("empty", vec![e])
    }

    pub fn doc(uri: impl Into<Expression>) -> Expression {
        Expression::call("doc", vec![uri.into()])
    }

    pub fn doc_available(uri: Expression) -> Expression {
        Expression::call("doc-available", vec![uri])
    }

    pub fn encode_for_uri(e: Expression) -> Expression {
        Expression::call("encode-for-uri", vec![e])
    }

    pub fn serialize(e: Expression) -> Expression {
        Expression::call("serialize", vec![e])
    }

    pub fn string_to_codepoints(e: impl Into<Expression>) -> Expression {
        Expression::call("string-to-codepoints", vec![e.into()])
    }

    pub fn lower_case(e: impl Into<Expression>) -> Expression {
        Expression::call("lower-case", vec![e.into()])
    }

    pub fn ends_with(a: impl Into<Expression>, b: impl Into<Expression>) -> Expression {
        Expression::call("ends-with", vec![a.into(), b.into()])
    }

    pub fn contains_token(a: impl Into<Expression>, b: impl Into<Expression>) -> Expression {
        Expression::call("contains-token", vec![a.into(), b.into()])
    }

    pub fn generate_id(e: Expression) -> Expression {
        Expression::call("generate-id", vec![e])
    }

    pub fn document_uri(e: Expression) -> Expression {
        Expression::call("document-uri", vec![e])
    }

    pub fn base_uri() -> Expression {
        Expression::call("base-uri", vec![])
    }

    pub fn current_date_time() -> Expression {
        Expression::call("current-dateTime", vec![])
    }

    pub fn available_environment_variables() -> Expression {
        Expression::call("available-environment-variables", vec![])
    }

    pub fn unparsed_text_available(e: impl Into<Expression>) -> Expression {
        Expression::call("unparsed-text-available", vec![e.into()])
    }
}

/// A namespaced function family, e.g. the EXPath file module or Saxon
/// extensions. The prefix is prepended verbatim to every call.
#[derive(Debug, Clone)]
pub struct Functions {
    prefix: String,
}

impl Functions {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn call(&self, name: &str, args: Vec<Expression>) -> Expression {
        Expression::call(&format!("{}{}", self.prefix, name), args)
    }
}

/// EXPath file-module functions (`Q{http://expath.org/ns/file}`)
pub fn fs_functions() -> Functions {
    Functions::new("Q{http://expath.org/ns/file}")
}

/// Saxon extension functions (`saxon:`)
pub fn saxon_functions() -> Functions {
    Functions::new("saxon:")
}
