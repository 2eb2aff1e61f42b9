//! The oracle contract: one boolean question at a time.
//!
//! Everything the extraction algorithms know about the victim arrives
//! through [`Oracle::ask`]. The HTTP realization renders the question
//! through the selected injection and matches the response; tests swap in
//! an oracle that answers truthfully against an in-memory document.

use crate::context::AttackContext;
use crate::error::Result;
use crate::request::check;
use crate::xpath::Expression;
use async_trait::async_trait;

/// Answers an XPath boolean predicate about the victim's document
#[async_trait]
pub trait Oracle: Send + Sync {
    async fn ask(&self, expression: &Expression) -> Result<bool>;
}

/// Oracle backed by the attack context's request pipeline. Covers all
/// three realizations (response match, timing, OOB) because the context
/// mode decides how [`check`] converts a response into a verdict.
pub struct HttpOracle<'a> {
    context: &'a AttackContext,
}

impl<'a> HttpOracle<'a> {
    pub fn new(context: &'a AttackContext) -> Self {
        Self { context }
    }

    pub fn context(&self) -> &AttackContext {
        self.context
    }
}

#[async_trait]
impl Oracle for HttpOracle<'_> {
    async fn ask(&self, expression: &Expression) -> Result<bool> {
        check(self.context, &expression.to_string()).await
    }
}
