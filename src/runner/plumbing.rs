//! Built-in plumbing analyzers.
//!
//! These run first, strictly sequentially, and keep the tick and identity
//! providers current for the leaves that follow.

use crate::analyze::Analyzer;
use crate::error::Result;
use crate::model::Tc;
use crate::runner::ConsumeContext;

/// Maintains the tick provider: day offset from the first commit.
#[derive(Debug, Default)]
pub struct TicksPlumbing;

impl Analyzer for TicksPlumbing {
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }

    fn name(&self) -> &str {
        "ticks"
    }

    fn flag(&self) -> &str {
        "ticks"
    }

    fn descriptor(&self) -> &str {
        "derives each commit's tick from the committer timestamp"
    }

    fn consume(&mut self, ctx: &mut ConsumeContext<'_>) -> Result<Option<Tc>> {
        let timestamp = ctx.data.commit.timestamp();
        if let Some((ticks, _)) = ctx.providers() {
            ticks.observe(timestamp);
        }
        Ok(None)
    }
}

/// Maintains the identity provider: author signature interning.
#[derive(Debug, Default)]
pub struct IdentityPlumbing;

impl Analyzer for IdentityPlumbing {
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }

    fn name(&self) -> &str {
        "identity"
    }

    fn flag(&self) -> &str {
        "identity"
    }

    fn descriptor(&self) -> &str {
        "interns author signatures into dense identifiers"
    }

    fn consume(&mut self, ctx: &mut ConsumeContext<'_>) -> Result<Option<Tc>> {
        let author = ctx.data.commit.author();
        if let Some((_, identities)) = ctx.providers() {
            identities.intern(&author);
        }
        Ok(None)
    }
}
