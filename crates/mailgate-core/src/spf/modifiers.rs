//! Modifier evaluation, reached only when no mechanism matched

use super::check::{check_domain, EvaluationContext};
use super::macros;
use super::parser::Modifier;
use super::result::SpfResult;
use tracing::{debug, warn};

/// Evaluate `modifier` as found in the record of `domain`
pub async fn evaluate(modifier: &Modifier, ctx: &mut EvaluationContext, domain: &str) -> SpfResult {
    match modifier {
        Modifier::Redirect(spec) => redirect(ctx, spec, domain).await,
        Modifier::Explanation(spec) => explanation(spec),
        Modifier::Unknown { .. } => SpfResult::None,
    }
}

/// Evaluate another domain's record in place of this one
///
/// The result is passed through as is.
pub async fn redirect(ctx: &mut EvaluationContext, spec: &str, domain: &str) -> SpfResult {
    let target = match macros::expand_domain(spec, &ctx.macro_context(domain)) {
        Ok(target) => target,
        Err(e) => {
            warn!("Invalid redirect target {} in {}: {}", spec, domain, e);
            return SpfResult::PermError;
        }
    };

    if !ctx.enter(&target) {
        debug!("Not redirecting to {} again", target);
        return SpfResult::None;
    }
    if let Err(result) = ctx.count_lookup() {
        return result;
    }

    debug!("Redirecting from {} to {}", domain, target);
    check_domain(ctx, &target).await
}

/// Explanations are not computed
pub fn explanation(_spec: &str) -> SpfResult {
    SpfResult::None
}
