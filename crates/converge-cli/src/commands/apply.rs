//! `converge apply`: server-side apply a manifest

use std::future::Future;
use std::io::Read;
use std::time::Duration;

use clap::Args;
use tracing::info;

use converge_apply::{ApplySummary, ConcurrentPatcher};
use converge_common::manifest::decode_manifests;
use converge_common::retry::{retry_collecting, Backoff, RetryPolicy};

use super::Context;
use crate::{Error, GlobalArgs, Result};

/// Attempts of the whole batch before giving up
const APPLY_ATTEMPTS: u32 = 3;
/// First pause between batch attempts
const APPLY_BACKOFF: Duration = Duration::from_secs(3);

#[derive(Args, Debug)]
pub struct ApplyArgs {
    /// Manifest to apply, `-` for stdin
    #[arg(long, short = 'f')]
    pub filename: String,

    /// Take ownership of fields held by other managers
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub force_conflicts: bool,
}

pub async fn run(global: &GlobalArgs, args: ApplyArgs) -> Result<()> {
    let input = read_source(&args.filename, std::io::stdin())?;
    let objects = decode_manifests(&input)?;
    if objects.is_empty() {
        info!(source = %args.filename, "manifest contains no objects");
        return Ok(());
    }

    let ctx = Context::resolve(global).await?;
    let patcher = ConcurrentPatcher::new(ctx.transport.clone());
    let owner = ctx.settings.field_owner.as_str();

    let summary =
        apply_with_retry(|| patcher.apply(owner, args.force_conflicts, objects.clone())).await?;

    for outcome in &summary.outcomes {
        println!("{} applied", outcome.reference);
    }
    println!(
        "{} resources applied in {:.1}s",
        summary.applied(),
        summary.elapsed.as_secs_f64()
    );
    Ok(())
}

/// Resend the whole batch while its failures look transient
async fn apply_with_retry<F, Fut>(apply: F) -> converge_common::Result<ApplySummary>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = converge_common::Result<ApplySummary>>,
{
    retry_collecting(
        &apply_policy(),
        "apply",
        converge_common::Error::is_retryable,
        apply,
    )
    .await
}

fn apply_policy() -> RetryPolicy {
    RetryPolicy::with_max_attempts(APPLY_ATTEMPTS)
        .initial_backoff(APPLY_BACKOFF)
        .backoff(Backoff::Exponential { multiplier: 2.0 })
}

/// Read a manifest from a path, or from `stdin` when the path is `-`
pub(crate) fn read_source(source: &str, mut stdin: impl Read) -> Result<String> {
    if source == "-" {
        let mut input = String::new();
        stdin.read_to_string(&mut input)?;
        return Ok(input);
    }
    std::fs::read_to_string(source)
        .map_err(|e| Error::command_failed(format!("failed to read {}: {}", source, e)))
}
