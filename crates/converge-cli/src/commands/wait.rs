//! `converge wait`: block until the Kyma resource is ready

use clap::Args;

use converge_apply::{KymaReadiness, ModuleStatePredicate, ReadinessPredicate, ReadinessWatcher};

use super::{Context, PrintObserver};
use crate::{GlobalArgs, Result};

#[derive(Args, Debug)]
pub struct WaitArgs {
    /// Wait for this module instead of the whole Kyma resource
    #[arg(long)]
    pub module: Option<String>,
}

impl WaitArgs {
    fn predicate(&self) -> Box<dyn ReadinessPredicate> {
        match &self.module {
            Some(name) => Box::new(ModuleStatePredicate::new(name)),
            None => Box::new(KymaReadiness),
        }
    }
}

pub async fn run(global: &GlobalArgs, args: WaitArgs) -> Result<()> {
    let ctx = Context::resolve(global).await?;
    let key = ctx.kyma();

    ReadinessWatcher::new(ctx.transport.clone())
        .wait_from_current(
            &key,
            args.predicate().as_ref(),
            &ctx.wait_options(),
            &mut PrintObserver::new(),
        )
        .await?;
    println!("{} is ready", key);
    Ok(())
}
