//! `converge module`: edit and inspect the Kyma module list

use clap::{Args, Subcommand};
use tracing::info;

use converge_apply::{
    EnableRequest, KymaReadiness, ModuleStatePredicate, ModuleWorkflow, MutationOutcome,
    ReadinessPredicate, ReadinessWatcher, SpecMutator,
};
use converge_common::crd::{CustomResourcePolicy, Kyma, KymaSpec};
use converge_common::manifest::decode_manifests;

use super::apply::read_source;
use super::format::{format_age, print_table};
use super::{CommandErrorExt, Context, PrintObserver};
use crate::{GlobalArgs, Result};

#[derive(Args, Debug)]
pub struct ModuleArgs {
    #[command(subcommand)]
    pub command: ModuleCommand,
}

#[derive(Subcommand, Debug)]
pub enum ModuleCommand {
    /// Add a module to the Kyma resource, or update its channel and policy
    Enable {
        name: String,
        /// Release channel for this module
        #[arg(long, short = 'c')]
        channel: Option<String>,
        /// Treatment of the module's default custom resource
        #[arg(long)]
        policy: Option<CustomResourcePolicy>,
        /// Wait until the module reports Ready or Warning
        #[arg(long, short = 'w')]
        wait: bool,
        /// Custom resources to apply once the module is ready, `-` for stdin
        #[arg(long)]
        cr_path: Option<String>,
    },
    /// Remove a module from the Kyma resource
    Disable {
        name: String,
        /// Only remove the module if it is on this channel
        #[arg(long, short = 'c')]
        channel: Option<String>,
        /// Wait until the Kyma resource is ready again
        #[arg(long, short = 'w')]
        wait: bool,
    },
    /// Let the lifecycle manager manage a module
    Manage {
        name: String,
        /// Treatment of the module's default custom resource
        #[arg(long, default_value = "CreateAndDelete")]
        policy: CustomResourcePolicy,
        /// Wait until the module reports Ready or Warning
        #[arg(long, short = 'w')]
        wait: bool,
    },
    /// Stop the lifecycle manager from managing a module
    Unmanage {
        name: String,
        /// Wait until the Kyma resource is ready again
        #[arg(long, short = 'w')]
        wait: bool,
    },
    /// List configured modules with their reported state
    List,
}

pub async fn run(global: &GlobalArgs, args: ModuleArgs) -> Result<()> {
    let ctx = Context::resolve(global).await?;
    match args.command {
        ModuleCommand::Enable {
            name,
            channel,
            policy,
            wait,
            cr_path,
        } => {
            let custom_resources = match &cr_path {
                Some(path) => decode_manifests(&read_source(path, std::io::stdin())?)?,
                None => Vec::new(),
            };
            let request = EnableRequest {
                name,
                channel,
                policy,
                wait,
                custom_resources,
            };
            let enabled = ModuleWorkflow::new(ctx.transport.clone())
                .enable(
                    &ctx.kyma(),
                    &request,
                    &ctx.settings.field_owner,
                    &ctx.wait_options(),
                    &mut PrintObserver::new(),
                )
                .await?;
            report(&request.name, "enabled", &enabled.outcome);
            if let Some(summary) = &enabled.applied {
                for outcome in &summary.outcomes {
                    println!("{} applied", outcome.reference);
                }
            }
        }
        ModuleCommand::Disable {
            name,
            channel,
            wait,
        } => {
            let outcome = mutate(&ctx, |spec| spec.disable_module(&name, channel.as_deref())).await?;
            report(&name, "disabled", &outcome);
            if wait {
                await_ready(&ctx, &KymaReadiness, &outcome).await?;
            }
        }
        ModuleCommand::Manage { name, policy, wait } => {
            let outcome = mutate(&ctx, |spec| spec.manage_module(&name, policy)).await?;
            report(&name, "managed", &outcome);
            if wait {
                await_ready(&ctx, &ModuleStatePredicate::new(&name), &outcome).await?;
            }
        }
        ModuleCommand::Unmanage { name, wait } => {
            let outcome = mutate(&ctx, |spec| spec.unmanage_module(&name)).await?;
            report(&name, "unmanaged", &outcome);
            if wait {
                await_ready(&ctx, &KymaReadiness, &outcome).await?;
            }
        }
        ModuleCommand::List => list(&ctx).await?,
    }
    Ok(())
}

async fn mutate<F>(ctx: &Context, transform: F) -> Result<MutationOutcome>
where
    F: Fn(&KymaSpec) -> converge_common::Result<KymaSpec>,
{
    let mutator = SpecMutator::new(ctx.transport.clone());
    Ok(mutator.mutate_spec(&ctx.kyma(), transform).await?)
}

fn report(name: &str, verb: &str, outcome: &MutationOutcome) {
    if outcome.is_changed() {
        println!("module {} {}", name, verb);
    } else {
        println!("module {} already {}", name, verb);
    }
}

async fn await_ready(
    ctx: &Context,
    predicate: &dyn ReadinessPredicate,
    outcome: &MutationOutcome,
) -> Result<()> {
    let watcher = ReadinessWatcher::new(ctx.transport.clone());
    watcher
        .wait_until_ready(
            &ctx.kyma(),
            predicate,
            outcome,
            &ctx.wait_options(),
            &mut PrintObserver::new(),
        )
        .await?;
    info!(kyma = %ctx.kyma(), "converged");
    Ok(())
}

async fn list(ctx: &Context) -> Result<()> {
    let obj = ctx.transport.get(&ctx.kyma()).await?;
    let kyma: Kyma = obj.try_parse().cmd_err()?;

    let state = kyma
        .status
        .as_ref()
        .map(|s| s.state().to_string())
        .unwrap_or_else(|| "-".to_string());
    let age = kyma
        .metadata
        .creation_timestamp
        .as_ref()
        .map(|ts| format_age(&ts.0))
        .unwrap_or_else(|| "-".to_string());
    println!("{}  state: {}  age: {}", ctx.kyma(), state, age);
    println!();
    print_table(
        &["NAME", "CHANNEL", "VERSION", "STATE", "MANAGED", "POLICY"],
        &module_rows(&kyma),
    );
    Ok(())
}

/// One row per module in the spec, then modules only the status knows about
fn module_rows(kyma: &Kyma) -> Vec<Vec<String>> {
    let dash = || "-".to_string();
    let mut names: Vec<&str> = kyma.spec.modules.iter().map(|m| m.name.as_str()).collect();
    if let Some(status) = &kyma.status {
        for module in &status.modules {
            if !names.contains(&module.name.as_str()) {
                names.push(&module.name);
            }
        }
    }

    names
        .into_iter()
        .map(|name| {
            let info = kyma.module_info(name);
            let spec = info.spec.as_ref();
            let status = info.status.as_ref();
            vec![
                name.to_string(),
                spec.and_then(|m| m.channel.clone())
                    .or_else(|| status.and_then(|s| s.channel.clone()))
                    .unwrap_or_else(|| kyma.spec.channel.clone()),
                status.and_then(|s| s.version.clone()).unwrap_or_else(dash),
                status.map(|s| s.state().to_string()).unwrap_or_else(dash),
                spec.map(|m| m.is_managed().to_string()).unwrap_or_else(dash),
                spec.and_then(|m| m.custom_resource_policy)
                    .map(|p| p.to_string())
                    .unwrap_or_else(dash),
            ]
        })
        .collect()
}
