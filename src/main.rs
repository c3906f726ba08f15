use anyhow::{Context as _, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

use podweave::cli::{
    context_current, context_delete, context_list, context_set, context_use, control_plane,
    deploy_flow, format_context_list, format_current_context, format_plan, format_routing_table,
    format_teardown_report, image_config, load_flow, plan_flow, start_options, teardown_flow, Cli,
    Commands, ContextAction, ContextSettings,
};
use podweave::context::{default_config_path, load_config_from, save_config_to};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize logging
    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    if let Err(e) = run(cli).await {
        error!("{:#}", e);
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    // Load .env file if specified
    if let Some(ref env_file) = cli.env_file {
        dotenvy::from_path(env_file)
            .with_context(|| format!("Failed to load env file {}", env_file.display()))?;
    }

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let mut config = load_config_from(&config_path)
        .with_context(|| format!("Failed to load config {}", config_path.display()))?;

    match cli.command {
        Commands::Plan(args) => {
            let manifest = load_flow(&args.file, false)?;
            let images = image_config(&manifest, &config.defaults, true).await;
            print!("{}", format_plan(&plan_flow(&manifest, images)?));
        }

        Commands::Routes(args) => {
            let manifest = load_flow(&args.file, false)?;
            let images = image_config(&manifest, &config.defaults, true).await;
            let table = plan_flow(&manifest, images)?.routing_table();
            println!("{}", format_routing_table(&table)?);
        }

        Commands::Deploy(args) => {
            let manifest = load_flow(&args.file, args.noblock)?;
            let plane = control_plane(&config, args.dry_run)?;
            let images = image_config(&manifest, &config.defaults, args.dry_run).await;

            let cancel = CancellationToken::new();
            let on_interrupt = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupted, cancelling readiness wait");
                    on_interrupt.cancel();
                }
            });

            let options = start_options(&config.defaults, &args, Some(cancel));
            let table = deploy_flow(&manifest, plane, images, options)
                .await
                .with_context(|| format!("Failed to deploy flow '{}'", manifest.name))?;
            println!("{}", format_routing_table(&table)?);
        }

        Commands::Teardown(args) => {
            let manifest = load_flow(&args.file, false)?;
            let plane = control_plane(&config, args.dry_run)?;
            let images = image_config(&manifest, &config.defaults, true).await;
            let report = teardown_flow(&manifest, plane, images).await?;
            print!("{}", format_teardown_report(&report));
            if !report.is_clean() {
                anyhow::bail!("{} unit(s) could not be deleted", report.failures.len());
            }
        }

        Commands::Context(args) => match args.action {
            ContextAction::List => print!("{}", format_context_list(&context_list(&config))),
            ContextAction::Current => {
                let (name, server) = context_current(&config)?;
                print!("{}", format_current_context(&name, &server));
            }
            ContextAction::Use { name } => {
                context_use(&mut config, &name)?;
                save_config_to(&config, &config_path)?;
                println!("Switched to context \"{}\"", name);
            }
            ContextAction::Set {
                name,
                server,
                token,
                token_file,
                ca_file,
                insecure_skip_tls_verify,
            } => {
                let settings = ContextSettings {
                    server,
                    token,
                    token_file,
                    ca_file,
                    insecure_skip_tls_verify,
                };
                context_set(&mut config, &name, settings);
                save_config_to(&config, &config_path)?;
                println!("Context \"{}\" saved", name);
            }
            ContextAction::Delete { name } => {
                if context_delete(&mut config, &name) {
                    save_config_to(&config, &config_path)?;
                    println!("Deleted context \"{}\"", name);
                } else {
                    anyhow::bail!("Context \"{}\" not found", name);
                }
            }
        },
    }

    Ok(())
}
