use clap::Parser;
use cli::{Args, Commands};
use logging::setup_logging;
use miette::IntoDiagnostic;
use regfetch_client::RegistryClient;
use regfetch_config::config::{self, config_path, get_config, set_config_path};
use regfetch_utils::path::resolve_path;
use tracing::info;

mod cli;
mod fetch;
mod inspect;
mod logging;
mod utils;

fn handle_cli(args: Args) -> miette::Result<()> {
    utils::set_color(!args.no_color);

    if let Some(ref path) = args.config {
        set_config_path(resolve_path(path).into_diagnostic()?);
    }

    if let Commands::DefConfig = args.command {
        config::generate_default_config()?;
        return Ok(());
    }

    config::init()?;
    let config = get_config();

    if let Commands::Env = args.command {
        let registry = match args.registry.as_deref() {
            Some(name) => config.get_registry(name)?,
            None => config.default_registry()?,
        };
        info!("REGFETCH_CONFIG={}", config_path().display());
        info!("REGFETCH_CACHE={}", config.get_cache_path()?.display());
        if let Some(shared) = config.get_shared_dir()? {
            info!("REGFETCH_SHARED_DIR={}", shared.display());
        }
        info!("REGFETCH_REGISTRY={} ({})", registry.name, registry.url);
        return Ok(());
    }

    let client = RegistryClient::from_config(&config, args.registry.as_deref())?;

    match args.command {
        Commands::Manifest {
            reference,
            resolve,
            raw,
        } => inspect::show_manifest(&client, &reference, resolve, raw),
        Commands::Tags {
            repository,
            page_size,
            last,
            all,
        } => inspect::list_tags(&client, &repository, page_size, last.as_deref(), all),
        Commands::Head {
            repository,
            reference,
            manifest,
        } => inspect::head(&client, &repository, &reference, manifest),
        Commands::Blob {
            repository,
            digest,
            output,
            size,
            range,
        } => fetch::fetch_blob(
            &client,
            &repository,
            &digest,
            &output,
            size,
            range.as_deref(),
        ),
        Commands::Pull {
            reference,
            output,
        } => fetch::pull_image(&client, &reference, &output),
        Commands::DefConfig | Commands::Env => Ok(()),
    }
}

fn main() -> miette::Result<()> {
    miette::set_hook(Box::new(|_| {
        Box::new(
            miette::MietteHandlerOpts::new()
                .terminal_links(true)
                .unicode(true)
                .context_lines(2)
                .build(),
        )
    }))
    .ok();

    let args = Args::parse();
    setup_logging(&args);

    handle_cli(args)
}
