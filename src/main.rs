//! backmey - main entry point
//!
//! Parses the command line, sets up logging and signal handling, and
//! dispatches to the library. Reports and JSON go to stdout, logs and
//! errors to stderr; the exit code tells failure kinds apart.

use anyhow::Context;
use std::collections::BTreeMap;
use std::io::IsTerminal;
use std::path::Path;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

use backmey::cli::{BackupArgs, Cli, Commands, InspectArgs, ListArgs, RestoreArgs, TemplateCommands};
use backmey::config::{resolve_home, Settings};
use backmey::packages::{discover, parse_manager_list, OsRelease};
use backmey::report::format_size;
use backmey::{
    read_manifest, ArchiveSource, Archiver, BackmeyError, BackupOptions, BackupStore,
    ComponentRegistry, ConflictPolicy, Detection, PlainArchive, RestoreOptions, Restorer,
    TemplateRegistry,
};

/// Initialize tracing on stderr. `--verbose` selects debug, `RUST_LOG` wins.
fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse_args();
    init_logging(cli.verbose);

    // On SIGINT/SIGTERM children are killed and scratch files removed
    if let Err(e) = backmey::process::init_signal_handlers() {
        tracing::warn!("Failed to initialize signal handlers: {}", e);
    }

    match run(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let code = e
                .downcast_ref::<BackmeyError>()
                .map(BackmeyError::exit_code)
                .unwrap_or(1);
            eprintln!("✗ {:#}", e);
            ExitCode::from(u8::try_from(code).unwrap_or(1))
        }
    }
}

fn run(command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Backup(args) => backup(args),
        Commands::Restore(args) => restore(args),
        Commands::Inspect(args) => inspect(args),
        Commands::List(args) => list(args),
        Commands::Detect => {
            println!("{}", serde_json::to_string_pretty(&Detection::detect())?);
            Ok(())
        }
        Commands::Templates { command } => templates(command),
    }
}

fn context() -> anyhow::Result<(std::path::PathBuf, Settings)> {
    let home = resolve_home()?;
    let settings = Settings::load(&home).context("Failed to load settings")?;
    Ok((home, settings))
}

fn backup(args: BackupArgs) -> anyhow::Result<()> {
    let (home, settings) = context()?;
    let store = BackupStore::new(args.store_dir.clone().unwrap_or_else(|| settings.store_dir(&home)));
    let registry = ComponentRegistry::builtin();

    let components = if args.components.is_empty() {
        settings.default_components.clone()
    } else {
        args.components.clone()
    };
    let mut excludes = args.excludes.clone();
    excludes.extend(settings.extra_excludes.iter().cloned());

    let opts = BackupOptions {
        profile: args.profile,
        version: args.version,
        output: args.output,
        components,
        with_browser_profiles: args.with_browser_profiles,
        includes: args.includes,
        excludes,
        smart_exclude: args.smart_exclude,
        notes: args.notes,
        encrypt: args.encrypt,
        skip_dconf: args.skip_dconf,
        no_packages: args.no_packages,
        report_sizes: args.report_sizes,
        dry_run: args.dry_run,
        compression: args.compression.unwrap_or(settings.compression),
        sync_command: args.sync_command,
    };

    let detection = Detection::detect();
    tracing::info!("Detected {}", detection);
    let managers = if opts.no_packages || opts.dry_run {
        Vec::new()
    } else {
        discover(&OsRelease::load(), &[])
    };

    let summary = Archiver::new(&registry, &home, store)
        .run(&opts, &detection, &managers)
        .context("Backup failed")?;
    print!("{}", summary.render());
    Ok(())
}

fn restore(args: RestoreArgs) -> anyhow::Result<()> {
    let (home, settings) = context()?;
    let store = BackupStore::new(args.store_dir.clone().unwrap_or_else(|| settings.store_dir(&home)));
    let templates = TemplateRegistry::new(
        args.template_dir
            .clone()
            .unwrap_or_else(|| settings.template_dir(&home)),
    );

    let source = match (args.archive, args.template, args.profile) {
        (Some(path), _, _) => ArchiveSource::Path(path),
        (None, Some(name), _) => ArchiveSource::Template(name),
        (None, None, Some(profile)) => ArchiveSource::Stored {
            profile,
            version: args.version,
        },
        (None, None, None) => {
            return Err(BackmeyError::validation("one of --archive, --template or --profile is required").into());
        }
    };
    let archive = source.locate(&store, &templates)?;

    let interactive = std::io::stdin().is_terminal() && std::io::stderr().is_terminal();
    let opts = RestoreOptions {
        components: args.components,
        policy: ConflictPolicy::from_flags(args.yes, args.skip_conflicts, interactive),
        dry_run: args.dry_run,
        snapshot_dir: if args.no_snapshot {
            None
        } else {
            Some(args.snapshot_dir.unwrap_or_else(|| settings.snapshot_dir(&home)))
        },
        skip_dconf: args.skip_dconf,
        install_packages: args.install_packages,
        install_dry_run: args.install_dry_run,
        assume_yes: args.yes,
        match_threshold: args.match_threshold.unwrap_or(settings.match_threshold),
    };

    let release = OsRelease::load();
    let requested = parse_manager_list(&args.install_managers)?;
    let managers = discover(&release, &requested);
    let registry = ComponentRegistry::builtin();

    let summary = Restorer::new(&registry, &home)
        .run(&archive, &opts, &managers, release)
        .context("Restore failed")?;
    print!("{}", summary.render());
    Ok(())
}

fn inspect(args: InspectArgs) -> anyhow::Result<()> {
    let (home, settings) = context()?;
    let source = match (args.archive, args.profile) {
        (Some(path), _) => ArchiveSource::Path(path),
        (None, Some(profile)) => ArchiveSource::Stored {
            profile,
            version: args.version,
        },
        (None, None) => return Err(BackmeyError::validation("one of --archive or --profile is required").into()),
    };
    let store = BackupStore::new(args.store_dir.unwrap_or_else(|| settings.store_dir(&home)));
    let templates = TemplateRegistry::new(settings.template_dir(&home));
    let archive = source.locate(&store, &templates)?;

    let plain = PlainArchive::open(&archive)?;
    let manifest = read_manifest(plain.path())?;
    println!("{}", serde_json::to_string_pretty(&manifest)?);
    Ok(())
}

fn list(args: ListArgs) -> anyhow::Result<()> {
    let (home, settings) = context()?;
    let store = BackupStore::new(args.store_dir.unwrap_or_else(|| settings.store_dir(&home)));
    let backups = store.list()?;
    let templates = if args.templates {
        TemplateRegistry::new(args.template_dir.unwrap_or_else(|| settings.template_dir(&home))).list()?
    } else {
        Vec::new()
    };

    if args.json {
        let versions: BTreeMap<&str, Vec<&str>> = backups
            .iter()
            .map(|(profile, archives)| {
                (profile.as_str(), archives.iter().map(|a| a.version.as_str()).collect())
            })
            .collect();
        let names: Vec<&str> = templates.iter().map(|(n, _)| n.as_str()).collect();
        let body = serde_json::json!({ "backups": versions, "templates": names });
        println!("{}", serde_json::to_string_pretty(&body)?);
        return Ok(());
    }

    if backups.is_empty() {
        println!("No backups in {}", store.root().display());
    }
    for (profile, archives) in &backups {
        println!("{}:", profile);
        for archive in archives {
            println!(
                "  {}  {}{}",
                archive.version,
                format_size(archive.size),
                if archive.encrypted { "  (encrypted)" } else { "" }
            );
        }
    }
    if args.templates {
        print_templates(&templates);
    }
    Ok(())
}

fn print_templates(templates: &[(String, std::path::PathBuf)]) {
    if templates.is_empty() {
        println!("No templates registered");
        return;
    }
    println!("Templates:");
    for (name, path) in templates {
        println!("  {}  {}", name, path.display());
    }
}

fn templates(command: TemplateCommands) -> anyhow::Result<()> {
    let (home, settings) = context()?;
    let dir = |explicit: Option<std::path::PathBuf>| explicit.unwrap_or_else(|| settings.template_dir(&home));
    match command {
        TemplateCommands::Register {
            name,
            archive,
            template_dir,
        } => {
            let dest = TemplateRegistry::new(dir(template_dir)).register(&name, Path::new(&archive))?;
            println!("✓ Template '{}' registered at {}", name, dest.display());
        }
        TemplateCommands::List { template_dir } => {
            print_templates(&TemplateRegistry::new(dir(template_dir)).list()?);
        }
    }
    Ok(())
}
