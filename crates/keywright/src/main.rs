use anyhow::{Context, Result};
use clap::Parser;
use keywright_cli::{
    Cli, Command, ExpireCommand, HostsCommand, PermsCommand, RepoCommand, SettingsCommand,
};
use keywright_config::{AppConfig, AppConfigLayer, AppPaths, ConfigManager, PathsConfigLayer};
use keywright_core::{
    CloneRequest, Collaborators, ContextPaths, KeyContext, Lifecycle, Outcome, StrengthVerdict,
};
use keywright_keychain::{curve_from_name, DocumentSeal, KeyAlgorithm, NativeAgent, NativeKeyGenerator};
use keywright_ssh::{CommandValidator, SystemProcess};
use std::process::ExitCode;
use tracing::{debug, info, Subscriber};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{EnvFilter, Layer};

const STORE_KEY_ENV: &str = "KEYWRIGHT_STORE_KEY";

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let paths = AppPaths::new()?;
    let config_manager = ConfigManager::new(paths.clone());
    let overrides = cli_overrides(&cli)?;
    let config = config_manager.load(std::env::current_dir().ok().as_deref(), Some(overrides))?;

    if let Command::Settings {
        command: SettingsCommand::Init,
    } = cli.command
    {
        config_manager.save_default()?;
        println!("settings initialized at {}", paths.config_file.display());
        return Ok(ExitCode::SUCCESS);
    }

    let paths = paths.with_overrides(&config.paths);
    let _log_guard = init_logging(&config, &paths, config.logging.stdout || cli.verbose)?;
    info!(command = ?cli.command, "keywright starting");

    let seal = resolve_seal(&config)?;
    let ctx = KeyContext::open(
        &ContextPaths {
            ssh_dir: paths.ssh_dir.clone(),
            ssh_config: paths.ssh_config.clone(),
            state_dir: paths.state_dir.clone(),
        },
        seal,
    )?;
    let curve = curve_from_name(&config.keys.ecdsa_curve)
        .with_context(|| format!("unknown ecdsa curve {:?}", config.keys.ecdsa_curve))?;
    let mut lifecycle = Lifecycle::new(
        ctx,
        Collaborators {
            generator: Box::new(NativeKeyGenerator::new(config.keys.rsa_bits, curve)),
            agent: Box::new(NativeAgent::new()?),
            validator: Box::new(CommandValidator::new(SystemProcess::new())),
            invoker: Box::new(SystemProcess::new()),
        },
    );

    let success = dispatch(&mut lifecycle, &paths, cli.command)?;
    Ok(if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn cli_overrides(cli: &Cli) -> Result<AppConfigLayer> {
    let mut layer = match &cli.config {
        Some(path) => ConfigManager::load_layer(path)?,
        None => AppConfigLayer::default(),
    };
    if cli.ssh_dir.is_some() || cli.state_dir.is_some() {
        let paths = layer.paths.get_or_insert_with(PathsConfigLayer::default);
        if let Some(dir) = &cli.ssh_dir {
            paths.ssh_dir = Some(dir.clone());
        }
        if let Some(dir) = &cli.state_dir {
            paths.state_dir = Some(dir.clone());
        }
    }
    Ok(layer)
}

fn resolve_seal(config: &AppConfig) -> Result<Option<DocumentSeal>> {
    if let Ok(secret) = std::env::var(STORE_KEY_ENV) {
        if !secret.is_empty() {
            debug!("store key taken from environment");
            return Ok(Some(DocumentSeal::new(secret.into())));
        }
    }
    if !config.store.encrypt_at_rest {
        return Ok(None);
    }
    let seal = DocumentSeal::from_keyring(
        &config.store.keyring_service,
        &config.store.keyring_account,
    )?;
    Ok(Some(seal))
}

/// Daily-rolled file log, plus stderr when asked. Stdout stays reserved for
/// command output.
fn init_logging(
    config: &AppConfig,
    paths: &AppPaths,
    enable_stderr: bool,
) -> Result<tracing_appender::non_blocking::WorkerGuard> {
    std::fs::create_dir_all(&paths.log_dir)?;
    let file_appender = tracing_appender::rolling::daily(&paths.log_dir, "keywright.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    let json = config.logging.json;

    tracing_subscriber::registry()
        .with(env_filter)
        .with(log_layer(json, non_blocking, false))
        .with(enable_stderr.then(|| log_layer(json, std::io::stderr, true)))
        .try_init()?;
    Ok(guard)
}

fn log_layer<S, W>(json: bool, writer: W, ansi: bool) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(ansi && !json)
        .with_target(true);
    if json {
        layer.json().boxed()
    } else {
        layer.boxed()
    }
}

fn report(outcome: Outcome) -> bool {
    if outcome.success {
        println!("{}", outcome.message);
    } else {
        eprintln!("{}", outcome.message);
    }
    outcome.success
}

fn dispatch(lc: &mut Lifecycle, paths: &AppPaths, command: Command) -> Result<bool> {
    match command {
        Command::Create {
            name,
            key_type,
            comment,
            expiry,
        } => {
            let algorithm = match key_type {
                Some(raw) => raw.parse::<KeyAlgorithm>().map_err(anyhow::Error::msg)?,
                None => lc.context().store.config().default_key_type,
            };
            let created = report(lc.create(&name, algorithm, comment.as_deref())?);
            match expiry {
                Some(days) if created => Ok(report(lc.set_expiration(&name, days)?)),
                _ => Ok(created),
            }
        }
        Command::List { details } => {
            let keys = lc.list_keys()?;
            if keys.is_empty() {
                println!("No SSH keys found");
            }
            for name in keys {
                if !details {
                    println!("{name}");
                    continue;
                }
                let info = lc.key_info(&name)?;
                println!("\nKey: {}", info.name);
                println!("Type: {}", info.key_type.as_deref().unwrap_or("unknown"));
                println!("Comment: {}", info.comment.as_deref().unwrap_or(""));
                match &info.usage {
                    Some(usage) => println!("Last Used: {}", usage.last_used.to_rfc3339()),
                    None => println!("Last Used: never"),
                }
                match info.private_mode {
                    Some(mode) => println!("Permissions: {mode:03o}"),
                    None => println!("Permissions: unknown"),
                }
                println!("State: {}", info.state);
                if let Some(days) = info.days_left {
                    println!("Expires: in {days} days");
                }
            }
            Ok(true)
        }
        Command::Add { name } => {
            let path = lc.key_path(&name)?;
            Ok(report(lc.add_to_agent(&path)?))
        }
        Command::Remove { name } => {
            let path = name.map(|n| lc.key_path(&n)).transpose()?;
            Ok(report(lc.remove_from_agent(path.as_deref())?))
        }
        Command::Validate { provider } => Ok(report(lc.validate(&provider)?)),
        Command::Rotate { name } => {
            let path = lc.key_path(&name)?;
            Ok(report(lc.rotate(&path)?))
        }
        Command::Delete { name } => Ok(report(lc.delete(&name)?)),
        Command::Backup { dir } => {
            let dir = dir.unwrap_or_else(|| paths.backup_dir.clone());
            Ok(report(lc.backup(&dir)?))
        }
        Command::Restore { dir, overwrite } => {
            let dir = dir.unwrap_or_else(|| paths.backup_dir.clone());
            Ok(report(lc.restore(&dir, overwrite)?))
        }
        Command::Analyze { name } => {
            let results = lc.analyze(name.as_deref())?;
            if results.is_empty() {
                println!("No SSH keys found");
            }
            for (name, verdict) in &results {
                println!("Analysis for {name}:");
                println!("{verdict}");
            }
            Ok(!results
                .iter()
                .any(|(_, v)| matches!(v, StrengthVerdict::AnalysisError(_))))
        }
        Command::Stats { name } => {
            for (name, usage) in lc.stats(name.as_deref())? {
                println!("\nKey: {name}");
                match usage {
                    Some(usage) => {
                        println!("First used: {}", usage.created.to_rfc3339());
                        println!("Last used: {}", usage.last_used.to_rfc3339());
                        println!("Use count: {}", usage.use_count);
                    }
                    None => println!("No usage recorded"),
                }
            }
            Ok(true)
        }
        Command::Perms { command } => match command {
            PermsCommand::Check { name } => Ok(report(lc.check_key_permissions(&name)?)),
            PermsCommand::Fix { name } => Ok(report(lc.fix_key_permissions(&name)?)),
        },
        Command::Hosts { command } => match command {
            HostsCommand::List => {
                let hosts = lc.hosts()?;
                if hosts.is_empty() {
                    println!("No SSH config found");
                }
                for entry in hosts {
                    println!("\nHost: {}", entry.pattern);
                    for (option, value) in &entry.options {
                        println!("  {option}: {value}");
                    }
                }
                Ok(true)
            }
            HostsCommand::Set {
                host,
                key,
                user,
                port,
            } => Ok(report(lc.update_host(
                &host,
                key.as_deref(),
                user.as_deref(),
                port,
            )?)),
            HostsCommand::Remove { host } => Ok(report(lc.remove_host(&host)?)),
        },
        Command::Expire { command } => match command {
            ExpireCommand::Set { name, days } => Ok(report(lc.set_expiration(&name, days)?)),
            ExpireCommand::Remove { name } => Ok(report(lc.remove_expiration(&name)?)),
            ExpireCommand::Check => {
                let expiring = lc.check_expirations();
                if expiring.is_empty() {
                    println!("No keys are expiring soon");
                } else {
                    println!("Keys Expiring Soon:");
                    for (name, days_left) in expiring {
                        println!("{name}: {days_left} days remaining");
                    }
                }
                Ok(true)
            }
        },
        Command::Repo { command } => match command {
            RepoCommand::Clone {
                repo,
                provider,
                key,
                dest,
                git_email,
                git_name,
            } => Ok(report(lc.clone_repo(&CloneRequest {
                repo,
                provider,
                key,
                dest,
                git_email,
                git_name,
            })?)),
            RepoCommand::Link { path, key } => Ok(report(lc.link_checkout(&path, &key)?)),
            RepoCommand::Links { repo, key } => {
                let links = lc.repo_links(repo.as_deref(), key.as_deref());
                if links.is_empty() {
                    println!("No repository-key links found");
                } else {
                    println!("Repository-Key Links:");
                    for link in links {
                        println!("{} -> {}", link.url, link.key);
                    }
                }
                Ok(true)
            }
        },
        Command::Settings { .. } => Ok(true),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn directory_flags_become_path_overrides() {
        let cli = Cli::parse_from(["keywright", "list", "--ssh-dir", "/tmp/keys"]);
        let layer = cli_overrides(&cli).unwrap();
        let paths = layer.paths.unwrap();
        assert_eq!(paths.ssh_dir, Some(PathBuf::from("/tmp/keys")));
        assert!(paths.state_dir.is_none());
    }

    #[test]
    fn log_layers_build_for_both_formats() {
        for json in [false, true] {
            let subscriber = tracing_subscriber::registry()
                .with(log_layer(json, std::io::sink, false))
                .with(Some(log_layer(json, std::io::sink, true)));
            tracing::subscriber::with_default(subscriber, || info!(json, "layer ready"));
        }
    }
}
