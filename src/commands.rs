use anyhow::{Context, Result, bail};
use camino::{Utf8Path, Utf8PathBuf};
use chromiumto::services::kernel::{KernelManifest, LocalDirectorySupplier};
use chromiumto::services::redirect::{self, BatchReport};
use chromiumto::services::walker;
use chromiumto::services::KernelRegistry;
use chromiumto::{
    AppDocument, AppRecord, AppRegistry, ConfigManager, ExclusionSet, Metrics, RedirectEngine,
    RedirectionState, ScanPolicy, StateChange, StateManager,
};
use humansize::{DECIMAL, format_size};
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;

pub fn engine(
    registry: ConfigManager,
    metrics: Arc<Metrics>,
) -> Result<RedirectEngine<ConfigManager>> {
    Ok(RedirectEngine::from_registry(registry)?.with_metrics(metrics))
}

fn absolute(path: &Utf8Path) -> Result<Utf8PathBuf> {
    let absolute = std::path::absolute(path)
        .with_context(|| format!("Cannot resolve {}", path))?;
    Utf8PathBuf::from_path_buf(absolute)
        .map_err(|p| anyhow::anyhow!("Path is not UTF-8: {}", p.display()))
}

// Known record for `path`, or a fresh one built from the directory.
fn resolve_app(document: &AppDocument, path: &Utf8Path) -> Result<AppRecord> {
    let path = absolute(path)?;
    Ok(document
        .find_app(&path)
        .cloned()
        .unwrap_or_else(|| walker::build_app_record(&path, &KernelManifest::default())))
}

fn print_batch(batch: &BatchReport) -> Result<()> {
    for result in &batch.results {
        let mark = if result.success { "ok" } else { "FAILED" };
        println!("  [{}] {}: {}", mark, result.app, result.message);
    }
    println!(
        ":: {} succeeded, {} failed",
        batch.success_count, batch.fail_count
    );

    if batch.results.iter().any(|r| r.requires_elevation) {
        println!(":: Some files were refused by the system; retry with administrator rights");
    }
    if batch.fail_count > 0 {
        bail!("{} of {} operations failed", batch.fail_count, batch.results.len());
    }
    Ok(())
}

pub async fn cmd_scan(registry: ConfigManager, full: bool, metrics: Arc<Metrics>) -> Result<()> {
    let policy = if full { ScanPolicy::Full } else { ScanPolicy::Quick };
    println!(":: {:?} scan", policy);

    let state = StateManager::new().with_metrics(metrics);
    let mut rx = state.subscribe();

    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} {msg}")
            .context("Invalid progress template")?,
    );
    pb.enable_steady_tick(Duration::from_millis(100));

    let printer = {
        let pb = pb.clone();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(StateChange::ProgressUpdated {
                        scanned,
                        total,
                        current_path,
                    }) => {
                        let path = current_path.map(|p| p.to_string()).unwrap_or_default();
                        pb.set_message(format!("{}/{} files  {}", scanned, total, path));
                    }
                    Ok(StateChange::AppFound { app }) => {
                        pb.println(format!("  {} ({}) at {}", app.name, app.version, app.path));
                    }
                    Ok(StateChange::ScanComplete { .. }) | Err(RecvError::Closed) => break,
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                }
            }
        })
    };

    let interrupt = {
        let state = state.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                state.stop_scan();
            }
        })
    };

    let scan_state = state.clone();
    let apps = tokio::task::spawn_blocking(move || scan_state.run_scan(policy, &registry)).await??;

    interrupt.abort();
    printer.await?;

    let cancelled = state.read(|s| s.last_scan_cancelled);
    pb.finish_with_message(if cancelled { "Scan cancelled." } else { "Scan complete." });
    println!(":: Found {} applications", apps.len());
    Ok(())
}

pub fn cmd_list(registry: &ConfigManager, redirected: bool) -> Result<()> {
    let document = registry.load()?;
    let apps = if redirected {
        &document.redirected_apps
    } else {
        &document.detected_apps
    };

    if apps.is_empty() {
        println!(":: No applications");
        return Ok(());
    }
    for app in apps {
        println!(
            "{:<24} {:<16} {:>10}  {:<20}  {}",
            app.name,
            app.version,
            format_size(app.size, DECIMAL),
            redirect::redirection_state(&app.path).to_string(),
            app.path
        );
    }
    Ok(())
}

pub fn cmd_status(registry: &ConfigManager, path: &Utf8Path) -> Result<()> {
    let document = registry.load()?;
    let app = resolve_app(&document, path)?;
    let state = redirect::redirection_state(&app.path);

    println!("{} ({})", app.name, app.path);
    println!("   Version: {}", app.version);
    println!("   State:   {}", state);
    println!(
        "   Indexed: {}",
        if document.is_indexed_redirected(&app.path) { "yes" } else { "no" }
    );
    Ok(())
}

pub fn cmd_redirect(
    engine: &RedirectEngine<ConfigManager>,
    paths: Vec<Utf8PathBuf>,
    all: bool,
) -> Result<()> {
    let document = engine.registry().load()?;
    let apps: Vec<AppRecord> = if all {
        document
            .detected_apps
            .iter()
            .filter(|app| engine.redirection_state(&app.path) == RedirectionState::Unredirected)
            .cloned()
            .collect()
    } else {
        paths
            .iter()
            .map(|path| resolve_app(&document, path))
            .collect::<Result<_>>()?
    };

    println!(":: Redirecting {} applications", apps.len());
    print_batch(&engine.redirect_all(&apps))
}

pub fn cmd_restore(
    engine: &RedirectEngine<ConfigManager>,
    paths: Vec<Utf8PathBuf>,
    all: bool,
) -> Result<()> {
    let document = engine.registry().load()?;
    let apps: Vec<AppRecord> = if all {
        document.redirected_apps.clone()
    } else {
        paths
            .iter()
            .map(|path| resolve_app(&document, path))
            .collect::<Result<_>>()?
    };

    println!(":: Restoring {} applications", apps.len());
    print_batch(&engine.restore_all(&apps))
}

pub fn cmd_kernel_show(engine: &RedirectEngine<ConfigManager>) {
    match engine.kernel().root() {
        Some(root) => {
            let usable = KernelRegistry::is_usable(root);
            println!("Shared kernel: {}", root);
            println!("   Exists:  {}", root.is_dir());
            println!("   Usable:  {}", usable);
        }
        None => println!("Shared kernel: not set"),
    }
}

pub fn cmd_kernel_init(
    engine: &mut RedirectEngine<ConfigManager>,
    app: &Utf8Path,
    target: &Utf8Path,
) -> Result<()> {
    let document = engine.registry().load()?;
    let app = resolve_app(&document, app)?;
    let target = absolute(target)?;

    let copied = engine.initialize_shared_kernel_from_app(&app, &target)?;
    println!(
        ":: Shared kernel at {} seeded from {} ({} files)",
        target,
        app.name,
        copied.len()
    );
    Ok(())
}

pub fn cmd_kernel_set(engine: &mut RedirectEngine<ConfigManager>, dir: &Utf8Path) -> Result<()> {
    engine.set_shared_kernel(dir)?;
    println!(":: Shared kernel set to {}", absolute(dir)?);
    Ok(())
}

pub fn cmd_kernel_import(
    engine: &mut RedirectEngine<ConfigManager>,
    source: &Utf8Path,
    target: &Utf8Path,
) -> Result<()> {
    let target = absolute(target)?;
    let supplier = LocalDirectorySupplier::new(absolute(source)?);
    engine.install_shared_kernel(&supplier, &target)?;
    println!(":: Shared kernel imported into {}", target);
    Ok(())
}

pub fn cmd_backups_list(engine: &RedirectEngine<ConfigManager>) -> Result<()> {
    let backups = engine.list_backups()?;
    if backups.is_empty() {
        println!(":: No backups");
        return Ok(());
    }

    let mut total = 0;
    for backup in &backups {
        println!(
            "{}  {} files, {}",
            backup.app,
            backup.files.len(),
            format_size(backup.total_size, DECIMAL)
        );
        total += backup.total_size;
    }
    println!(":: {} held in backups", format_size(total, DECIMAL));
    Ok(())
}

pub fn cmd_backups_discard(engine: &RedirectEngine<ConfigManager>, path: &Utf8Path) -> Result<()> {
    let path = absolute(path)?;
    engine.discard_backup(&path)?;
    println!(":: Discarded backup of {}", path);
    Ok(())
}

pub fn cmd_exclusions_list(registry: &ConfigManager) -> Result<()> {
    let document = registry.load()?;
    for pattern in document.scan_exclusions.iter() {
        let note = if ExclusionSet::is_protected(pattern) {
            "  (built-in)"
        } else {
            ""
        };
        println!("{}{}", pattern, note);
    }
    Ok(())
}

pub fn cmd_exclusions_add(registry: &ConfigManager, pattern: String) -> Result<()> {
    let mut exclusions = registry.load()?.scan_exclusions;
    if !exclusions.insert(pattern.clone()) {
        println!(":: {} is already excluded", pattern);
        return Ok(());
    }
    registry.set_scan_exclusions(&exclusions)?;
    println!(":: Excluding paths containing {}", pattern);
    Ok(())
}

pub fn cmd_exclusions_remove(registry: &ConfigManager, pattern: &str) -> Result<()> {
    let mut exclusions = registry.load()?.scan_exclusions;
    if ExclusionSet::is_protected(pattern) {
        bail!("{} is a built-in exclusion and cannot be removed", pattern);
    }
    if !exclusions.remove(pattern) {
        bail!("{} is not an exclusion", pattern);
    }
    registry.set_scan_exclusions(&exclusions)?;
    println!(":: Removed exclusion {}", pattern);
    Ok(())
}

pub fn cmd_reconcile(engine: &RedirectEngine<ConfigManager>) -> Result<()> {
    let report = engine.reconcile_index()?;
    for path in &report.added {
        println!("  indexed   {}", path);
    }
    for path in &report.removed {
        println!("  unindexed {}", path);
    }
    for path in &report.partial {
        println!("  partial   {} (restore before redirecting again)", path);
    }
    println!(
        ":: {} added, {} removed, {} need restore",
        report.added.len(),
        report.removed.len(),
        report.partial.len()
    );
    Ok(())
}
