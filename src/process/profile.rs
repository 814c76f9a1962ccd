use crate::error::Result;
use std::ffi::OsStr;
use std::fs;
use std::path::Path;
use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind};

/// Files copied from the template's `Default` profile.
const SEED_FILES: &[&str] = &[
    "Cookies",
    "Cookies-journal",
    "Login Data",
    "Login Data-journal",
    "Web Data",
    "Web Data-journal",
    "Preferences",
    "Secure Preferences",
];

/// Directories copied recursively from the template's `Default` profile.
const SEED_DIRS: &[&str] = &["Local Storage", "Session Storage", "IndexedDB", "Network"];

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SeedReport {
    pub copied: Vec<String>,
    pub skipped: Vec<String>,
}

/// Seed a fresh automation profile from an existing Chrome user data dir.
///
/// Does nothing once `<profile>/Default/Cookies` exists. Files Chrome holds
/// locked in the template are skipped with a warning.
pub fn seed_profile(template_dir: &Path, profile_dir: &Path) -> Result<SeedReport> {
    let target_default = profile_dir.join("Default");
    let mut report = SeedReport::default();

    if target_default.join("Cookies").exists() {
        tracing::debug!("Profile {:?} already seeded", profile_dir);
        return Ok(report);
    }

    let source_default = template_dir.join("Default");
    if !source_default.is_dir() {
        tracing::warn!("Template profile {:?} has no Default directory", template_dir);
        return Ok(report);
    }

    fs::create_dir_all(&target_default)?;
    tracing::info!(
        "Seeding automation profile {:?} from {:?}",
        profile_dir,
        template_dir
    );

    for name in SEED_FILES {
        let src = source_default.join(name);
        if !src.is_file() {
            continue;
        }
        match fs::copy(&src, target_default.join(name)) {
            Ok(_) => report.copied.push(name.to_string()),
            Err(e) => {
                tracing::warn!("Skipping {} (locked or unreadable): {}", name, e);
                report.skipped.push(name.to_string());
            }
        }
    }

    for name in SEED_DIRS {
        let src = source_default.join(name);
        if !src.is_dir() {
            continue;
        }
        match copy_dir(&src, &target_default.join(name)) {
            Ok(()) => report.copied.push(name.to_string()),
            Err(e) => {
                tracing::warn!("Skipping directory {}: {}", name, e);
                report.skipped.push(name.to_string());
            }
        }
    }

    let local_state = template_dir.join("Local State");
    if local_state.is_file() {
        match fs::copy(&local_state, profile_dir.join("Local State")) {
            Ok(_) => report.copied.push("Local State".to_string()),
            Err(e) => {
                tracing::warn!("Skipping Local State: {}", e);
                report.skipped.push("Local State".to_string());
            }
        }
    }

    tracing::info!(
        "Profile seeded: {} copied, {} skipped",
        report.copied.len(),
        report.skipped.len()
    );
    Ok(report)
}

fn copy_dir(src: &Path, dst: &Path) -> std::io::Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else if let Err(e) = fs::copy(entry.path(), &target) {
            // LOCK files and friends are held open by a running Chrome
            tracing::debug!("Skipping {:?}: {}", entry.path(), e);
        }
    }
    Ok(())
}

fn arg_text<S: AsRef<OsStr>>(arg: &S) -> String {
    arg.as_ref().to_string_lossy().into_owned()
}

/// Kill browser processes still holding `profile_dir`, which would otherwise
/// keep the profile lock and make the new instance hand off and exit.
pub fn kill_stale_processes(profile_dir: &Path) -> usize {
    let needle = format!("--user-data-dir={}", profile_dir.display());
    let own_pid = std::process::id();

    let mut system = System::new();
    system.refresh_processes_specifics(
        ProcessesToUpdate::All,
        ProcessRefreshKind::new().with_cmd(UpdateKind::Always),
    );

    let mut killed = 0;
    for (pid, process) in system.processes() {
        if pid.as_u32() == own_pid {
            continue;
        }
        let holds_profile = process.cmd().iter().any(|a| arg_text(a) == needle);
        if !holds_profile {
            continue;
        }
        if process.kill() {
            tracing::info!("Killed stale browser process {}", pid);
            killed += 1;
        } else {
            tracing::warn!("Failed to kill stale browser process {}", pid);
        }
    }
    killed
}
