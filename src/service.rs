//! Host service-manager integration.
//!
//! The `install`/`start`/`stop`/`uninstall` sub-commands manage a systemd
//! unit pointing at the current executable; running with no sub-command is
//! the service itself.

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use std::process::Command;

pub const UNIT_NAME: &str = "techlog-pump.service";
const UNIT_DIR: &str = "/etc/systemd/system";

#[derive(Debug, Clone, Copy)]
pub enum Action {
    Install,
    Start,
    Stop,
    Uninstall,
}

pub fn control(action: Action, config_path: &Path) -> Result<()> {
    match action {
        Action::Install => install(config_path),
        Action::Start => systemctl(&["start", UNIT_NAME]),
        Action::Stop => systemctl(&["stop", UNIT_NAME]),
        Action::Uninstall => uninstall(),
    }
}

fn install(config_path: &Path) -> Result<()> {
    let executable = std::env::current_exe().context("cannot determine executable path")?;
    let config = std::fs::canonicalize(config_path)
        .with_context(|| format!("config {} must exist before install", config_path.display()))?;

    let unit_path = unit_path();
    std::fs::write(&unit_path, unit_file(&executable, &config))
        .with_context(|| format!("failed to write {}", unit_path.display()))?;
    systemctl(&["daemon-reload"])?;
    systemctl(&["enable", UNIT_NAME])?;
    println!("installed {}", unit_path.display());
    Ok(())
}

fn uninstall() -> Result<()> {
    // Disabling an already-disabled unit is not an error worth stopping for.
    let _ = systemctl(&["disable", UNIT_NAME]);
    let unit_path = unit_path();
    if unit_path.exists() {
        std::fs::remove_file(&unit_path)
            .with_context(|| format!("failed to remove {}", unit_path.display()))?;
    }
    systemctl(&["daemon-reload"])?;
    println!("removed {}", unit_path.display());
    Ok(())
}

fn unit_path() -> PathBuf {
    Path::new(UNIT_DIR).join(UNIT_NAME)
}

fn unit_file(executable: &Path, config: &Path) -> String {
    format!(
        "[Unit]\n\
         Description=1C technology-log pump into ClickHouse\n\
         After=network-online.target\n\
         \n\
         [Service]\n\
         ExecStart={} --config {}\n\
         Restart=on-failure\n\
         RestartSec=5\n\
         \n\
         [Install]\n\
         WantedBy=multi-user.target\n",
        executable.display(),
        config.display()
    )
}

fn systemctl(args: &[&str]) -> Result<()> {
    let status = Command::new("systemctl")
        .args(args)
        .status()
        .context("failed to run systemctl")?;
    if !status.success() {
        bail!("systemctl {} exited with {status}", args.join(" "));
    }
    Ok(())
}
