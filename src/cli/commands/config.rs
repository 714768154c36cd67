//! Config Command
//!
//! Usage:
//!   lessonforge config show [-f json|toml]
//!   lessonforge config path
//!   lessonforge config init

use std::path::Path;

use crate::cli::ui::Output;
use crate::cli::util::load_config;
use crate::config::ConfigLoader;
use crate::types::Result;

/// Print the effective configuration after all sources are merged
pub fn show(config_path: Option<&Path>, format: &str) -> Result<()> {
    let config = load_config(config_path)?;
    println!("{}", ConfigLoader::render(&config, format == "json")?);
    Ok(())
}

/// Print where configuration is read from
pub fn path() -> Result<()> {
    let out = Output::new();
    match ConfigLoader::global_config_path() {
        Some(global) => out.field(
            "global",
            format!("{}{}", global.display(), missing(&global)),
        ),
        None => out.field("global", "(no home directory)"),
    }
    let project = ConfigLoader::project_config_path();
    out.field("project", format!("{}{}", project.display(), missing(&project)));
    out.field("env", "LESSONFORGE_<SECTION>__<KEY>");
    Ok(())
}

/// Write the default project config if none exists
pub fn init() -> Result<()> {
    let root = std::env::current_dir()?;
    let dir = ConfigLoader::init_project(&root)?;
    Output::new().success(&format!("Config ready at {}", dir.join("config.toml").display()));
    Ok(())
}

fn missing(path: &Path) -> &'static str {
    if path.exists() { "" } else { " (missing)" }
}
