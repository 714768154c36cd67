//! Init Command
//!
//! Create `.lessonforge/` in the current directory with a default config and
//! an initialized job database.

use crate::cli::ui::Output;
use crate::config::ConfigLoader;
use crate::storage::Database;
use crate::types::{ForgeError, Result};

pub fn run(force: bool) -> Result<()> {
    let root = std::env::current_dir()?;
    let project_dir = root.join(ConfigLoader::project_dir());

    if project_dir.exists() && !force {
        return Err(ForgeError::Config(
            "Already initialized. Use --force to re-initialize.".to_string(),
        ));
    }

    let project_dir = ConfigLoader::init_project(&root)?;
    let config = ConfigLoader::load_from_file(&project_dir.join("config.toml"))?;

    let db = Database::open(root.join(&config.storage.db_path))?;
    db.initialize()?;

    let out = Output::new();
    out.success("Initialized lessonforge in .lessonforge/");
    out.field("config", project_dir.join("config.toml").display());
    out.field("database", config.storage.db_path.display());
    println!();
    println!("Next steps:");
    println!("  1. Set {} or switch llm.provider to \"fixture\"", config.llm.api_key_env);
    println!("  2. Run 'lessonforge run \"<topic>\"' to generate a lesson");

    Ok(())
}
