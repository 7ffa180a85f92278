use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

use agentmesh::config::Config;
use agentmesh::orchestrator::agents_dir;
use agentmesh::service::InvokerRegistry;

/// Default content for the data directory's .gitignore
const GITIGNORE_CONTENT: &str = r#"# agentmesh gitignore
# Runtime lifecycle state
state.json
*.tmp
"#;

pub fn run(dir: &Path) -> Result<()> {
    let agents = agents_dir(dir);
    if agents.exists() {
        anyhow::bail!("agentmesh already initialized at {}", dir.display());
    }

    fs::create_dir_all(&agents).context("Failed to create agents directory")?;
    InvokerRegistry::init(dir).context("Failed to write default executor config")?;
    Config::default()
        .save(dir)
        .context("Failed to write config.toml")?;
    fs::write(dir.join(".gitignore"), GITIGNORE_CONTENT).context("Failed to create .gitignore")?;

    println!("Initialized agentmesh at {}", dir.display());
    println!("  Next: amesh register <agent.md>");
    Ok(())
}
