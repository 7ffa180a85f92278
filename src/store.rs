//! Durable storage for agent definitions.
//!
//! The registry only needs create/update/delete and a bulk load, so the
//! backend is a trait. Two backends ship with the crate: an in-memory store
//! for tests and embedding, and a directory of definition documents.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use log::{debug, warn};

use crate::definition::{AgentDefinition, parse_document, render_document};
use crate::error::Result;

/// Persistence backend for agent definitions.
pub trait DefinitionStore: Send + Sync {
    /// Load every stored definition, ordered by name.
    fn load_all(&self) -> Result<Vec<AgentDefinition>>;

    /// Create or overwrite the definition stored under `def.name`.
    fn save(&self, def: &AgentDefinition) -> Result<()>;

    /// Remove the definition stored under `name`. Removing an absent name
    /// is not an error.
    fn remove(&self, name: &str) -> Result<()>;
}

/// Keeps definitions in memory only.
#[derive(Default)]
pub struct MemoryStore {
    defs: Mutex<BTreeMap<String, AgentDefinition>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DefinitionStore for MemoryStore {
    fn load_all(&self) -> Result<Vec<AgentDefinition>> {
        let defs = self.defs.lock().unwrap_or_else(|e| e.into_inner());
        Ok(defs.values().cloned().collect())
    }

    fn save(&self, def: &AgentDefinition) -> Result<()> {
        let mut defs = self.defs.lock().unwrap_or_else(|e| e.into_inner());
        defs.insert(def.name.clone(), def.clone());
        Ok(())
    }

    fn remove(&self, name: &str) -> Result<()> {
        let mut defs = self.defs.lock().unwrap_or_else(|e| e.into_inner());
        defs.remove(name);
        Ok(())
    }
}

/// Stores each agent as `<dir>/<name>.md`.
///
/// On load, `*.yaml`/`*.yml` files holding a bare definition mapping (with
/// the instructions under `prompt`) are read as well. Files that fail to
/// parse are logged and skipped.
pub struct DirStore {
    dir: PathBuf,
}

impl DirStore {
    pub fn new(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.md", name))
    }

    fn load_file(path: &Path) -> Result<AgentDefinition> {
        let content = fs::read_to_string(path)?;
        let stem = path.file_stem().and_then(|s| s.to_str());
        match path.extension().and_then(|e| e.to_str()) {
            Some("md") => parse_document(&content, stem),
            _ => {
                let mut def: AgentDefinition = serde_yaml::from_str(&content)?;
                if def.name.is_empty() {
                    def.name = stem.unwrap_or_default().to_string();
                }
                if def.description.is_empty() {
                    def.description = format!("Microagent {}", def.name);
                }
                Ok(def)
            }
        }
    }
}

impl DefinitionStore for DirStore {
    fn load_all(&self) -> Result<Vec<AgentDefinition>> {
        let mut paths: Vec<PathBuf> = fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                p.is_file()
                    && matches!(
                        p.extension().and_then(|e| e.to_str()),
                        Some("md" | "yaml" | "yml")
                    )
            })
            .collect();
        paths.sort();

        let mut by_name: BTreeMap<String, AgentDefinition> = BTreeMap::new();
        for path in paths {
            match Self::load_file(&path) {
                Ok(def) => {
                    debug!("Loaded agent definition '{}' from {}", def.name, path.display());
                    if by_name.contains_key(&def.name) {
                        warn!(
                            "Ignoring {}: agent '{}' already defined by another file",
                            path.display(),
                            def.name
                        );
                        continue;
                    }
                    by_name.insert(def.name.clone(), def);
                }
                Err(e) => warn!("Error loading agent definition from {}: {}", path.display(), e),
            }
        }
        Ok(by_name.into_values().collect())
    }

    fn save(&self, def: &AgentDefinition) -> Result<()> {
        let doc = render_document(def)?;
        let path = self.path_for(&def.name);
        let tmp = path.with_extension("md.tmp");
        fs::write(&tmp, doc)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn remove(&self, name: &str) -> Result<()> {
        for ext in ["md", "yaml", "yml"] {
            let path = self.dir.join(format!("{}.{}", name, ext));
            if path.exists() {
                fs::remove_file(&path)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_memory_store_crud() {
        let store = MemoryStore::new();
        store.save(&AgentDefinition::new("b")).unwrap();
        store.save(&AgentDefinition::new("a")).unwrap();
        let names: Vec<_> = store.load_all().unwrap().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["a", "b"]);

        store.remove("a").unwrap();
        store.remove("missing").unwrap();
        assert_eq!(store.load_all().unwrap().len(), 1);
    }

    #[test]
    fn test_dir_store_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let store = DirStore::new(temp_dir.path()).unwrap();

        let mut def = AgentDefinition::new("scraper").with_capabilities(&["scrape"]);
        def.instructions = "Scrape things.".to_string();
        store.save(&def).unwrap();

        assert!(temp_dir.path().join("scraper.md").exists());
        let loaded = store.load_all().unwrap();
        assert_eq!(loaded, vec![def]);

        store.remove("scraper").unwrap();
        assert!(store.load_all().unwrap().is_empty());
    }

    #[test]
    fn test_dir_store_reads_yaml_definitions() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(
            temp_dir.path().join("summarizer.yaml"),
            "description: Summarizes\ncapabilities: [summarize]\nprompt: Summarize input.\n",
        )
        .unwrap();

        let store = DirStore::new(temp_dir.path()).unwrap();
        let loaded = store.load_all().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].name, "summarizer");
        assert_eq!(loaded[0].instructions, "Summarize input.");
    }

    #[test]
    fn test_dir_store_skips_unparsable_files() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("broken.md"), "---\nname: [unclosed\n---\n").unwrap();
        fs::write(temp_dir.path().join("notes.txt"), "ignored").unwrap();

        let store = DirStore::new(temp_dir.path()).unwrap();
        assert!(store.load_all().unwrap().is_empty());
    }
}
