//! Needle database: reference images the live screen is matched against.
//!
//! One needle is a `<name>.json` + `<name>.png` pair in the needle
//! directory. The JSON carries the tag list and the match areas; the
//! PNG is the full reference screen the areas index into.
//!
//! ```json
//! {
//!   "tags": ["login", "text-console"],
//!   "area": [
//!     {"xpos": 100, "ypos": 80, "width": 200, "height": 120, "match": 96}
//!   ]
//! }
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::image::ImageRef;

/// One region of a needle that must be present on screen.
#[derive(Debug, Clone)]
pub struct Area {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
    /// Required match percentage (0..100).
    pub match_level: f64,
}

/// A reference screen with tags and match areas.
pub struct Needle {
    pub name: String,
    pub tags: Vec<String>,
    pub areas: Vec<Area>,
    pub image: ImageRef,
}

impl Needle {
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}

/// On-disk JSON shape of a needle.
#[derive(Deserialize)]
struct NeedleFile {
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    area: Vec<AreaFile>,
}

#[derive(Deserialize)]
struct AreaFile {
    xpos: u32,
    ypos: u32,
    width: u32,
    height: u32,
    #[serde(rename = "match", default = "default_match_level")]
    match_level: f64,
}

fn default_match_level() -> f64 {
    96.0
}

/// Lookup of needles by tag, with reload-on-demand.
pub struct NeedleSet {
    dir: PathBuf,
    needles: Vec<Arc<Needle>>,
}

impl NeedleSet {
    /// Scan `dir` for needle JSON files. A missing directory is an
    /// empty set, not an error (visual assertions just never match).
    pub fn load<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let mut set = Self { dir: dir.as_ref().to_path_buf(), needles: Vec::new() };
        set.reload()?;
        Ok(set)
    }

    /// Rescan the needle directory, replacing the in-memory set.
    pub fn reload(&mut self) -> Result<()> {
        self.needles.clear();
        if !self.dir.is_dir() {
            return Ok(());
        }
        let mut entries: Vec<PathBuf> = std::fs::read_dir(&self.dir)
            .with_context(|| format!("failed to scan needle dir {}", self.dir.display()))?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().map(|e| e == "json").unwrap_or(false))
            .collect();
        // deterministic candidate order regardless of readdir order
        entries.sort();

        for json_path in entries {
            match Self::load_one(&json_path) {
                Ok(needle) => self.needles.push(Arc::new(needle)),
                Err(e) => eprintln!(
                    "  WARN: skipping needle {}: {:#}",
                    json_path.display(),
                    e
                ),
            }
        }
        Ok(())
    }

    fn load_one(json_path: &Path) -> Result<Needle> {
        let name = json_path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_string();
        let raw = std::fs::read_to_string(json_path)
            .with_context(|| format!("failed to read {}", json_path.display()))?;
        let file: NeedleFile = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse {}", json_path.display()))?;
        let png_path = json_path.with_extension("png");
        let image = ImageRef::load(&png_path)?;
        Ok(Needle {
            name,
            tags: file.tags,
            areas: file
                .area
                .into_iter()
                .map(|a| Area {
                    x: a.xpos,
                    y: a.ypos,
                    w: a.width,
                    h: a.height,
                    match_level: a.match_level,
                })
                .collect(),
            image,
        })
    }

    pub fn len(&self) -> usize {
        self.needles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.needles.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Needle>> {
        self.needles.iter()
    }

    /// All needles carrying `tag`.
    pub fn find_tag(&self, tag: &str) -> Vec<Arc<Needle>> {
        self.needles
            .iter()
            .filter(|n| n.has_tag(tag))
            .cloned()
            .collect()
    }

    /// Needle by exact name.
    pub fn find_name(&self, name: &str) -> Option<Arc<Needle>> {
        self.needles.iter().find(|n| n.name == name).cloned()
    }

    /// Expand tag atoms into the candidate needle list.
    ///
    /// Tags may expand into further tagged needle sets: every needle
    /// pulled in contributes its own tags to the frontier. Breadth
    /// first, stops when no new needles appear.
    pub fn expand(&self, atoms: &[String]) -> Vec<Arc<Needle>> {
        let mut queue: VecDeque<String> = atoms.iter().cloned().collect();
        let mut seen_tags: HashSet<String> = atoms.iter().cloned().collect();
        let mut have_names: HashSet<String> = HashSet::new();
        let mut out: Vec<Arc<Needle>> = Vec::new();

        while let Some(tag) = queue.pop_front() {
            for needle in self.find_tag(&tag) {
                if !have_names.insert(needle.name.clone()) {
                    continue;
                }
                for t in &needle.tags {
                    if seen_tags.insert(t.clone()) {
                        queue.push_back(t.clone());
                    }
                }
                out.push(needle);
            }
        }
        out
    }
}
