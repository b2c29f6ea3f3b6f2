//! Priced-resource catalog and the content collaborator.
//!
//! The catalog maps a [`ResourceId`] to its price and metadata; the gate
//! consults it before issuing a challenge. Content loading is a separate
//! concern behind [`ContentSource`]: the gate decides *whether* to serve,
//! the content source decides *what*.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::types::{AmountSats, ResourceId};

/// The kind of a catalog entry, which also determines its default pricing
/// tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Knowledge,
    Intervention,
    Proprietary,
    Trajectory,
}

/// One priced resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceEntry {
    pub id: ResourceId,
    pub title: String,
    pub kind: ResourceKind,
    pub price_sats: AmountSats,
    /// File name the content source resolves, relative to its root.
    pub file: String,
}

/// Lookup table of priced resources, keyed by case-normalized id.
#[derive(Debug, Clone)]
pub struct Catalog {
    entries: HashMap<ResourceId, ResourceEntry>,
}

/// Error loading a catalog file.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("Failed to read catalog file at {0}: {1}")]
    FileRead(PathBuf, std::io::Error),
    #[error("Failed to parse catalog file: {0}")]
    Parse(#[from] serde_json::Error),
}

impl Catalog {
    pub fn from_entries<I: IntoIterator<Item = ResourceEntry>>(entries: I) -> Self {
        let entries = entries
            .into_iter()
            .map(|entry| (entry.id.clone(), entry))
            .collect();
        Self { entries }
    }

    /// Loads a catalog from a JSON array of entries.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, CatalogError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|e| CatalogError::FileRead(path.to_path_buf(), e))?;
        let entries: Vec<ResourceEntry> = serde_json::from_str(&content)?;
        Ok(Self::from_entries(entries))
    }

    /// The stress-management skill library the server originally shipped
    /// with: knowledge blocks at 50 sats, interventions at 75, proprietary
    /// protocols at 100, multi-week trajectories at 150.
    pub fn builtin() -> Self {
        use ResourceKind::*;
        let entry = |id: &str, kind, price, file: &str, title: &str| ResourceEntry {
            id: ResourceId::new(id),
            title: title.to_string(),
            kind,
            price_sats: AmountSats(price),
            file: file.to_string(),
        };
        Self::from_entries([
            entry("K01", Knowledge, 50, "K01_what_is_stress.md", "What is Stress?"),
            entry("K02", Knowledge, 50, "K02_autonomic_nervous_system.md", "The Autonomic Nervous System"),
            entry("K03", Knowledge, 50, "K03_overstimulated_brain.md", "The Overstimulated Brain"),
            entry("K04", Knowledge, 50, "K04_authenticity_self_image.md", "Authenticity and Self-Image"),
            entry("K05", Knowledge, 50, "K05_body_awareness.md", "Body Awareness"),
            entry("K06", Knowledge, 50, "K06_sleep_and_recovery.md", "Sleep and Recovery"),
            entry("K07", Knowledge, 50, "K07_nutrition_and_stress.md", "Nutrition and Stress"),
            entry("K08", Knowledge, 50, "K08_gratitude_neuroplasticity.md", "Gratitude as Neuroplasticity"),
            entry("I01", Intervention, 75, "I01_4_7_8_breathing.md", "4-7-8 Breathing Technique"),
            entry("I02", Intervention, 75, "I02_activity_monitor.md", "Activity Monitor"),
            entry("I03", Intervention, 75, "I03_body_scan_protocol.md", "Body Scan Protocol"),
            entry("I04", Intervention, 75, "I04_grounding_techniques.md", "Grounding Techniques"),
            entry("I05", Intervention, 75, "I05_sleep_hygiene_protocol.md", "Sleep Hygiene Protocol"),
            entry("I06", Intervention, 75, "I06_movement_exercise.md", "Movement and Exercise"),
            entry("I07", Intervention, 75, "I07_gratitude_practice.md", "Gratitude Practice"),
            entry("I08", Proprietary, 100, "I08_vergeetmuts_technique.md", "Forgive and Forget Hood (VergeetMuts)"),
            entry("C01", Proprietary, 100, "C01_co_regulation_protocol.md", "Co-Regulation Protocol (Corpus Systemics®)"),
            entry("T01", Trajectory, 150, "T01_post_concussion.md", "Post-Concussion Syndrome — 12 Week Recovery Path"),
            entry("T02", Trajectory, 150, "T02_post_covid.md", "Post-COVID — 12 Week Recovery Path"),
            entry("T03", Trajectory, 150, "T03_burnout.md", "Burnout — 16 Week Recovery Path"),
            entry("T04", Trajectory, 150, "T04_chronic_stress.md", "Chronic Stress / Prevention — 8 Week Path"),
        ])
    }

    pub fn get(&self, id: &ResourceId) -> Option<&ResourceEntry> {
        self.entries.get(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &ResourceEntry> {
        self.entries.values()
    }
}

/// External collaborator that produces the payload of a granted resource.
pub trait ContentSource: Send + Sync {
    /// The full content for a catalog entry, or `None` if unavailable.
    fn load(&self, entry: &ResourceEntry) -> Option<String>;
}

/// Content source reading markdown files from a directory.
#[derive(Debug, Clone)]
pub struct DirContentSource {
    root: PathBuf,
}

impl DirContentSource {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }
}

impl ContentSource for DirContentSource {
    fn load(&self, entry: &ResourceEntry) -> Option<String> {
        let path = self.root.join(&entry.file);
        match fs::read_to_string(&path) {
            Ok(content) => Some(content),
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "Resource content not readable");
                None
            }
        }
    }
}

/// First markdown section of `content`, for the free preview endpoint.
/// Cuts just before the second `## ` heading.
pub fn preview_of(content: &str) -> String {
    let mut sections = 0;
    let mut preview_lines = Vec::new();
    for line in content.lines() {
        if line.starts_with("## ") {
            sections += 1;
            if sections > 1 {
                break;
            }
        }
        preview_lines.push(line);
    }
    preview_lines.join("\n")
}
