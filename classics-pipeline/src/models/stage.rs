//! Pipeline stage names
//!
//! Eight fixed stages. Each declares one output artifact, relative to the
//! book's artifact directory, whose presence marks the stage as done.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    /// Source file → raw text
    Extraction,
    /// OCR cleanup of the raw text
    Cleaning,
    /// Chapter/character structure analysis
    StructureAnalysis,
    /// Quality review ahead of the approval gate
    Review,
    /// Pick scenes worth illustrating (paid)
    SceneSelection,
    /// Audio narration (paid)
    Narration,
    /// Scene illustration (paid)
    Illustration,
    /// Publish the finished package
    Deployment,
}

impl StageName {
    /// All stages in pipeline order
    pub const ALL: [StageName; 8] = [
        StageName::Extraction,
        StageName::Cleaning,
        StageName::StructureAnalysis,
        StageName::Review,
        StageName::SceneSelection,
        StageName::Narration,
        StageName::Illustration,
        StageName::Deployment,
    ];

    /// Stages that together take an approved book to COMPLETED
    pub const GENERATION: [StageName; 3] = [
        StageName::SceneSelection,
        StageName::Narration,
        StageName::Illustration,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageName::Extraction => "extraction",
            StageName::Cleaning => "cleaning",
            StageName::StructureAnalysis => "structure_analysis",
            StageName::Review => "review",
            StageName::SceneSelection => "scene_selection",
            StageName::Narration => "narration",
            StageName::Illustration => "illustration",
            StageName::Deployment => "deployment",
        }
    }

    /// Paid stages call external vendors and are budget-checked before every attempt
    pub fn is_paid(&self) -> bool {
        matches!(
            self,
            StageName::SceneSelection | StageName::Narration | StageName::Illustration
        )
    }

    /// Declared output artifact, relative to `<artifact_root>/<book_id>/`
    pub fn artifact(&self) -> &'static str {
        match self {
            StageName::Extraction => "extracted.txt",
            StageName::Cleaning => "cleaned.txt",
            StageName::StructureAnalysis => "structure.json",
            StageName::Review => "review.json",
            StageName::SceneSelection => "scenes.json",
            StageName::Narration => "narration/manifest.json",
            StageName::Illustration => "illustrations/manifest.json",
            StageName::Deployment => "deployment.json",
        }
    }

    /// Stages whose artifacts this stage reads. Extraction reads the
    /// registered source file instead.
    pub fn input_stages(&self) -> &'static [StageName] {
        match self {
            StageName::Extraction => &[],
            StageName::Cleaning => &[StageName::Extraction],
            StageName::StructureAnalysis => &[StageName::Cleaning],
            StageName::Review => &[StageName::StructureAnalysis],
            StageName::SceneSelection => &[StageName::Cleaning, StageName::StructureAnalysis],
            StageName::Narration => &[StageName::Cleaning],
            StageName::Illustration => &[StageName::SceneSelection],
            StageName::Deployment => &[StageName::Narration, StageName::Illustration],
        }
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        StageName::ALL
            .into_iter()
            .find(|stage| stage.as_str() == normalized)
            .ok_or_else(|| {
                let known: Vec<&str> = StageName::ALL.iter().map(|s| s.as_str()).collect();
                format!("unknown stage '{}' (expected one of: {})", s, known.join(", "))
            })
    }
}
