//! Artifact layout under `<artifact_root>/<book_id>/`

use std::path::{Path, PathBuf};

use crate::models::{Book, StageName};

#[derive(Debug, Clone)]
pub struct ArtifactLayout {
    root: PathBuf,
}

impl ArtifactLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn book_dir(&self, book_id: &str) -> PathBuf {
        self.root.join(book_id)
    }

    /// Declared output artifact of `stage` for a book
    pub fn output(&self, book_id: &str, stage: StageName) -> PathBuf {
        self.book_dir(book_id).join(stage.artifact())
    }

    pub fn exists(&self, book_id: &str, stage: StageName) -> bool {
        self.output(book_id, stage).is_file()
    }

    /// Input paths for `stage`; extraction reads the registered source file
    pub fn inputs(&self, book: &Book, stage: StageName) -> Vec<PathBuf> {
        if stage == StageName::Extraction {
            return vec![PathBuf::from(&book.source_path)];
        }
        stage
            .input_stages()
            .iter()
            .map(|input| self.output(&book.id, *input))
            .collect()
    }

    /// Inputs that are not on disk yet. A source registered as a URI is
    /// left for the extraction stage to fetch.
    pub fn missing_inputs(&self, book: &Book, stage: StageName) -> Vec<PathBuf> {
        self.inputs(book, stage)
            .into_iter()
            .filter(|path| !path.exists() && !path.to_string_lossy().contains("://"))
            .collect()
    }

    /// True once every generation stage has produced its artifact
    pub fn generation_complete(&self, book_id: &str) -> bool {
        StageName::GENERATION
            .iter()
            .all(|stage| self.exists(book_id, *stage))
    }
}
