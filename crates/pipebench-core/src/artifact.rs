use std::path::{Path, PathBuf};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ModelArtifact {
    OnnxPath(PathBuf),
    /// JSON stage description understood by the simulated backend.
    SimProfilePath(PathBuf),
    /// A computation the backend already knows by name (no file involved).
    Builtin(String),
}

impl ModelArtifact {
    /// Guess the artifact kind from the file extension; unknown extensions are
    /// treated as ONNX files.
    pub fn from_path(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => {
                Self::SimProfilePath(path.to_path_buf())
            }
            _ => Self::OnnxPath(path.to_path_buf()),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Self::OnnxPath(p) | Self::SimProfilePath(p) => p.display().to_string(),
            Self::Builtin(name) => format!("builtin:{name}"),
        }
    }
}
