use sha2::{Digest, Sha256};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Which stage of the pipeline a model file feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelRole {
    Detector,
    Recognizer,
    Liveness,
}

impl ModelRole {
    /// Stable identifier used as the session pool key.
    pub fn id(self) -> &'static str {
        match self {
            ModelRole::Detector => "detector",
            ModelRole::Recognizer => "recognizer",
            ModelRole::Liveness => "liveness",
        }
    }
}

/// Model file descriptor: role, expected filename, optional pinned SHA-256 checksum.
pub struct ModelFile {
    pub role: ModelRole,
    pub name: &'static str,
    /// `None` for site-supplied models whose digest is not pinned here.
    pub sha256: Option<&'static str>,
    /// Startup fails when a required model is missing.
    pub required: bool,
}

// Checksums verified from HuggingFace Git LFS pointer files (oid sha256: field).
// Source: https://huggingface.co/public-data/insightface/raw/main/models/buffalo_l/
pub const MODELS: &[ModelFile] = &[
    ModelFile {
        role: ModelRole::Detector,
        name: "det_10g.onnx",
        sha256: Some("5838f7fe053675b1c7a08b633df49e7af5495cee0493c7dcf6697200b85b5b91"),
        required: true,
    },
    ModelFile {
        role: ModelRole::Recognizer,
        name: "w600k_r50.onnx",
        sha256: Some("4c06341c33c2ca1f86781dab0e829f88ad5b64be9fba56e56bc9ebdefc619e43"),
        required: true,
    },
    ModelFile {
        role: ModelRole::Liveness,
        name: "anti_spoofing.onnx",
        sha256: None,
        required: false,
    },
];

#[derive(Error, Debug)]
pub enum ModelIntegrityError {
    #[error("model file not found: {name} ({path})")]
    MissingModel { name: &'static str, path: PathBuf },

    #[error("failed to open model file: {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read model file: {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(
        "model checksum mismatch for {name} ({path})\n  expected: {expected}\n  got:      {got}"
    )]
    ChecksumMismatch {
        name: &'static str,
        path: PathBuf,
        expected: String,
        got: String,
    },
}

/// Outcome of checking one manifest entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    /// Digest matched the pinned checksum.
    Pinned,
    /// File exists but the manifest carries no checksum for it.
    Unpinned,
    /// Optional model not installed.
    Absent,
}

/// Look up the manifest entry for a role.
pub fn model_file(role: ModelRole) -> &'static ModelFile {
    // every role has exactly one manifest entry
    MODELS
        .iter()
        .find(|m| m.role == role)
        .unwrap_or(&MODELS[0])
}

/// Resolve the on-disk path for a role inside `model_dir`.
pub fn model_path(model_dir: &Path, role: ModelRole) -> PathBuf {
    model_dir.join(model_file(role).name)
}

/// Compute SHA-256 hex digest of a file.
pub fn sha256_file_hex(path: &Path) -> Result<String, ModelIntegrityError> {
    let mut file = fs::File::open(path).map_err(|source| ModelIntegrityError::Open {
        path: path.to_path_buf(),
        source,
    })?;

    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];

    loop {
        let n = file
            .read(&mut buf)
            .map_err(|source| ModelIntegrityError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// Check one model file: it must exist, and match its checksum when one is pinned.
pub fn verify_model(model: &ModelFile, path: &Path) -> Result<Verification, ModelIntegrityError> {
    if !path.exists() {
        return Err(ModelIntegrityError::MissingModel {
            name: model.name,
            path: path.to_path_buf(),
        });
    }

    let Some(expected) = model.sha256 else {
        return Ok(Verification::Unpinned);
    };

    let digest = sha256_file_hex(path)?;
    if digest != expected {
        return Err(ModelIntegrityError::ChecksumMismatch {
            name: model.name,
            path: path.to_path_buf(),
            expected: expected.to_string(),
            got: digest,
        });
    }

    Ok(Verification::Pinned)
}

/// Verify every manifest entry under `model_dir`, stopping at the first failure.
pub fn verify_models_dir(
    model_dir: &Path,
) -> Result<Vec<(ModelRole, Verification)>, ModelIntegrityError> {
    verify_manifest(MODELS, model_dir)
}

fn verify_manifest(
    models: &[ModelFile],
    model_dir: &Path,
) -> Result<Vec<(ModelRole, Verification)>, ModelIntegrityError> {
    let mut report = Vec::with_capacity(models.len());
    for model in models {
        let path = model_dir.join(model.name);
        if !model.required && !path.exists() {
            report.push((model.role, Verification::Absent));
            continue;
        }
        report.push((model.role, verify_model(model, &path)?));
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "rollcall-models-test-{tag}-{}",
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ))
    }

    const PINNED: ModelFile = ModelFile {
        role: ModelRole::Detector,
        name: "model.onnx",
        sha256: Some("00"),
        required: true,
    };

    #[test]
    fn verify_model_rejects_missing() {
        let path = scratch_dir("missing").join("nope.onnx");
        let err = verify_model(&PINNED, &path).unwrap_err();
        assert!(matches!(err, ModelIntegrityError::MissingModel { .. }));
    }

    #[test]
    fn verify_model_rejects_mismatch() {
        let dir = scratch_dir("mismatch");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("model.onnx");
        fs::write(&path, b"hello").unwrap();

        let err = verify_model(&PINNED, &path).unwrap_err();
        assert!(matches!(err, ModelIntegrityError::ChecksumMismatch { .. }));

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn verify_model_accepts_unpinned_file() {
        let dir = scratch_dir("unpinned");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("anti_spoofing.onnx");
        fs::write(&path, b"weights").unwrap();

        let unpinned = model_file(ModelRole::Liveness);
        assert_eq!(verify_model(unpinned, &path).unwrap(), Verification::Unpinned);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn sha256_of_known_content() {
        let dir = scratch_dir("digest");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("model.onnx");
        fs::write(&path, b"hello").unwrap();

        assert_eq!(
            sha256_file_hex(&path).unwrap(),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn verify_models_dir_reports_missing() {
        let err = verify_models_dir(&scratch_dir("dir-missing")).unwrap_err();
        assert!(matches!(err, ModelIntegrityError::MissingModel { .. }));
    }

    #[test]
    fn verify_manifest_tolerates_absent_optional_model() {
        const MANIFEST: &[ModelFile] = &[
            ModelFile {
                role: ModelRole::Detector,
                name: "det.onnx",
                sha256: None,
                required: true,
            },
            ModelFile {
                role: ModelRole::Liveness,
                name: "live.onnx",
                sha256: None,
                required: false,
            },
        ];
        let dir = scratch_dir("dir-optional");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("det.onnx"), b"weights").unwrap();

        let report = verify_manifest(MANIFEST, &dir).unwrap();
        assert_eq!(
            report,
            vec![
                (ModelRole::Detector, Verification::Unpinned),
                (ModelRole::Liveness, Verification::Absent),
            ]
        );

        fs::remove_file(dir.join("det.onnx")).unwrap();
        assert!(verify_manifest(MANIFEST, &dir).is_err());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn every_role_has_a_manifest_entry() {
        for role in [ModelRole::Detector, ModelRole::Recognizer, ModelRole::Liveness] {
            assert_eq!(model_file(role).role, role);
        }
        assert!(model_path(Path::new("/m"), ModelRole::Recognizer).ends_with("w600k_r50.onnx"));
    }
}
