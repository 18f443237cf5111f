#![forbid(unsafe_code)]

use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use qg_types::{
    Artifact, ArtifactFormat, CheckCategory, FindingKind, GuardResult, GuardStatus, Manifest,
    Severity, TypeError, bytes_to_gib, bytes_to_mib,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;
pub const MANIFEST_FILE_NAME: &str = "manifest.json";
pub const INTEGRITY_STAGE: &str = "integrity";
pub const MANIFEST_TARGET_STAGE: &str = "manifest-target";

#[derive(Debug, Error)]
pub enum IntegrityError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("manifest {path} is malformed: {source}")]
    ManifestFormat {
        path: PathBuf,
        #[source]
        source: TypeError,
    },
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("chunk size must be non-zero")]
    ZeroChunkSize,
}

impl IntegrityError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactDigest {
    pub algorithm: String,
    pub hex: String,
    pub bytes_read: u64,
}

/// Content hashing seam. Implementations must stream; artifacts can be
/// several gigabytes.
pub trait ContentHasher {
    fn algorithm(&self) -> &'static str;

    fn digest_reader(&self, reader: &mut dyn Read) -> io::Result<ArtifactDigest>;

    fn digest_file(&self, path: &Path) -> Result<ArtifactDigest, IntegrityError> {
        let mut file = File::open(path).map_err(|err| IntegrityError::io(path, err))?;
        self.digest_reader(&mut file)
            .map_err(|err| IntegrityError::io(path, err))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Sha256StreamHasher {
    chunk_size: usize,
}

impl Sha256StreamHasher {
    pub fn new(chunk_size: usize) -> Result<Self, IntegrityError> {
        if chunk_size == 0 {
            return Err(IntegrityError::ZeroChunkSize);
        }
        Ok(Self { chunk_size })
    }

    #[must_use]
    pub const fn chunk_size(&self) -> usize {
        self.chunk_size
    }
}

impl Default for Sha256StreamHasher {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl ContentHasher for Sha256StreamHasher {
    fn algorithm(&self) -> &'static str {
        "sha256"
    }

    fn digest_reader(&self, reader: &mut dyn Read) -> io::Result<ArtifactDigest> {
        let mut hasher = Sha256::new();
        let mut buffer = vec![0_u8; self.chunk_size];
        let mut bytes_read = 0_u64;
        loop {
            let n = match reader.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            };
            hasher.update(&buffer[..n]);
            bytes_read += n as u64;
        }
        Ok(ArtifactDigest {
            algorithm: self.algorithm().to_owned(),
            hex: format!("{:x}", hasher.finalize()),
            bytes_read,
        })
    }
}

// ── Manifest discovery ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestSource {
    Explicit(PathBuf),
    AutoDetected(PathBuf),
    /// Named explicitly but not on disk.
    Missing(PathBuf),
    Absent,
}

impl ManifestSource {
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::Explicit(path) | Self::AutoDetected(path) => Some(path),
            Self::Missing(_) | Self::Absent => None,
        }
    }
}

/// An explicit path always wins; otherwise `manifest.json` beside the
/// artifact is used when it exists. An explicit path that does not exist is
/// `Missing`, never an error.
#[must_use]
pub fn resolve_manifest_source(artifact: &Path, explicit: Option<&Path>) -> ManifestSource {
    if let Some(path) = explicit {
        return if path.exists() {
            ManifestSource::Explicit(path.to_path_buf())
        } else {
            ManifestSource::Missing(path.to_path_buf())
        };
    }
    let candidate = artifact
        .parent()
        .map_or_else(|| PathBuf::from(MANIFEST_FILE_NAME), |dir| dir.join(MANIFEST_FILE_NAME));
    if candidate.is_file() {
        ManifestSource::AutoDetected(candidate)
    } else {
        ManifestSource::Absent
    }
}

pub fn load_manifest(path: &Path) -> Result<Manifest, IntegrityError> {
    let text = fs::read_to_string(path).map_err(|err| IntegrityError::io(path, err))?;
    Manifest::from_json_str(&text).map_err(|source| IntegrityError::ManifestFormat {
        path: path.to_path_buf(),
        source,
    })
}

// ── Verification ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum IntegrityVerdict {
    Verified {
        digest: ArtifactDigest,
        size_checked: bool,
    },
    NoManifest {
        digest: ArtifactDigest,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        missing_path: Option<PathBuf>,
    },
    HashMismatch {
        expected: String,
        actual: String,
    },
    SizeMismatch {
        expected: u64,
        actual: u64,
    },
    Unverifiable {
        reason: String,
    },
}

impl IntegrityVerdict {
    /// Records which named manifest was absent. Only `NoManifest` changes.
    #[must_use]
    pub fn manifest_missing_at(self, path: &Path) -> Self {
        match self {
            Self::NoManifest { digest, .. } => Self::NoManifest {
                digest,
                missing_path: Some(path.to_path_buf()),
            },
            other => other,
        }
    }

    #[must_use]
    pub fn verified_hash(&self) -> Option<&str> {
        match self {
            Self::Verified { digest, .. } => Some(&digest.hex),
            _ => None,
        }
    }

    #[must_use]
    pub fn to_guard_result(&self) -> GuardResult {
        match self {
            Self::Verified {
                digest,
                size_checked,
            } => {
                let mut detail = format!("{} matches manifest ({})", digest.algorithm, digest.hex);
                if !size_checked {
                    detail.push_str("; manifest declares no size, size check skipped");
                }
                GuardResult::pass(INTEGRITY_STAGE, CheckCategory::Integrity, Severity::Hard, detail)
            }
            Self::NoManifest {
                digest,
                missing_path,
            } => {
                let lead = match missing_path {
                    Some(path) => format!("manifest {} not found", path.display()),
                    None => "no manifest supplied".to_owned(),
                };
                GuardResult::finding(
                    INTEGRITY_STAGE,
                    CheckCategory::Integrity,
                    Severity::Hard,
                    GuardStatus::Warn,
                    FindingKind::NoManifest,
                    format!(
                        "{lead}, verification skipped ({} {})",
                        digest.algorithm, digest.hex
                    ),
                )
            }
            Self::HashMismatch { expected, actual } => GuardResult::finding(
                INTEGRITY_STAGE,
                CheckCategory::Integrity,
                Severity::Hard,
                GuardStatus::Fail,
                FindingKind::HashMismatch,
                "content hash does not match manifest",
            )
            .with_values(actual.clone(), expected.clone()),
            Self::SizeMismatch { expected, actual } => GuardResult::finding(
                INTEGRITY_STAGE,
                CheckCategory::Integrity,
                Severity::Hard,
                GuardStatus::Fail,
                FindingKind::SizeMismatch,
                "artifact size does not match manifest",
            )
            .with_values(format!("{actual} bytes"), format!("{expected} bytes")),
            Self::Unverifiable { reason } => GuardResult::finding(
                INTEGRITY_STAGE,
                CheckCategory::Integrity,
                Severity::Hard,
                GuardStatus::Warn,
                FindingKind::IntegrityUnverifiable,
                format!("verification skipped: {reason}"),
            ),
        }
    }
}

/// Cross-checks the artifact against the manifest. Never returns an error:
/// an unreadable artifact becomes `Unverifiable` so the structural guards can
/// name the actual failure.
pub fn verify_artifact(
    hasher: &dyn ContentHasher,
    artifact: &Path,
    manifest: Option<&Manifest>,
) -> IntegrityVerdict {
    let actual_size = match fs::metadata(artifact) {
        Ok(meta) if meta.is_file() => meta.len(),
        Ok(_) => {
            return IntegrityVerdict::Unverifiable {
                reason: format!("{} is not a regular file", artifact.display()),
            };
        }
        Err(err) => {
            return IntegrityVerdict::Unverifiable {
                reason: format!("cannot stat {}: {err}", artifact.display()),
            };
        }
    };

    if let Some(expected) = manifest.and_then(|m| m.declared_size_bytes)
        && expected != actual_size
    {
        #[cfg(feature = "tracing")]
        tracing::warn!(expected, actual = actual_size, "manifest size mismatch");
        return IntegrityVerdict::SizeMismatch {
            expected,
            actual: actual_size,
        };
    }

    let digest = match hasher.digest_file(artifact) {
        Ok(digest) => digest,
        Err(err) => {
            return IntegrityVerdict::Unverifiable {
                reason: err.to_string(),
            };
        }
    };

    let Some(manifest) = manifest else {
        return IntegrityVerdict::NoManifest {
            digest,
            missing_path: None,
        };
    };

    match manifest.normalized_hash() {
        Some(expected) if expected == digest.hex => {
            #[cfg(feature = "tracing")]
            tracing::debug!(hash = %digest.hex, "content hash verified");
            IntegrityVerdict::Verified {
                digest,
                size_checked: manifest.declared_size_bytes.is_some(),
            }
        }
        Some(expected) => IntegrityVerdict::HashMismatch {
            expected,
            actual: digest.hex,
        },
        None => IntegrityVerdict::HashMismatch {
            expected: "<absent from manifest>".to_owned(),
            actual: digest.hex,
        },
    }
}

/// Soft check: the manifest names a different file than the one under test.
#[must_use]
pub fn manifest_target_check(artifact: &Artifact, manifest: &Manifest) -> Option<GuardResult> {
    let declared = manifest.model_file.as_deref()?;
    let declared_name = Path::new(declared).file_name()?.to_str()?;
    let actual_name = artifact.file_name()?;
    if declared_name == actual_name {
        return Some(GuardResult::pass(
            MANIFEST_TARGET_STAGE,
            CheckCategory::Integrity,
            Severity::Soft,
            format!("manifest describes {actual_name}"),
        ));
    }
    Some(
        GuardResult::finding(
            MANIFEST_TARGET_STAGE,
            CheckCategory::Integrity,
            Severity::Soft,
            GuardStatus::Warn,
            FindingKind::ManifestTargetMismatch,
            "manifest was written for a different file",
        )
        .with_values(actual_name, declared_name),
    )
}

// ── Manifest emission ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManifestDraft {
    pub model_id: String,
    pub quantization: Option<String>,
    pub sequence_length: Option<u32>,
    pub runtime: Option<String>,
    pub optimizations: Vec<String>,
}

/// Builds a sidecar manifest in the export tooling's layout, with
/// format-keyed file and size fields.
pub fn build_manifest(
    hasher: &dyn ContentHasher,
    artifact: &Path,
    draft: &ManifestDraft,
) -> Result<serde_json::Value, IntegrityError> {
    let digest = hasher.digest_file(artifact)?;
    let format = ArtifactFormat::from_path(artifact);
    let prefix = format.manifest_prefix();
    let file_name = artifact
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or_default()
        .to_owned();

    let mut map = serde_json::Map::new();
    map.insert("model_id".to_owned(), draft.model_id.clone().into());
    map.insert(format!("{prefix}_file"), file_name.into());
    map.insert(format!("{prefix}_size_bytes"), digest.bytes_read.into());
    map.insert(
        format!("{prefix}_size_mb"),
        round_to(bytes_to_mib(digest.bytes_read), 1).into(),
    );
    map.insert(
        format!("{prefix}_size_gb"),
        round_to(bytes_to_gib(digest.bytes_read), 3).into(),
    );
    map.insert("sha256".to_owned(), digest.hex.into());
    if let Some(quantization) = &draft.quantization {
        map.insert("quantization".to_owned(), quantization.clone().into());
    }
    if let Some(sequence_length) = draft.sequence_length {
        map.insert("sequence_length".to_owned(), sequence_length.into());
    }
    if let Some(runtime) = &draft.runtime {
        map.insert("runtime".to_owned(), runtime.clone().into());
    }
    map.insert("format".to_owned(), format.as_str().to_ascii_uppercase().into());
    map.insert("optimizations".to_owned(), draft.optimizations.clone().into());
    Ok(serde_json::Value::Object(map))
}

pub fn write_manifest(path: &Path, manifest: &serde_json::Value) -> Result<(), IntegrityError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).map_err(|err| IntegrityError::io(parent, err))?;
    }
    let text = serde_json::to_string_pretty(manifest)?;
    fs::write(path, text).map_err(|err| IntegrityError::io(path, err))
}

fn round_to(value: f64, places: i32) -> f64 {
    let scale = 10_f64.powi(places);
    (value * scale).round() / scale
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::io::Cursor;

    use proptest::prelude::*;
    use qg_types::{Artifact, FindingKind, GuardStatus, Manifest};
    use tempfile::tempdir;

    use super::{
        ContentHasher, IntegrityVerdict, ManifestDraft, ManifestSource, Sha256StreamHasher,
        build_manifest, load_manifest, manifest_target_check, resolve_manifest_source,
        verify_artifact, write_manifest,
    };

    const ABC_SHA256: &str = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";

    fn manifest_for(bytes: &[u8]) -> Manifest {
        let hasher = Sha256StreamHasher::default();
        let digest = hasher
            .digest_reader(&mut Cursor::new(bytes.to_vec()))
            .expect("digest");
        Manifest {
            model_id: Some("test/model".to_owned()),
            model_file: Some("model.pte".to_owned()),
            declared_size_bytes: Some(bytes.len() as u64),
            declared_hash: Some(digest.hex),
            ..Manifest::default()
        }
    }

    #[test]
    fn sha256_of_known_vector() {
        let hasher = Sha256StreamHasher::new(1).expect("hasher");
        let digest = hasher
            .digest_reader(&mut Cursor::new(b"abc".to_vec()))
            .expect("digest");
        assert_eq!(digest.hex, ABC_SHA256);
        assert_eq!(digest.bytes_read, 3);
    }

    #[test]
    fn zero_chunk_size_is_rejected() {
        assert!(Sha256StreamHasher::new(0).is_err());
    }

    #[test]
    fn matching_manifest_verifies() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("model.pte");
        fs::write(&path, b"weights").expect("write");
        let manifest = manifest_for(b"weights");

        let verdict = verify_artifact(&Sha256StreamHasher::default(), &path, Some(&manifest));
        assert!(matches!(verdict, IntegrityVerdict::Verified { size_checked: true, .. }));
        assert_eq!(verdict.to_guard_result().status, GuardStatus::Pass);
        assert!(verdict.verified_hash().is_some());
    }

    #[test]
    fn missing_manifest_is_a_warning() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("model.pte");
        fs::write(&path, b"weights").expect("write");

        let verdict = verify_artifact(&Sha256StreamHasher::default(), &path, None);
        let result = verdict.to_guard_result();
        assert_eq!(result.status, GuardStatus::Warn);
        assert_eq!(result.kind, Some(FindingKind::NoManifest));
        assert!(!result.halts());
    }

    #[test]
    fn size_mismatch_reports_both_sizes() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("model.pte");
        fs::write(&path, b"weights").expect("write");
        let mut manifest = manifest_for(b"weights");
        manifest.declared_size_bytes = Some(8);

        let verdict = verify_artifact(&Sha256StreamHasher::default(), &path, Some(&manifest));
        assert_eq!(
            verdict,
            IntegrityVerdict::SizeMismatch {
                expected: 8,
                actual: 7
            }
        );
        let result = verdict.to_guard_result();
        assert!(result.halts());
        assert_eq!(result.observed.as_deref(), Some("7 bytes"));
        assert_eq!(result.expected.as_deref(), Some("8 bytes"));
    }

    #[test]
    fn manifest_without_hash_fails_closed() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("model.pte");
        fs::write(&path, b"weights").expect("write");
        let mut manifest = manifest_for(b"weights");
        manifest.declared_hash = None;

        let verdict = verify_artifact(&Sha256StreamHasher::default(), &path, Some(&manifest));
        assert!(matches!(verdict, IntegrityVerdict::HashMismatch { .. }));
    }

    #[test]
    fn missing_artifact_is_unverifiable_not_fatal() {
        let dir = tempdir().expect("tempdir");
        let verdict = verify_artifact(
            &Sha256StreamHasher::default(),
            &dir.path().join("absent.pte"),
            None,
        );
        let result = verdict.to_guard_result();
        assert_eq!(result.kind, Some(FindingKind::IntegrityUnverifiable));
        assert!(!result.halts());
    }

    #[test]
    fn manifest_is_auto_detected_beside_artifact() {
        let dir = tempdir().expect("tempdir");
        let artifact = dir.path().join("model.pte");
        assert_eq!(resolve_manifest_source(&artifact, None), ManifestSource::Absent);

        fs::write(dir.path().join("manifest.json"), "{}").expect("manifest");
        assert_eq!(
            resolve_manifest_source(&artifact, None),
            ManifestSource::AutoDetected(dir.path().join("manifest.json"))
        );

        let explicit = dir.path().join("other.json");
        assert_eq!(
            resolve_manifest_source(&artifact, Some(&explicit)),
            ManifestSource::Missing(explicit.clone())
        );
        fs::write(&explicit, "{}").expect("explicit manifest");
        assert_eq!(
            resolve_manifest_source(&artifact, Some(&explicit)),
            ManifestSource::Explicit(explicit)
        );
    }

    #[test]
    fn missing_named_manifest_is_named_in_the_warning() {
        let dir = tempdir().expect("tempdir");
        let artifact = dir.path().join("model.pte");
        fs::write(&artifact, b"weights").expect("write");
        let named = dir.path().join("release/manifest.json");

        let result = verify_artifact(&Sha256StreamHasher::default(), &artifact, None)
            .manifest_missing_at(&named)
            .to_guard_result();
        assert_eq!(result.kind, Some(FindingKind::NoManifest));
        assert_eq!(result.status, GuardStatus::Warn);
        assert!(result.detail.contains(&named.display().to_string()));
    }

    #[test]
    fn malformed_manifest_is_an_error() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("manifest.json");
        fs::write(&path, "{not json").expect("write");
        let err = load_manifest(&path).expect_err("malformed");
        assert!(err.to_string().contains("malformed"));
    }

    #[test]
    fn manifest_target_mismatch_is_soft() {
        let mut manifest = Manifest::default();
        manifest.model_file = Some("exports/other.pte".to_owned());
        let artifact = Artifact::new("dist/model.pte");
        let result = manifest_target_check(&artifact, &manifest).expect("checked");
        assert_eq!(result.status, GuardStatus::Warn);
        assert!(!result.is_hard());

        manifest.model_file = Some("/abs/path/model.pte".to_owned());
        let result = manifest_target_check(&artifact, &manifest).expect("checked");
        assert_eq!(result.status, GuardStatus::Pass);
    }

    #[test]
    fn emitted_manifest_round_trips_through_verification() {
        let dir = tempdir().expect("tempdir");
        let artifact = dir.path().join("model.gguf");
        fs::write(&artifact, b"GGUF\x03\x00\x00\x00payload").expect("write");

        let draft = ManifestDraft {
            model_id: "bartowski/Llama-3.2-1B-Instruct-GGUF".to_owned(),
            quantization: Some("Q8_0".to_owned()),
            sequence_length: Some(512),
            runtime: Some("llama.cpp".to_owned()),
            optimizations: vec!["Q8_0 quantization (8-bit)".to_owned()],
        };
        let hasher = Sha256StreamHasher::default();
        let value = build_manifest(&hasher, &artifact, &draft).expect("manifest");
        assert_eq!(value["gguf_file"], "model.gguf");
        assert_eq!(value["format"], "GGUF");

        let manifest_path = dir.path().join("manifest.json");
        write_manifest(&manifest_path, &value).expect("write manifest");
        let manifest = load_manifest(&manifest_path).expect("load");
        let verdict = verify_artifact(&hasher, &artifact, Some(&manifest));
        assert!(matches!(verdict, IntegrityVerdict::Verified { .. }));
    }

    proptest! {
        #[test]
        fn hashing_is_deterministic_and_chunk_size_independent(
            bytes in proptest::collection::vec(any::<u8>(), 0..4096),
            chunk in 1_usize..512,
        ) {
            let small = Sha256StreamHasher::new(chunk).expect("hasher");
            let large = Sha256StreamHasher::default();
            let a = small.digest_reader(&mut Cursor::new(bytes.clone())).expect("a");
            let b = small.digest_reader(&mut Cursor::new(bytes.clone())).expect("b");
            let c = large.digest_reader(&mut Cursor::new(bytes)).expect("c");
            prop_assert_eq!(&a, &b);
            prop_assert_eq!(a.hex, c.hex);
        }

        #[test]
        fn single_bit_flip_in_declared_hash_is_detected(bit in 0_usize..256) {
            let dir = tempdir().expect("tempdir");
            let path = dir.path().join("model.pte");
            fs::write(&path, b"weights").expect("write");
            let mut manifest = manifest_for(b"weights");

            let hex = manifest.declared_hash.take().expect("hash");
            let mut bytes: Vec<u8> = (0..hex.len())
                .step_by(2)
                .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).expect("hex"))
                .collect();
            bytes[bit / 8] ^= 1 << (bit % 8);
            let flipped: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
            manifest.declared_hash = Some(flipped);

            let verdict = verify_artifact(&Sha256StreamHasher::default(), &path, Some(&manifest));
            let is_hash_mismatch = matches!(verdict, IntegrityVerdict::HashMismatch { .. });
            prop_assert!(is_hash_mismatch);
        }
    }
}
