#![forbid(unsafe_code)]

use std::fs::{self, File};
use std::io::{self, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use flate2::{write::GzEncoder, Compression};
use forge_kernel_contracts::build::{BuildVariables, ContextHandle, BUILD_CONTEXT_DIR};
use sha2::{Digest, Sha256};
use tar::Header;
use tracing::{debug, info};

use crate::backend::{BackendError, ContextStore};

pub const SCHEMA_FILE_NAME: &str = "schema.json";
pub const UI_SCHEMA_FILE_NAME: &str = "ui_schema.json";

#[derive(Debug, thiserror::Error)]
pub enum ContextPreparationError {
    #[error("template directory '{path}' is unusable: {detail}")]
    Template { path: String, detail: String },
    #[error("failed to stage build context: {0}")]
    Io(#[from] io::Error),
    #[error("failed to encode schema: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("failed to upload build context: {0}")]
    Upload(#[from] BackendError),
}

/// Copies the survey template, injects the job's schemas, archives the tree
/// and stages it in blob storage for the build provider.
#[derive(Clone)]
pub struct BuildContextPreparer {
    template_dir: PathBuf,
    bucket: String,
    store: Arc<dyn ContextStore>,
}

impl BuildContextPreparer {
    pub fn new(template_dir: PathBuf, bucket: String, store: Arc<dyn ContextStore>) -> Self {
        Self {
            template_dir,
            bucket,
            store,
        }
    }

    pub fn template_dir(&self) -> &Path {
        &self.template_dir
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// The working directory and archive live in a temp dir removed on return,
    /// whichever step fails.
    pub fn prepare(
        &self,
        variables: &BuildVariables,
    ) -> Result<ContextHandle, ContextPreparationError> {
        if !self.template_dir.is_dir() {
            return Err(ContextPreparationError::Template {
                path: self.template_dir.display().to_string(),
                detail: "not a directory".to_string(),
            });
        }
        let work = tempfile::Builder::new().prefix("forge_ctx_").tempdir()?;
        let build_dir = work.path().join(BUILD_CONTEXT_DIR);
        copy_template(&self.template_dir, &build_dir)?;
        fs::write(
            build_dir.join(SCHEMA_FILE_NAME),
            serde_json::to_vec_pretty(&variables.form_schema)?,
        )?;
        fs::write(
            build_dir.join(UI_SCHEMA_FILE_NAME),
            serde_json::to_vec_pretty(&variables.ui_schema)?,
        )?;

        let object = archive_object_name(variables);
        let archive_path = work.path().join(&object);
        write_context_archive(&build_dir, &archive_path)?;
        let (sha256_hex, size_bytes) = digest_file(&archive_path)?;
        debug!(object = %object, size_bytes, "build context archived");

        self.store.upload(&self.bucket, &object, &archive_path)?;
        info!(
            bucket = %self.bucket,
            object = %object,
            sha256 = %sha256_hex,
            "build context staged"
        );
        Ok(ContextHandle {
            bucket: self.bucket.clone(),
            object,
            sha256_hex,
            size_bytes,
        })
    }
}

/// `context_<job>_<owner>.tar.gz`
pub fn archive_object_name(variables: &BuildVariables) -> String {
    format!(
        "context_{}_{}.tar.gz",
        variables.job_id.as_str(),
        variables.owner_id.as_str()
    )
}

fn copy_template(src: &Path, dst: &Path) -> Result<(), ContextPreparationError> {
    fs::create_dir_all(dst)?;
    for entry in walkdir::WalkDir::new(src).sort_by_file_name() {
        let entry = entry.map_err(io::Error::from)?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|err| ContextPreparationError::Template {
                path: src.display().to_string(),
                detail: err.to_string(),
            })?;
        if rel.as_os_str().is_empty() {
            continue;
        }
        let target = dst.join(rel);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
        } else if file_type.is_file() {
            fs::copy(entry.path(), &target)?;
        } else {
            debug!(path = %entry.path().display(), "skipping non-regular template entry");
        }
    }
    Ok(())
}

/// Gzipped tar of `build_dir` under `custom_build_context/`. Entries are sorted
/// and carry zeroed mtime/uid/gid, so equal trees give equal bytes.
pub fn write_context_archive(build_dir: &Path, archive_path: &Path) -> io::Result<()> {
    let file = File::create(archive_path)?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);
    let root = Path::new(BUILD_CONTEXT_DIR);
    for entry in walkdir::WalkDir::new(build_dir).sort_by_file_name() {
        let entry = entry.map_err(io::Error::from)?;
        let path = entry.path();
        let rel = path
            .strip_prefix(build_dir)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;
        let name = root.join(rel);
        let metadata = fs::symlink_metadata(path)?;
        let mut header = Header::new_gnu();
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);
        if metadata.is_dir() {
            header.set_entry_type(tar::EntryType::Directory);
            header.set_mode(0o755);
            header.set_size(0);
            builder.append_data(&mut header, &name, io::empty())?;
        } else if metadata.is_file() {
            header.set_entry_type(tar::EntryType::Regular);
            header.set_mode(0o644);
            header.set_size(metadata.len());
            builder.append_data(&mut header, &name, BufReader::new(File::open(path)?))?;
        }
    }
    let mut encoder = builder.into_inner()?;
    encoder.flush()?;
    encoder.finish()?.sync_all()?;
    Ok(())
}

fn digest_file(path: &Path) -> io::Result<(String, u64)> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    let total = io::copy(&mut reader, &mut hasher)?;
    Ok((hex::encode(hasher.finalize()), total))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{BackendCall, InMemoryBackend};
    use std::io::Read;
    use flate2::read::GzDecoder;
    use forge_kernel_contracts::build::BuildJob;
    use forge_kernel_contracts::namespace::{JobId, OwnerId};
    use serde_json::json;

    fn variables() -> BuildVariables {
        BuildJob::v1(
            OwnerId::new("owner-1").unwrap(),
            JobId::new("q5").unwrap(),
            "Survey".to_string(),
            json!({"type": "object", "title": "Survey"}),
            json!({"ui:order": ["*"]}),
        )
        .unwrap()
        .variables()
    }

    fn template() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("Dockerfile"), "FROM python:3.12-slim\n").unwrap();
        fs::create_dir_all(dir.path().join("static")).unwrap();
        fs::write(dir.path().join("static").join("form-entry.js"), "// entry\n").unwrap();
        fs::write(dir.path().join("app.py"), "print('ok')\n").unwrap();
        dir
    }

    fn archive_entries(bytes: &[u8]) -> Vec<(String, String)> {
        let mut archive = tar::Archive::new(GzDecoder::new(bytes));
        let mut out = Vec::new();
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            let name = entry.path().unwrap().display().to_string();
            let mut body = String::new();
            entry.read_to_string(&mut body).unwrap();
            out.push((name, body));
        }
        out
    }

    #[test]
    fn at_context_01_archive_carries_template_and_schemas() {
        let tpl = template();
        let backend = Arc::new(InMemoryBackend::default());
        let preparer =
            BuildContextPreparer::new(tpl.path().to_path_buf(), "ctx-bucket".to_string(), backend.clone());
        let handle = preparer.prepare(&variables()).unwrap();
        assert_eq!(handle.bucket, "ctx-bucket");
        assert_eq!(handle.object, "context_q5_owner-1.tar.gz");

        let blob = backend.blob("ctx-bucket", "context_q5_owner-1.tar.gz").unwrap();
        assert_eq!(blob.len() as u64, handle.size_bytes);
        assert_eq!(hex::encode(Sha256::digest(&blob)), handle.sha256_hex);

        let entries = archive_entries(&blob);
        let names: Vec<&str> = entries.iter().map(|(n, _)| n.as_str()).collect();
        assert!(names.contains(&"custom_build_context/Dockerfile"));
        assert!(names.contains(&"custom_build_context/static/form-entry.js"));
        let schema = entries
            .iter()
            .find(|(n, _)| n == "custom_build_context/schema.json")
            .map(|(_, body)| body.clone())
            .unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&schema).unwrap();
        assert_eq!(parsed["title"], "Survey");
        assert!(names.contains(&"custom_build_context/ui_schema.json"));
    }

    #[test]
    fn at_context_02_same_inputs_give_same_digest() {
        let tpl = template();
        let backend = Arc::new(InMemoryBackend::default());
        let preparer =
            BuildContextPreparer::new(tpl.path().to_path_buf(), "b".to_string(), backend);
        let first = preparer.prepare(&variables()).unwrap();
        let second = preparer.prepare(&variables()).unwrap();
        assert_eq!(first.sha256_hex, second.sha256_hex);
    }

    #[test]
    fn at_context_03_upload_failure_is_reported() {
        let tpl = template();
        let backend = Arc::new(InMemoryBackend::default());
        backend.fail_uploads(BackendError::PermissionDenied("bucket".to_string()));
        let preparer =
            BuildContextPreparer::new(tpl.path().to_path_buf(), "b".to_string(), backend.clone());
        let err = preparer.prepare(&variables()).unwrap_err();
        assert!(matches!(
            err,
            ContextPreparationError::Upload(BackendError::PermissionDenied(_))
        ));
        assert_eq!(
            backend.calls(),
            vec![BackendCall::Upload {
                bucket: "b".to_string(),
                object: "context_q5_owner-1.tar.gz".to_string()
            }]
        );
    }

    #[test]
    fn at_context_04_missing_template_is_rejected_before_any_upload() {
        let backend = Arc::new(InMemoryBackend::default());
        let preparer = BuildContextPreparer::new(
            PathBuf::from("/nonexistent/forge/template"),
            "b".to_string(),
            backend.clone(),
        );
        assert!(matches!(
            preparer.prepare(&variables()),
            Err(ContextPreparationError::Template { .. })
        ));
        assert!(backend.calls().is_empty());
    }
}
