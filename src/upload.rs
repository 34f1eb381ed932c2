//! Output-artifact upload client (§4.F step 11, §4.G step 10).
//!
//! `spec.md` §1 lists "the presigned-URL upload client" as out of scope in
//! detail, but §4.F/§4.G call it by name as part of an in-scope
//! dispatcher step, so it is implemented here grounded on
//! `original_source/.../internal/upload/uploader.go`: read the manifest
//! (missing manifest ⇒ nothing to upload), request presigned URLs from the
//! platform client keyed by `(folder_id, object_key)`, then PUT each local
//! file.

use anyhow::{anyhow, Context, Result};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::paths;
use crate::platform::PlatformClient;
use crate::types::{ManifestFile, OutputFileRef, OutputManifest, UploadUrlRequest};

const UPLOAD_TIMEOUT: Duration = Duration::from_secs(300);

/// Read `state/jobs/<job_id>/output/__manifest__.json`. Missing file means
/// there is nothing to upload, not an error.
pub fn read_manifest(state_root: &Path, job_id: &str) -> Result<Option<OutputManifest>> {
    let path = paths::job_manifest_path(state_root, job_id);
    match std::fs::read(&path) {
        Ok(raw) => Ok(Some(serde_json::from_slice(&raw).with_context(|| {
            format!("parse manifest {}", path.display())
        })?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("read manifest {}", path.display())),
    }
}

/// Upload every file named in `manifest`, returning the refs to attach to
/// `JobResult.output_files`.
pub fn upload_files(
    platform: &PlatformClient,
    state_root: &Path,
    job_id: &str,
    manifest: &OutputManifest,
) -> Result<Vec<OutputFileRef>> {
    if manifest.files.is_empty() {
        return Ok(vec![]);
    }

    let requests: Vec<UploadUrlRequest> = manifest
        .files
        .iter()
        .map(|f| UploadUrlRequest {
            folder_id: f.folder_id.clone(),
            object_key: f.object_key.clone(),
            content_type: f.content_type.clone(),
        })
        .collect();

    let url_resp = platform
        .request_upload_urls(job_id, &requests)
        .context("requesting presigned upload URLs")?;

    let mut url_map: HashMap<String, String> = HashMap::new();
    for upload in url_resp.uploads {
        url_map.insert(
            format!("{}:{}", upload.folder_id, upload.object_key),
            upload.presigned_url,
        );
    }

    let output_dir = paths::job_output_dir(state_root, job_id);
    let mut uploaded = Vec::with_capacity(manifest.files.len());
    for file in &manifest.files {
        let key = format!("{}:{}", file.folder_id, file.object_key);
        let url = url_map
            .get(&key)
            .ok_or_else(|| anyhow!("no presigned URL for {}/{}", file.folder_id, file.object_key))?;
        upload_one(&output_dir, file, url)
            .with_context(|| format!("uploading {}", file.local_path))?;
        uploaded.push(OutputFileRef {
            folder_id: file.folder_id.clone(),
            object_key: file.object_key.clone(),
        });
    }
    Ok(uploaded)
}

fn upload_one(output_dir: &Path, file: &ManifestFile, presigned_url: &str) -> Result<()> {
    let local_path = output_dir.join(&file.local_path);
    let bytes = std::fs::read(&local_path)
        .with_context(|| format!("read local file {}", local_path.display()))?;

    let agent = ureq::AgentBuilder::new().timeout(UPLOAD_TIMEOUT).build();
    let resp = agent
        .put(presigned_url)
        .set("Content-Type", &file.content_type)
        .send_bytes(&bytes);

    match resp {
        Ok(r) if r.status() == 200 || r.status() == 204 => Ok(()),
        Ok(r) => Err(anyhow!("upload failed with status {}", r.status())),
        Err(e) => Err(anyhow!("upload request failed: {e}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_manifest_returns_none() {
        let tmp = tempfile::tempdir().unwrap();
        let result = read_manifest(tmp.path(), "j1").unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn manifest_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let manifest = OutputManifest {
            files: vec![ManifestFile {
                local_path: "out.bin".into(),
                folder_id: "folder1".into(),
                object_key: "jobs/j1/out.bin".into(),
                content_type: "application/octet-stream".into(),
            }],
        };
        let path = paths::job_manifest_path(tmp.path(), "j1");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, serde_json::to_string(&manifest).unwrap()).unwrap();

        let back = read_manifest(tmp.path(), "j1").unwrap().unwrap();
        assert_eq!(back.files.len(), 1);
        assert_eq!(back.files[0].object_key, "jobs/j1/out.bin");
    }

    #[test]
    fn empty_manifest_uploads_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let platform = PlatformClient::new("https://api.example.com", "tok");
        let manifest = OutputManifest::default();
        let uploaded = upload_files(&platform, tmp.path(), "j1", &manifest).unwrap();
        assert!(uploaded.is_empty());
    }
}
