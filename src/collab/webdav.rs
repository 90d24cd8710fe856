//! Nextcloud-compatible uploader driven through `curl`.
//!
//! Credentials reach curl as a config file on stdin (`-K -`), never on the
//! command line where other local users could read them from `/proc`.

#![allow(missing_docs)]

use std::io::{ErrorKind, Write};
use std::path::Path;
use std::process::{Command, Stdio};

use url::{Url, form_urlencoded};

use crate::core::config::UploadConfig;
use crate::core::errors::{Result, SafegateError};
use crate::pipeline::collaborators::{UploadOutcome, Uploader};

/// Nextcloud share type for public links.
const SHARE_TYPE_PUBLIC_LINK: &str = "3";
/// Read-only share permission bit.
const PERMISSION_READ: &str = "1";

#[derive(Debug)]
struct HttpReply {
    status: u16,
    body: String,
}

impl HttpReply {
    fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

pub struct WebDavUploader {
    base: Url,
    username: String,
    password: String,
    remote_dir: String,
    timeout_secs: u64,
    curl: String,
}

impl WebDavUploader {
    pub fn new(config: &UploadConfig) -> Result<Self> {
        let base = Url::parse(config.base_url.trim_end_matches('/')).map_err(|e| {
            SafegateError::InvalidConfig {
                details: format!("upload.base_url {:?}: {e}", config.base_url),
            }
        })?;
        if base.cannot_be_a_base() {
            return Err(SafegateError::InvalidConfig {
                details: format!("upload.base_url {:?} cannot carry a path", config.base_url),
            });
        }
        Ok(Self {
            base,
            username: config.username.clone(),
            password: config.password.clone(),
            remote_dir: config.remote_dir.trim_matches('/').to_string(),
            timeout_secs: config.timeout_secs,
            curl: "curl".to_string(),
        })
    }

    /// Use a different curl binary.
    #[must_use]
    pub fn with_curl(mut self, curl: impl Into<String>) -> Self {
        self.curl = curl.into();
        self
    }

    /// `{base}/remote.php/dav/files/{user}/{remote path...}`, each segment encoded.
    fn dav_url(&self, remote_path: &str) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments
                .pop_if_empty()
                .extend(["remote.php", "dav", "files", self.username.as_str()])
                .extend(remote_path.split('/').filter(|s| !s.is_empty()));
        }
        url
    }

    fn share_url(&self) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().extend([
                "ocs",
                "v2.php",
                "apps",
                "files_sharing",
                "api",
                "v1",
                "shares",
            ]);
        }
        url.set_query(Some("format=json"));
        url
    }

    /// curl config directive carrying `user:password`.
    fn credentials(&self) -> String {
        let raw = format!("{}:{}", self.username, self.password);
        let escaped = raw.replace('\\', "\\\\").replace('"', "\\\"");
        format!("user = \"{escaped}\"\n")
    }

    fn request(&self, args: &[&str], url: &Url) -> Result<HttpReply> {
        let mut child = Command::new(&self.curl)
            .args(["--silent", "--show-error", "--max-time"])
            .arg(self.timeout_secs.to_string())
            .args(["-K", "-", "--write-out", "\n%{http_code}"])
            .args(args)
            .arg(url.as_str())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                if e.kind() == ErrorKind::NotFound {
                    SafegateError::CommandUnavailable {
                        command: self.curl.clone(),
                        details: e.to_string(),
                    }
                } else {
                    SafegateError::collaborator("upload", format!("cannot run curl: {e}"))
                }
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(self.credentials().as_bytes())
                .map_err(|e| SafegateError::collaborator("upload", format!("curl stdin: {e}")))?;
        }
        let output = child
            .wait_with_output()
            .map_err(|e| SafegateError::collaborator("upload", format!("curl wait: {e}")))?;

        if !output.status.success() {
            return Err(SafegateError::collaborator(
                "upload",
                format!(
                    "curl failed ({}): {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            ));
        }
        parse_reply(&String::from_utf8_lossy(&output.stdout))
    }

    fn ensure_remote_dir(&self) -> Result<()> {
        if self.remote_dir.is_empty() {
            return Ok(());
        }
        let reply = self.request(&["-X", "MKCOL"], &self.dav_url(&self.remote_dir))?;
        // 405: collection already exists.
        if reply.is_success() || reply.status == 405 {
            Ok(())
        } else {
            Err(SafegateError::collaborator(
                "upload",
                format!("creating {} failed: HTTP {}", self.remote_dir, reply.status),
            ))
        }
    }

    fn remote_id_for(&self, path: &Path) -> Option<String> {
        let name = path.file_name()?.to_string_lossy().into_owned();
        Some(if self.remote_dir.is_empty() {
            name
        } else {
            format!("{}/{name}", self.remote_dir)
        })
    }

    fn try_upload(&self, path: &Path) -> Result<String> {
        let remote_id = self.remote_id_for(path).ok_or_else(|| {
            SafegateError::collaborator("upload", format!("{} has no file name", path.display()))
        })?;
        self.ensure_remote_dir()?;

        let local = path.to_string_lossy();
        let reply = self.request(&["-T", local.as_ref()], &self.dav_url(&remote_id))?;
        if reply.is_success() {
            Ok(remote_id)
        } else {
            Err(SafegateError::collaborator(
                "upload",
                format!("HTTP {} - {}", reply.status, reply.body.trim()),
            ))
        }
    }
}

impl Uploader for WebDavUploader {
    fn upload(&self, path: &Path) -> UploadOutcome {
        match self.try_upload(path) {
            Ok(remote_id) => {
                eprintln!("[SG-WORKER] uploaded {} as {remote_id}", path.display());
                UploadOutcome::Uploaded { remote_id }
            }
            Err(e) => UploadOutcome::Failed {
                reason: e.to_string(),
            },
        }
    }

    fn create_public_link(&self, remote_id: &str) -> Option<String> {
        let form = form_urlencoded::Serializer::new(String::new())
            .append_pair("path", &format!("/{remote_id}"))
            .append_pair("shareType", SHARE_TYPE_PUBLIC_LINK)
            .append_pair("permissions", PERMISSION_READ)
            .finish();
        let args = [
            "-X",
            "POST",
            "-H",
            "OCS-APIRequest: true",
            "-H",
            "Accept: application/json",
            "--data",
            form.as_str(),
        ];
        match self.request(&args, &self.share_url()) {
            Ok(reply) if reply.is_success() => {
                let link = parse_share_url(&reply.body);
                if link.is_none() {
                    eprintln!("[SG-WORKER] share response for {remote_id} carried no url");
                }
                link
            }
            Ok(reply) => {
                eprintln!("[SG-WORKER] share creation for {remote_id} failed: HTTP {}", reply.status);
                None
            }
            Err(e) => {
                eprintln!("[SG-WORKER] share creation for {remote_id} failed: {e}");
                None
            }
        }
    }

    fn delete(&self, remote_id: &str) -> bool {
        match self.request(&["-X", "DELETE"], &self.dav_url(remote_id)) {
            // 404: already gone.
            Ok(reply) if reply.is_success() || reply.status == 404 => true,
            Ok(reply) => {
                eprintln!("[SG-CLEANUP] remote delete of {remote_id} failed: HTTP {}", reply.status);
                false
            }
            Err(e) => {
                eprintln!("[SG-CLEANUP] remote delete of {remote_id} failed: {e}");
                false
            }
        }
    }
}

/// Split curl output produced with `--write-out "\n%{http_code}"`.
fn parse_reply(stdout: &str) -> Result<HttpReply> {
    let (body, code) = stdout.rsplit_once('\n').unwrap_or(("", stdout));
    let status = code.trim().parse::<u16>().map_err(|_| {
        SafegateError::collaborator("upload", format!("unexpected curl output {code:?}"))
    })?;
    Ok(HttpReply {
        status,
        body: body.to_string(),
    })
}

/// `ocs.data.url` from an OCS JSON share response.
fn parse_share_url(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    value
        .pointer("/ocs/data/url")
        .and_then(serde_json::Value::as_str)
        .map(ToString::to_string)
}
