//! The image-unpacking primitive
//!
//! Unpacking an OCI layer into a directory is delegated: production nodes
//! run an external program, stub nodes write a synthetic kernel blob.

use crate::error::{KcacheError, KcacheResult};
use crate::extract::image::ImageRef;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

/// Max number of stderr lines kept in an extraction error
const ERROR_TAIL_LINES: usize = 20;

/// Everything the unpacker needs for one digest
#[derive(Debug, Clone)]
pub struct UnpackRequest {
    /// Reference pinned to the digest
    pub image: ImageRef,
    pub target_dir: PathBuf,
    /// Device ids from the node's GPU inventory
    pub device_ids: Vec<u32>,
}

/// Device compatibility reported by the unpacker
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Compatibility {
    #[serde(default)]
    pub compatible: Vec<u32>,
    #[serde(default)]
    pub incompatible: Vec<u32>,
}

#[async_trait]
pub trait Unpacker: Send + Sync {
    /// Unpack the image into `request.target_dir`, which already exists
    async fn unpack(&self, request: &UnpackRequest) -> KcacheResult<Compatibility>;
}

/// Unpacker for stub mode: deterministic content, first device compatible
#[derive(Debug, Clone, Default)]
pub struct StubUnpacker;

impl StubUnpacker {
    fn blob(image: &ImageRef) -> Vec<u8> {
        let seed = Sha256::digest(image.to_string().as_bytes());
        seed.iter().copied().cycle().take(4096).collect()
    }
}

#[async_trait]
impl Unpacker for StubUnpacker {
    async fn unpack(&self, request: &UnpackRequest) -> KcacheResult<Compatibility> {
        let kernels = request.target_dir.join("kernels");
        tokio::fs::create_dir_all(&kernels)
            .await
            .map_err(|e| KcacheError::io(format!("creating {}", kernels.display()), e))?;

        let blob = Self::blob(&request.image);
        let file = kernels.join(format!("{}.bin", hex::encode(&blob[..6])));
        tokio::fs::write(&file, &blob)
            .await
            .map_err(|e| KcacheError::io(format!("writing {}", file.display()), e))?;

        let (compatible, incompatible) = match request.device_ids.split_first() {
            Some((first, rest)) => (vec![*first], rest.to_vec()),
            None => (vec![], vec![]),
        };
        Ok(Compatibility {
            compatible,
            incompatible,
        })
    }
}

/// Runs an external program that unpacks the image and prints a JSON verdict
///
/// Invocation: `<program> <args..> --image <ref> --dir <dir> --devices <ids>`.
/// The child is killed if the returned future is dropped.
#[derive(Debug, Clone)]
pub struct CommandUnpacker {
    program: String,
    args: Vec<String>,
}

impl CommandUnpacker {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    fn command_args(&self, request: &UnpackRequest) -> Vec<String> {
        let devices = request
            .device_ids
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let mut args = self.args.clone();
        args.extend([
            "--image".to_string(),
            request.image.to_string(),
            "--dir".to_string(),
            path_arg(&request.target_dir),
            "--devices".to_string(),
            devices,
        ]);
        args
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

/// Last lines of a child's stderr, for error messages
fn stderr_tail(stderr: &str) -> String {
    let lines: Vec<&str> = stderr.lines().collect();
    let start = lines.len().saturating_sub(ERROR_TAIL_LINES);
    lines[start..].join("\n")
}

#[async_trait]
impl Unpacker for CommandUnpacker {
    async fn unpack(&self, request: &UnpackRequest) -> KcacheResult<Compatibility> {
        let args = self.command_args(request);
        debug!("Executing: {} {:?}", self.program, args);

        let output = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| KcacheError::command_failed(&self.program, e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(KcacheError::Extraction {
                image: request.image.to_string(),
                reason: format!(
                    "{} exited with {}: {}",
                    self.program,
                    output.status,
                    stderr_tail(&stderr)
                ),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        serde_json::from_str(stdout.trim()).map_err(|e| KcacheError::Extraction {
            image: request.image.to_string(),
            reason: format!("unreadable verdict from {}: {}", self.program, e),
        })
    }
}
