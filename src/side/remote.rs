use super::{Side, Verifier};
use crate::digest::DigestKind;
use crate::error::TransferError;
use crate::manifest::{Manifest, BLOCK_CAPACITY, INDEX_WIDTH, MANIFEST_FILE};
use crate::reassembler::remote_reassemble_script;
use crate::session::{shell_quote, CommandOutput, CopyDirection, SessionChannel};
use crate::codec::REMOTE_CANDIDATES;
use anyhow::{anyhow, Context, Result};
use std::collections::BTreeSet;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Tools every remote pipeline relies on, besides the digest tool and compressor.
const REMOTE_TOOLS: [&str; 7] = ["bash", "tar", "split", "cat", "awk", "xargs", "find"];

/// Side on the far end of the session channel, staged in a fixed temp directory.
pub struct RemoteSide<'a> {
    channel: &'a dyn SessionChannel,
    stage: PathBuf,
    digest: DigestKind,
    compressor: String,
    level: u32,
}

impl<'a> RemoteSide<'a> {
    /// Check the remote toolset and pick its compressor.
    pub fn connect(
        channel: &'a dyn SessionChannel,
        stage: PathBuf,
        digest: DigestKind,
        level: u32,
    ) -> Result<Self, TransferError> {
        let mut tools: Vec<&str> = REMOTE_TOOLS.to_vec();
        tools.push(digest.remote_tool());
        let script = format!(
            "for t in {tools}; do command -v \"$t\" >/dev/null 2>&1 || echo \"missing=$t\"; done; \
             for c in {codecs}; do if command -v \"$c\" >/dev/null 2>&1; then echo \"codec=$c\"; break; fi; done",
            tools = tools.join(" "),
            codecs = REMOTE_CANDIDATES.join(" "),
        );
        let out = channel.run(&sh(&script))?;
        let (missing, compressor) = parse_probe(&out.stdout);
        if let Some(tool) = missing.into_iter().next() {
            return Err(TransferError::DependencyMissing {
                tool,
                side: channel.target().to_string(),
            });
        }
        let compressor = compressor.ok_or_else(|| TransferError::DependencyMissing {
            tool: REMOTE_CANDIDATES.join(" or "),
            side: channel.target().to_string(),
        })?;
        Ok(Self {
            channel,
            stage,
            digest,
            compressor,
            level: level.clamp(1, 9),
        })
    }

    pub fn compressor(&self) -> &str {
        &self.compressor
    }

    fn quoted_stage(&self) -> String {
        shell_quote(&self.stage.display().to_string())
    }

    fn sh(&self, script: &str) -> Result<CommandOutput> {
        self.channel.run(&sh(script))
    }

    fn bash_checked(&self, script: &str) -> Result<String> {
        self.channel
            .run_checked(&format!("bash -o pipefail -c {}", shell_quote(script)))
    }
}

fn sh(script: &str) -> String {
    format!("sh -c {}", shell_quote(script))
}

/// Split probe output into missing tools and the first available compressor.
fn parse_probe(stdout: &str) -> (Vec<String>, Option<String>) {
    let mut missing = Vec::new();
    let mut codec = None;
    for line in stdout.lines().map(str::trim) {
        if let Some(tool) = line.strip_prefix("missing=") {
            missing.push(tool.to_string());
        } else if let Some(c) = line.strip_prefix("codec=") {
            codec.get_or_insert_with(|| c.to_string());
        }
    }
    (missing, codec)
}

/// Resolved source and staging paths, one per line.
fn parse_resolved(stdout: &str) -> Option<(PathBuf, PathBuf)> {
    let mut lines = stdout.lines().map(str::trim).filter(|l| !l.is_empty());
    let source = PathBuf::from(lines.next()?);
    let stage = PathBuf::from(lines.next()?);
    Some((source, stage))
}

/// Staging inside the source would be archived while `split` writes it;
/// a source inside staging would be wiped by `prepare`.
fn staging_overlap(source: &Path, stage: &Path) -> Option<String> {
    if stage.starts_with(source) {
        Some(format!(
            "remote staging {} lies inside the source; choose another --remote-tmp",
            stage.display()
        ))
    } else if source.starts_with(stage) {
        Some(format!(
            "source lies inside remote staging {}; choose another --remote-tmp",
            stage.display()
        ))
    } else {
        None
    }
}

/// Names a `<tool> -c` run reported as intact.
fn parse_check_output(stdout: &str) -> BTreeSet<String> {
    stdout
        .lines()
        .filter_map(|l| l.trim_end().strip_suffix(": OK"))
        .map(str::to_string)
        .collect()
}

impl Verifier for RemoteSide<'_> {
    fn pending(&self, manifest: &Manifest) -> Result<BTreeSet<String>> {
        if manifest.is_empty() {
            return Ok(BTreeSet::new());
        }
        let out = self.sh(&format!(
            "cd {} && {} -c {} 2>/dev/null",
            self.quoted_stage(),
            self.digest.remote_tool(),
            MANIFEST_FILE
        ))?;
        if !out.success() && out.stdout.trim().is_empty() {
            // the check never ran (no stage, no manifest); that is not a verdict
            return Err(TransferError::RemoteCommand {
                command: format!("{} -c {}", self.digest.remote_tool(), MANIFEST_FILE),
                status: out.status,
                stderr: out.stderr.trim().to_string(),
            }
            .into());
        }
        let intact = parse_check_output(&out.stdout);
        Ok(manifest
            .names()
            .filter(|n| !intact.contains(*n))
            .map(str::to_string)
            .collect())
    }
}

impl Side for RemoteSide<'_> {
    fn label(&self) -> String {
        self.channel.target().to_string()
    }

    fn stage(&self) -> &Path {
        &self.stage
    }

    fn check_source(&self, source: &Path) -> Result<PathBuf, TransferError> {
        let p = shell_quote(&source.display().to_string());
        let stage = self.quoted_stage();
        let script = format!(
            "p={p}; if [ ! -e \"$p\" ] || [ ! -r \"$p\" ]; then exit 3; fi; \
             u=$(find \"$p\" ! -readable -print 2>/dev/null | head -n 1); \
             if [ -n \"$u\" ]; then echo \"$u\"; exit 4; fi; \
             readlink -f -- \"$p\" && readlink -m -- {stage}"
        );
        let out = self.sh(&script)?;
        let where_ = format!("{}:{}", self.channel.target(), source.display());
        match out.status {
            0 => {}
            3 => {
                return Err(TransferError::Endpoint(format!(
                    "source {where_} does not exist or is not readable"
                )))
            }
            4 => {
                return Err(TransferError::Endpoint(format!(
                    "source {where_} contains unreadable entry {}",
                    out.stdout.trim()
                )))
            }
            status => {
                return Err(TransferError::RemoteCommand {
                    command: "source check".to_string(),
                    status,
                    stderr: out.stderr.trim().to_string(),
                })
            }
        }
        let (resolved, stage) = parse_resolved(&out.stdout).ok_or_else(|| {
            TransferError::Endpoint(format!("cannot resolve source {where_}"))
        })?;
        if resolved.file_name().is_none() {
            return Err(TransferError::Endpoint(format!(
                "refusing to archive {where_} (resolves to {})",
                resolved.display()
            )));
        }
        if let Some(msg) = staging_overlap(&resolved, &stage) {
            return Err(TransferError::Endpoint(format!("{msg} ({where_})")));
        }
        Ok(resolved)
    }

    fn prepare(&self, fresh: bool) -> Result<()> {
        let stage = self.quoted_stage();
        let script = if fresh {
            format!("rm -rf {stage} && mkdir -p {stage}")
        } else {
            format!("mkdir -p {stage}")
        };
        self.channel.run_checked(&sh(&script)).map(drop)
    }

    fn pack_and_split(&self, source: &Path, prefix: &str, block_size: u64) -> Result<Manifest> {
        let parent = source
            .parent()
            .ok_or_else(|| anyhow!("{} has no parent", source.display()))?;
        let name = source
            .file_name()
            .ok_or_else(|| anyhow!("{} has no base name", source.display()))?;
        let stage = self.quoted_stage();
        let prefix_q = shell_quote(prefix);
        let script = format!(
            "tar -C {parent} -cf - {name} | {codec} -c -{level} | split -b {block_size} -d -a {width} - {stage}/{prefix_q} \
             && cd {stage} && {tool} {prefix_q}[0-9]* > {manifest} && cat {manifest}",
            parent = shell_quote(&parent.display().to_string()),
            name = shell_quote(&name.to_string_lossy()),
            codec = self.compressor,
            level = self.level,
            width = INDEX_WIDTH,
            tool = self.digest.remote_tool(),
            manifest = MANIFEST_FILE,
        );
        match self.bash_checked(&script) {
            Ok(text) => Manifest::parse(prefix, self.digest, &text).context("parse remote manifest"),
            Err(e) => {
                // GNU split refuses to wrap its suffixes; report that as a capacity error
                if format!("{e:#}").contains("suffixes exhausted") {
                    return Err(TransferError::TooManyBlocks {
                        blocks: BLOCK_CAPACITY + 1,
                        capacity: BLOCK_CAPACITY,
                    }
                    .into());
                }
                Err(e)
            }
        }
    }

    fn load_manifest(&self, prefix: &str) -> Result<Option<Manifest>> {
        let out = self.sh(&format!(
            "f={}/{}; if [ -f \"$f\" ]; then cat \"$f\"; else exit 3; fi",
            self.quoted_stage(),
            MANIFEST_FILE
        ))?;
        match out.status {
            0 => Manifest::parse(prefix, self.digest, &out.stdout).map(Some),
            3 => Ok(None),
            status => Err(TransferError::RemoteCommand {
                command: "read manifest".to_string(),
                status,
                stderr: out.stderr.trim().to_string(),
            }
            .into()),
        }
    }

    fn install_manifest(&self, manifest: &Manifest) -> Result<()> {
        let mut tmp = tempfile::NamedTempFile::new().context("create manifest upload file")?;
        tmp.write_all(manifest.render().as_bytes())?;
        tmp.flush()?;
        self.channel
            .copy_block(
                tmp.path(),
                &self.stage.join(MANIFEST_FILE),
                CopyDirection::Upload,
            )
            .context("upload manifest")
    }

    fn reassemble(&self, _manifest: &Manifest, dest: &Path) -> Result<(), TransferError> {
        let script = remote_reassemble_script(&self.stage, dest, &self.compressor);
        self.bash_checked(&script)
            .map(drop)
            .map_err(|e| TransferError::Reassembly(format!("{e:#}")))
    }

    fn cleanup(&self) -> Result<()> {
        self.channel
            .run_checked(&sh(&format!("rm -rf {}", self.quoted_stage())))
            .map(drop)
    }
}
