//! Failure taxonomy for a transfer job
//!
//! Internals return `anyhow::Result`; everything that reaches the job
//! boundary is classified into one of these kinds so the user can tell a
//! usage mistake from a transfer that ran out of rounds.

/// Errors that terminate a job.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("usage: {0}")]
    Usage(String),

    #[error("required tool `{tool}` not found on {side} side")]
    DependencyMissing { tool: String, side: String },

    #[error("endpoint error: {0}")]
    Endpoint(String),

    #[error("source needs at least {blocks} blocks but block names only index {capacity}; raise the block size")]
    TooManyBlocks { blocks: u64, capacity: u64 },

    #[error("authentication to {target} failed: {detail}")]
    AuthFailed { target: String, detail: String },

    #[error("cannot reach {target}: {detail}")]
    Unreachable { target: String, detail: String },

    #[error("remote command `{command}` exited with {status}: {stderr}")]
    RemoteCommand {
        command: String,
        status: i32,
        stderr: String,
    },

    #[error("transfer incomplete: {missing} block(s) still missing after {rounds} round(s)")]
    TransferIncomplete { missing: usize, rounds: u32 },

    #[error("reassembly failed: {0}")]
    Reassembly(String),

    #[error("interrupted")]
    Interrupted,

    #[error(transparent)]
    Other(anyhow::Error),
}

impl From<anyhow::Error> for TransferError {
    /// Recovers a classified error that travelled through an `anyhow` chain.
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<TransferError>() {
            Ok(classified) => classified,
            Err(other) => match block_overflow_in(&other) {
                Some(overflow) => overflow,
                None => TransferError::Other(other),
            },
        }
    }
}

/// The block writer reports index overflow through `io::Error`, which the
/// archive and compressor layers pass along untouched.
fn block_overflow_in(err: &anyhow::Error) -> Option<TransferError> {
    err.chain().find_map(|cause| {
        let io = cause.downcast_ref::<std::io::Error>()?;
        match io.get_ref()?.downcast_ref::<TransferError>()? {
            TransferError::TooManyBlocks { blocks, capacity } => {
                Some(TransferError::TooManyBlocks {
                    blocks: *blocks,
                    capacity: *capacity,
                })
            }
            _ => None,
        }
    })
}

impl From<std::io::Error> for TransferError {
    fn from(err: std::io::Error) -> Self {
        TransferError::Other(err.into())
    }
}

impl TransferError {
    /// Short classification printed in front of every fatal message.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Usage(_) => "usage",
            Self::DependencyMissing { .. } => "dependency-missing",
            Self::Endpoint(_) | Self::TooManyBlocks { .. } => "endpoint",
            Self::AuthFailed { .. } => "auth-failed",
            Self::Unreachable { .. } => "unreachable",
            Self::RemoteCommand { .. } => "remote-command",
            Self::TransferIncomplete { .. } => "transfer-incomplete",
            Self::Reassembly(_) => "reassembly",
            Self::Interrupted => "interrupted",
            Self::Other(_) => "internal",
        }
    }

    /// Process exit code for this failure class.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Usage(_) => 2,
            Self::DependencyMissing { .. } => 3,
            Self::Endpoint(_) | Self::TooManyBlocks { .. } => 4,
            Self::AuthFailed { .. } | Self::Unreachable { .. } => 5,
            Self::TransferIncomplete { .. } => 6,
            Self::Reassembly(_) => 7,
            Self::Interrupted => 130,
            Self::RemoteCommand { .. } | Self::Other(_) => 1,
        }
    }

    /// Whether staging left behind by this failure is worth keeping for `--resume`.
    pub fn is_resumable(&self) -> bool {
        matches!(self, Self::TransferIncomplete { .. } | Self::Interrupted)
    }
}

pub type Result<T> = std::result::Result<T, TransferError>;
