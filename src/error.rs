//! Error kinds of the worker core that are not plain errno results.

use nix::errno::Errno;

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// Broken internal invariant; the current task fails, nothing recovers
    /// automatically.
    #[error("internal bug: {0}")]
    Bug(String),

    /// A filesystem failure outside the expected ENOMEM/ENOENT paths while
    /// preparing table locks.
    #[error("fatal error locking tables for {task}: {errno}")]
    TableLock { task: String, errno: Errno },
}
