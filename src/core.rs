use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use serde::Serialize;

/// A type-erased, thread-safe container for task outputs.
pub type Dynamic = Arc<dyn Any + Send + Sync>;

/// Process-unique identity of a single task instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TaskId(u64);

impl TaskId {
    pub(crate) fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        TaskId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle of a task.
///
/// ```text
/// Created -> Prepared -> Running -> WaitingOnChildren -> Finished
///                                                     -> Failed
///                                                     -> Canceled
/// ```
///
/// Any non-terminal state may jump straight to `Failed` or `Canceled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TaskState {
    Created,
    Prepared,
    Running,
    WaitingOnChildren,
    Finished,
    Failed,
    Canceled,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Finished | TaskState::Failed | TaskState::Canceled
        )
    }
}

/// Cooperative cancellation flag shared between a task and its owners.
///
/// Tokens form a chain mirroring the task tree: a child's token reports
/// cancellation as soon as any ancestor is canceled, without the engine
/// having to walk the tree first. Once set, a flag is never cleared.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<TokenInner>);

#[derive(Default)]
struct TokenInner {
    flag: AtomicBool,
    parent: Option<CancelToken>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a token which is canceled whenever `self` is.
    pub fn child(&self) -> Self {
        CancelToken(Arc::new(TokenInner {
            flag: AtomicBool::new(false),
            parent: Some(self.clone()),
        }))
    }

    pub fn cancel(&self) {
        self.0.flag.store(true, Ordering::Release);
    }

    pub fn is_canceled(&self) -> bool {
        let mut current = Some(self);

        while let Some(token) = current {
            if token.0.flag.load(Ordering::Acquire) {
                return true;
            }
            current = token.0.parent.as_ref();
        }

        false
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("canceled", &self.is_canceled())
            .finish()
    }
}

/// A 32-byte BLAKE3 hash used to fingerprint the input of an operation.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub(crate) struct Hash32([u8; 32]);

impl<T> From<T> for Hash32
where
    T: Into<[u8; 32]>,
{
    fn from(value: T) -> Self {
        Hash32(value.into())
    }
}

impl Hash32 {
    pub(crate) fn hash(buffer: impl AsRef<[u8]>) -> Self {
        blake3::Hasher::new()
            .update(buffer.as_ref())
            .finalize()
            .into()
    }

    pub(crate) fn to_hex(self) -> String {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut acc = String::with_capacity(64);

        for byte in self.0 {
            acc.push(HEX[(byte >> 4) as usize] as char);
            acc.push(HEX[(byte & 0xF) as usize] as char);
        }

        acc
    }
}

impl std::fmt::Debug for Hash32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Hash32({})", self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique() {
        let a = TaskId::next();
        let b = TaskId::next();
        assert_ne!(a, b);
        assert!(b > a);
    }

    #[test]
    fn test_cancel_reaches_descendants() {
        let root = CancelToken::new();
        let child = root.child();
        let grandchild = child.child();

        assert!(!grandchild.is_canceled());
        root.cancel();
        assert!(child.is_canceled());
        assert!(grandchild.is_canceled());
    }

    #[test]
    fn test_cancel_does_not_reach_ancestors() {
        let root = CancelToken::new();
        let child = root.child();
        let sibling = root.child();

        child.cancel();
        assert!(child.is_canceled());
        assert!(!root.is_canceled());
        assert!(!sibling.is_canceled());
    }

    #[test]
    fn test_terminal_states() {
        assert!(TaskState::Finished.is_terminal());
        assert!(TaskState::Failed.is_terminal());
        assert!(TaskState::Canceled.is_terminal());
        assert!(!TaskState::WaitingOnChildren.is_terminal());
        assert!(!TaskState::Created.is_terminal());
    }

    #[test]
    fn test_hash_hex() {
        let a = Hash32::hash("ACGT");
        let b = Hash32::hash("ACGT");
        let c = Hash32::hash("ACGA");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.to_hex().len(), 64);
    }
}
