use std::fmt;
use std::time::Duration;

use async_trait::async_trait;

/// Freshly issued key and chain handed from the issue stage to the upload stage.
#[derive(Clone, PartialEq, Eq)]
pub struct CertificateBundle {
    /// PKCS#8 DER private key.
    pub private_key_der: Vec<u8>,
    /// DER certificates, leaf first.
    pub chain: Vec<Vec<u8>>,
}

impl fmt::Debug for CertificateBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateBundle")
            .field("private_key_der", &"<redacted>")
            .field("chain_len", &self.chain.len())
            .finish()
    }
}

/// Unit of deferred work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Task {
    /// Runs the authorize stage, used by auto-renew.
    Create { hostname: String },
    Issue { token: String },
    Upload {
        token: String,
        bundle: CertificateBundle,
    },
    Map {
        token: String,
        certificate_id: String,
        common_name: String,
    },
}

impl Task {
    /// Deduplication key. At most one task per name is pending or running.
    #[must_use]
    pub fn name(&self) -> String {
        match self {
            Task::Create { hostname } => format!("create-certificate-{hostname}"),
            Task::Issue { token } => format!("issue-certificate-{token}"),
            Task::Upload { token, .. } => format!("upload-certificate-{token}"),
            Task::Map { token, .. } => format!("map-domain-{token}"),
        }
    }
}

/// Request to run `task` after `delay`; emitted by stages, executed by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Enqueue {
    pub task: Task,
    pub delay: Duration,
}

impl Enqueue {
    #[must_use]
    pub fn now(task: Task) -> Self {
        Self {
            task,
            delay: Duration::ZERO,
        }
    }

    #[must_use]
    pub fn after(task: Task, delay: Duration) -> Self {
        Self { task, delay }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskContext {
    /// Number of earlier failed attempts of this task.
    pub retry_count: u32,
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// # Errors
    /// Returns error if the task could not be accepted.
    async fn enqueue(&self, request: Enqueue) -> anyhow::Result<()>;
}

#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Runs one attempt of `task`.
    ///
    /// # Errors
    /// An error asks the scheduler to retry the task.
    async fn handle(&self, task: Task, context: TaskContext) -> anyhow::Result<Option<Enqueue>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_are_per_token() {
        let upload = Task::Upload {
            token: "abc".into(),
            bundle: CertificateBundle {
                private_key_der: vec![1, 2, 3],
                chain: vec![vec![4]],
            },
        };
        assert_eq!(upload.name(), "upload-certificate-abc");
        assert_ne!(
            Task::Issue { token: "a".into() }.name(),
            Task::Issue { token: "b".into() }.name()
        );
    }

    #[test]
    fn test_bundle_debug_hides_key() {
        let bundle = CertificateBundle {
            private_key_der: b"secret".to_vec(),
            chain: vec![vec![1], vec![2]],
        };
        let rendered = format!("{bundle:?}");
        assert!(rendered.contains("<redacted>"));
        assert!(!rendered.contains("115"));
    }
}
