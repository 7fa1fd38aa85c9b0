//! Audit broadcast.
//!
//! Every handled request produces an audit entry fanned out to all
//! registered sinks. Sensitive fields are HMAC'd before they reach a sink,
//! so logs correlate without exposing token or secret values.
//!
//! Failure semantics: a request fails if **all** sinks fail, and also if
//! any *blocking* sink fails; it succeeds when at least one non-blocking
//! sink wrote. With no sinks registered, auditing is a no-op.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tokio::sync::RwLock;
use tracing::warn;

use crate::error::AuditError;

type HmacSha256 = Hmac<Sha256>;

/// One audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    /// Logical operation name.
    pub operation: String,
    pub path: String,
    /// HMAC of the requesting token.
    pub token_hmac: String,
    pub policies: Vec<String>,
    /// Outcome: "success" or an error description.
    pub outcome: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

/// An audit destination.
#[async_trait::async_trait]
pub trait AuditSink: Send + Sync {
    /// Sink name for error reporting.
    fn name(&self) -> &str;

    /// Whether a failure of this sink must fail the request.
    fn blocking(&self) -> bool {
        false
    }

    /// Record one entry. Must not silently drop entries.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::SinkFailure`] when the entry was not recorded.
    async fn log(&self, entry: &AuditEntry) -> Result<(), AuditError>;
}

/// Fans entries out to every sink.
pub struct AuditBroker {
    sinks: RwLock<Vec<Arc<dyn AuditSink>>>,
    hmac_key: Vec<u8>,
}

impl std::fmt::Debug for AuditBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditBroker")
            .field("hmac_key", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

impl AuditBroker {
    #[must_use]
    pub fn new(hmac_key: Vec<u8>) -> Self {
        Self {
            sinks: RwLock::new(Vec::new()),
            hmac_key,
        }
    }

    /// Register a sink.
    pub async fn add_sink(&self, sink: Arc<dyn AuditSink>) {
        self.sinks.write().await.push(sink);
    }

    /// Whether any sinks are registered.
    pub async fn has_sinks(&self) -> bool {
        !self.sinks.read().await.is_empty()
    }

    /// Broadcast one entry.
    ///
    /// # Errors
    ///
    /// - [`AuditError::SinkFailure`] when a blocking sink fails.
    /// - [`AuditError::AllSinksFailed`] when nothing recorded the entry.
    pub async fn log(&self, entry: &AuditEntry) -> Result<(), AuditError> {
        let sinks = self.sinks.read().await;
        if sinks.is_empty() {
            return Ok(());
        }

        let mut any_success = false;
        for sink in sinks.iter() {
            match sink.log(entry).await {
                Ok(()) => any_success = true,
                Err(e) => {
                    warn!(sink = sink.name(), error = %e, "audit sink failed");
                    if sink.blocking() {
                        return Err(AuditError::SinkFailure {
                            name: sink.name().to_owned(),
                            reason: e.to_string(),
                        });
                    }
                }
            }
        }

        if any_success {
            Ok(())
        } else {
            Err(AuditError::AllSinksFailed)
        }
    }

    /// HMAC a sensitive value for inclusion in an entry.
    #[must_use]
    pub fn hmac_field(&self, value: &str) -> String {
        // HMAC-SHA256 accepts any key length, so construction cannot fail.
        let mut mac = HmacSha256::new_from_slice(&self.hmac_key)
            .unwrap_or_else(|_| unreachable!("hmac accepts any key length"));
        mac.update(value.as_bytes());
        format!("hmac-sha256:{}", hex::encode(mac.finalize().into_bytes()))
    }
}

/// In-memory sink for tests and bootstrap.
#[derive(Debug, Default)]
pub struct MemorySink {
    entries: parking_lot::Mutex<Vec<AuditEntry>>,
}

impl MemorySink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of recorded entries.
    #[must_use]
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().clone()
    }
}

#[async_trait::async_trait]
impl AuditSink for MemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    async fn log(&self, entry: &AuditEntry) -> Result<(), AuditError> {
        self.entries.lock().push(entry.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingSink {
        blocking: bool,
    }

    #[async_trait::async_trait]
    impl AuditSink for FailingSink {
        fn name(&self) -> &str {
            "failing"
        }

        fn blocking(&self) -> bool {
            self.blocking
        }

        async fn log(&self, _entry: &AuditEntry) -> Result<(), AuditError> {
            Err(AuditError::SinkFailure {
                name: "failing".to_owned(),
                reason: "disk full".to_owned(),
            })
        }
    }

    fn entry() -> AuditEntry {
        AuditEntry {
            id: "req-1".to_owned(),
            timestamp: Utc::now(),
            operation: "read".to_owned(),
            path: "secret/data/x".to_owned(),
            token_hmac: "hmac-sha256:abc".to_owned(),
            policies: vec!["default".to_owned()],
            outcome: "success".to_owned(),
            warnings: Vec::new(),
        }
    }

    #[tokio::test]
    async fn no_sinks_is_a_noop() {
        let broker = AuditBroker::new(vec![0u8; 32]);
        broker.log(&entry()).await.unwrap();
    }

    #[tokio::test]
    async fn one_good_sink_suffices() {
        let broker = AuditBroker::new(vec![0u8; 32]);
        let sink = Arc::new(MemorySink::new());
        broker.add_sink(Arc::clone(&sink) as Arc<dyn AuditSink>).await;
        broker
            .add_sink(Arc::new(FailingSink { blocking: false }))
            .await;

        broker.log(&entry()).await.unwrap();
        assert_eq!(sink.entries().len(), 1);
    }

    #[tokio::test]
    async fn all_sinks_failing_fails_the_request() {
        let broker = AuditBroker::new(vec![0u8; 32]);
        broker
            .add_sink(Arc::new(FailingSink { blocking: false }))
            .await;
        let err = broker.log(&entry()).await.unwrap_err();
        assert!(matches!(err, AuditError::AllSinksFailed));
    }

    #[tokio::test]
    async fn blocking_sink_failure_fails_despite_success_elsewhere() {
        let broker = AuditBroker::new(vec![0u8; 32]);
        broker
            .add_sink(Arc::new(MemorySink::new()) as Arc<dyn AuditSink>)
            .await;
        broker
            .add_sink(Arc::new(FailingSink { blocking: true }))
            .await;
        let err = broker.log(&entry()).await.unwrap_err();
        assert!(matches!(err, AuditError::SinkFailure { .. }));
    }

    #[test]
    fn hmac_is_stable_and_keyed() {
        let a = AuditBroker::new(vec![1u8; 32]);
        let b = AuditBroker::new(vec![2u8; 32]);
        assert_eq!(a.hmac_field("s.token"), a.hmac_field("s.token"));
        assert_ne!(a.hmac_field("s.token"), b.hmac_field("s.token"));
        assert!(a.hmac_field("s.token").starts_with("hmac-sha256:"));
    }
}
