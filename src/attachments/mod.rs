//! Attachment pipeline.
//!
//! For every attachment reference: probe, validate, download, re-validate and
//! base64-encode. Every reference holds a slot of the download gate for its
//! whole probe and download, so no more than the gate's limit are ever in
//! flight. Rejections and failures omit the attachment; they never fail the
//! request.

pub mod validate;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use futures::future::join_all;

use crate::config::{ImageSettings, RetryPolicy};
use crate::error::AdapterError;
use crate::gate::ConcurrencyGate;
use crate::model::{Attachment, AttachmentRef, Message};
use crate::platforms::PlatformAdapter;
use crate::retry::with_retry;

pub use validate::sniff_mime;

/// Why an attachment was left out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OmitReason {
    /// Attachment handling is switched off for the request.
    Disabled,
    MimeNotAllowed,
    TooLarge,
    NotFound,
    /// Transient failures persisted past the retry budget.
    RetriesExhausted,
    /// The platform refused or returned something unusable.
    Failed,
    Empty,
}

impl fmt::Display for OmitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OmitReason::Disabled => "disabled",
            OmitReason::MimeNotAllowed => "mime_not_allowed",
            OmitReason::TooLarge => "too_large",
            OmitReason::NotFound => "not_found",
            OmitReason::RetriesExhausted => "retries_exhausted",
            OmitReason::Failed => "failed",
            OmitReason::Empty => "empty",
        };
        f.write_str(s)
    }
}

impl From<&AdapterError> for OmitReason {
    fn from(err: &AdapterError) -> Self {
        match err {
            AdapterError::NotFound { .. } => OmitReason::NotFound,
            AdapterError::Transient { .. } => OmitReason::RetriesExhausted,
            AdapterError::AuthExpired { .. } | AdapterError::InvalidResponse { .. } => OmitReason::Failed,
        }
    }
}

/// Result for one attachment reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachmentOutcome {
    Resolved(Attachment),
    Omitted { reference: AttachmentRef, reason: OmitReason },
}

impl AttachmentOutcome {
    pub fn is_resolved(&self) -> bool {
        matches!(self, AttachmentOutcome::Resolved(_))
    }
}

/// Per-run counters, logged when a run finishes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttachmentStats {
    pub resolved: usize,
    pub omitted: BTreeMap<OmitReason, usize>,
    /// Highest number of simultaneous downloads the gate has admitted.
    pub peak_concurrent: usize,
}

impl AttachmentStats {
    fn record(&mut self, outcome: &AttachmentOutcome) {
        match outcome {
            AttachmentOutcome::Resolved(_) => self.resolved += 1,
            AttachmentOutcome::Omitted { reason, .. } => *self.omitted.entry(*reason).or_default() += 1,
        }
    }

    pub fn omitted_total(&self) -> usize {
        self.omitted.values().sum()
    }

    /// Fold another run's counters into these.
    pub fn merge(&mut self, other: &AttachmentStats) {
        self.resolved += other.resolved;
        for (reason, count) in &other.omitted {
            *self.omitted.entry(*reason).or_default() += count;
        }
        self.peak_concurrent = self.peak_concurrent.max(other.peak_concurrent);
    }
}

/// Downloads and validates attachments for one platform adapter.
#[derive(Clone)]
pub struct AttachmentPipeline {
    adapter: Arc<dyn PlatformAdapter>,
    settings: Arc<ImageSettings>,
    gate: ConcurrencyGate,
    retry: RetryPolicy,
}

impl AttachmentPipeline {
    pub fn new(
        adapter: Arc<dyn PlatformAdapter>,
        settings: ImageSettings,
        gate: ConcurrencyGate,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            adapter,
            settings: Arc::new(settings),
            gate,
            retry,
        }
    }

    pub fn settings(&self) -> &ImageSettings {
        &self.settings
    }

    /// Resolve a list of references. Output is index-aligned with the input;
    /// disabled settings yield an empty list without touching the adapter.
    pub async fn resolve(&self, references: &[AttachmentRef]) -> Vec<AttachmentOutcome> {
        if !self.settings.enabled || references.is_empty() {
            return Vec::new();
        }
        join_all(references.iter().map(|r| self.resolve_one(r))).await
    }

    /// Resolve every message's references and attach the successes to their
    /// owning message, in reference order.
    pub async fn attach(&self, messages: &mut [Message]) -> AttachmentStats {
        let mut stats = AttachmentStats::default();
        let owned: Vec<(usize, AttachmentRef)> = messages
            .iter()
            .enumerate()
            .flat_map(|(i, m)| m.attachment_refs.iter().cloned().map(move |r| (i, r)))
            .collect();
        if owned.is_empty() {
            return stats;
        }
        if !self.settings.enabled {
            stats.omitted.insert(OmitReason::Disabled, owned.len());
            tracing::debug!(count = owned.len(), "Attachments disabled, skipping downloads");
            return stats;
        }

        let references: Vec<AttachmentRef> = owned.iter().map(|(_, r)| r.clone()).collect();
        let outcomes = self.resolve(&references).await;
        for ((owner, _), outcome) in owned.into_iter().zip(outcomes) {
            stats.record(&outcome);
            if let AttachmentOutcome::Resolved(attachment) = outcome {
                messages[owner].attachments.push(attachment);
            }
        }
        stats.peak_concurrent = self.gate.peak();

        tracing::info!(
            resolved = stats.resolved,
            omitted = stats.omitted_total(),
            peak_concurrent = stats.peak_concurrent,
            limit = self.gate.limit(),
            "Attachment pipeline finished"
        );
        stats
    }

    async fn resolve_one(&self, reference: &AttachmentRef) -> AttachmentOutcome {
        let _permit = self.gate.acquire().await;
        match self.fetch_validated(reference).await {
            Ok(attachment) => AttachmentOutcome::Resolved(attachment),
            Err(reason) => {
                match reason {
                    OmitReason::MimeNotAllowed | OmitReason::TooLarge | OmitReason::Empty => {
                        tracing::info!(location = %reference.location, %reason, "Attachment rejected");
                    }
                    _ => {
                        tracing::warn!(location = %reference.location, %reason, "Attachment omitted");
                    }
                }
                AttachmentOutcome::Omitted {
                    reference: reference.clone(),
                    reason,
                }
            }
        }
    }

    async fn fetch_validated(&self, reference: &AttachmentRef) -> Result<Attachment, OmitReason> {
        let meta = with_retry(&self.retry, "attachment probe", || self.adapter.probe_attachment(reference))
            .await
            .map_err(|e| OmitReason::from(&e))?;
        validate::check_probe(&meta, &self.settings)?;

        let content = with_retry(&self.retry, "attachment download", || {
            self.adapter.fetch_attachment_bytes(reference)
        })
        .await
        .map_err(|e| OmitReason::from(&e))?;
        let mime_type = validate::check_download(&content, &self.settings)?;

        Ok(Attachment {
            mime_type,
            size_bytes: content.size(),
            data: STANDARD.encode(&content.bytes),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ConversationRef, Platform};
    use crate::platforms::{AttachmentBytes, RawBatch};
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const PNG: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 1, 2, 3];

    /// Serves PNG bytes; locations starting with `missing` 404 and
    /// `flaky-N` fail transiently N times first.
    #[derive(Default)]
    struct StubAdapter {
        active: AtomicUsize,
        max_active: AtomicUsize,
        downloads: AtomicUsize,
        flaky_failures: Mutex<std::collections::HashMap<String, usize>>,
    }

    #[async_trait]
    impl PlatformAdapter for StubAdapter {
        fn platform(&self) -> Platform {
            Platform::Webex
        }

        async fn fetch_raw(
            &self,
            _conversation: &ConversationRef,
            _start: DateTime<Utc>,
            _end: DateTime<Utc>,
        ) -> Result<RawBatch, AdapterError> {
            Ok(RawBatch::ExplicitThread(Vec::new()))
        }

        async fn fetch_attachment_bytes(&self, reference: &AttachmentRef) -> Result<AttachmentBytes, AdapterError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            self.downloads.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(2)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);

            let loc = reference.location.as_str();
            if loc.starts_with("missing") {
                return Err(AdapterError::NotFound {
                    platform: Platform::Webex,
                    resource: loc.to_string(),
                });
            }
            if let Some(n) = loc.strip_prefix("flaky-") {
                let budget: usize = n.parse().unwrap();
                let mut failures = self.flaky_failures.lock().unwrap();
                let seen = failures.entry(loc.to_string()).or_default();
                if *seen < budget {
                    *seen += 1;
                    return Err(AdapterError::Transient {
                        platform: Platform::Webex,
                        reason: "reset".into(),
                    });
                }
            }
            Ok(AttachmentBytes {
                bytes: PNG.to_vec(),
                mime_type: "application/octet-stream".into(),
            })
        }
    }

    fn enabled(max: u64) -> ImageSettings {
        ImageSettings {
            enabled: true,
            max_size_bytes: max,
            allowed_mime_types: vec!["image/png".into()],
        }
    }

    fn pipeline(adapter: Arc<StubAdapter>, settings: ImageSettings, limit: usize) -> AttachmentPipeline {
        AttachmentPipeline::new(
            adapter,
            settings,
            ConcurrencyGate::new("downloads", limit),
            RetryPolicy::immediate(3),
        )
    }

    #[tokio::test]
    async fn disabled_makes_no_calls() {
        let adapter = Arc::new(StubAdapter::default());
        let p = pipeline(adapter.clone(), ImageSettings::default(), 5);
        let out = p.resolve(&[AttachmentRef::new("a"), AttachmentRef::new("b")]).await;
        assert!(out.is_empty());
        assert_eq!(adapter.downloads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn five_hundred_refs_respect_gate_of_twenty() {
        let adapter = Arc::new(StubAdapter::default());
        let gate = ConcurrencyGate::new("downloads", 20);
        let p = AttachmentPipeline::new(adapter.clone(), enabled(0), gate.clone(), RetryPolicy::immediate(3));

        let refs: Vec<_> = (0..500).map(|i| AttachmentRef::new(format!("img-{i}"))).collect();
        let out = p.resolve(&refs).await;

        assert_eq!(out.len(), 500);
        assert!(out.iter().all(AttachmentOutcome::is_resolved));
        assert!(gate.peak() <= 20);
        assert!(adapter.max_active.load(Ordering::SeqCst) <= 20);
        assert_eq!(gate.in_flight(), 0);
    }

    #[tokio::test]
    async fn failures_do_not_cancel_siblings() {
        let adapter = Arc::new(StubAdapter::default());
        let p = pipeline(adapter.clone(), enabled(0), 4);
        let refs = vec![
            AttachmentRef::new("ok-1"),
            AttachmentRef::new("missing-1"),
            AttachmentRef::new("flaky-2"),
            AttachmentRef::new("flaky-9"),
            AttachmentRef::new("ok-2"),
        ];
        let out = p.resolve(&refs).await;

        assert!(out[0].is_resolved());
        assert!(matches!(out[1], AttachmentOutcome::Omitted { reason: OmitReason::NotFound, .. }));
        assert!(out[2].is_resolved());
        assert!(matches!(
            out[3],
            AttachmentOutcome::Omitted {
                reason: OmitReason::RetriesExhausted,
                ..
            }
        ));
        assert!(out[4].is_resolved());
    }

    #[tokio::test]
    async fn declared_size_rejects_before_download() {
        let adapter = Arc::new(StubAdapter::default());
        let p = pipeline(adapter.clone(), enabled(5), 4);
        let mut big = AttachmentRef::new("huge");
        big.declared_size = Some(1_000_000);

        let out = p.resolve(&[big]).await;
        assert!(matches!(out[0], AttachmentOutcome::Omitted { reason: OmitReason::TooLarge, .. }));
        assert_eq!(adapter.downloads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn attach_fills_owning_messages_and_encodes() {
        let adapter = Arc::new(StubAdapter::default());
        let p = pipeline(adapter, enabled(0), 2);
        let mut a = Message::new("a", crate::model::Author::new("u", "U"), Utc::now(), None);
        a.attachment_refs = vec![AttachmentRef::new("x"), AttachmentRef::new("missing-x")];
        let b = Message::new("b", crate::model::Author::new("u", "U"), Utc::now(), Some("t".into()));
        let mut msgs = vec![a, b];

        let stats = p.attach(&mut msgs).await;
        assert_eq!(stats.resolved, 1);
        assert_eq!(stats.omitted.get(&OmitReason::NotFound), Some(&1));
        assert_eq!(msgs[0].attachments.len(), 1);
        assert_eq!(msgs[0].attachments[0].mime_type, "image/png");
        assert_eq!(msgs[0].attachments[0].data, STANDARD.encode(PNG));
        assert_eq!(msgs[0].attachments[0].size_bytes, PNG.len() as u64);
        assert!(msgs[1].attachments.is_empty());
    }

    #[tokio::test]
    async fn attach_counts_disabled() {
        let adapter = Arc::new(StubAdapter::default());
        let p = pipeline(adapter, ImageSettings::default(), 2);
        let mut m = Message::new("a", crate::model::Author::new("u", "U"), Utc::now(), None);
        m.attachment_refs = vec![AttachmentRef::new("x")];
        let mut msgs = vec![m];
        let stats = p.attach(&mut msgs).await;
        assert_eq!(stats.omitted.get(&OmitReason::Disabled), Some(&1));
        assert!(msgs[0].attachments.is_empty());
    }
}
