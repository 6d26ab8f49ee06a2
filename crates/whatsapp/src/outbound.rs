//! Outbound messages: destination normalization, media kind resolution and
//! dispatch through the open session.

use std::path::Path;

use {
    chatgate_channels::{Envelope, MediaKind},
    chrono::{DateTime, Utc},
    serde::Serialize,
    tracing::{debug, warn},
};

use crate::{
    error::{Error, Result},
    manager::ConnectionManager,
};

/// Address domain for individual chats.
pub const DEFAULT_DOMAIN: &str = "s.whatsapp.net";

/// Append `@domain` unless the destination already names one.
pub fn normalize_destination(destination: &str, domain: &str) -> String {
    if destination.contains('@') {
        destination.to_string()
    } else {
        format!("{destination}@{domain}")
    }
}

/// Resolve the content kind of a media reference from its file extension.
/// Unknown or missing extensions are sent as images.
pub fn media_kind(reference: &str) -> MediaKind {
    // Only the path part of a URL carries the file name.
    let path = reference
        .split(['?', '#'])
        .next()
        .unwrap_or(reference);
    let extension = Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);

    match extension.as_deref() {
        Some("mp4" | "avi" | "mov" | "mkv") => MediaKind::Video,
        Some("mp3" | "wav" | "ogg" | "m4a") => MediaKind::Audio,
        Some("pdf" | "doc" | "docx" | "txt") => MediaKind::Document,
        _ => MediaKind::Image,
    }
}

/// A single send request. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub destination: String,
    pub body: String,
    pub media: Option<String>,
}

impl OutboundMessage {
    pub fn new(destination: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
            body: body.into(),
            media: None,
        }
    }

    /// Attach a media reference (URL or path). Blank references are ignored.
    pub fn with_media(mut self, media: Option<String>) -> Self {
        self.media = media.filter(|m| !m.trim().is_empty());
        self
    }

    /// `{text}` without media, `{kind: url, caption}` with it.
    pub fn envelope(&self) -> Envelope {
        match &self.media {
            Some(url) => Envelope::Media {
                kind: media_kind(url),
                url: url.clone(),
                caption: self.body.clone(),
            },
            None => Envelope::Text {
                text: self.body.clone(),
            },
        }
    }
}

/// Result of a successful dispatch.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchReceipt {
    pub message_id: String,
    pub timestamp: DateTime<Utc>,
}

/// Submits outbound messages through the manager's current session.
#[derive(Debug, Clone)]
pub struct MessageGateway {
    manager: ConnectionManager,
    default_domain: String,
}

impl MessageGateway {
    pub fn new(manager: ConnectionManager, default_domain: impl Into<String>) -> Self {
        Self {
            manager,
            default_domain: default_domain.into(),
        }
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    /// Send `message`. Fails with [`Error::NotConnected`] when the readiness
    /// gate is closed; a session that drops mid-send surfaces as
    /// [`Error::DispatchFailed`].
    pub async fn dispatch(&self, message: &OutboundMessage) -> Result<DispatchReceipt> {
        let Some(handle) = self.manager.ready_handle() else {
            return Err(Error::NotConnected);
        };

        let to = normalize_destination(&message.destination, &self.default_domain);
        let envelope = message.envelope();
        debug!(to = %to, kind = envelope.kind_name(), "dispatching message");

        match handle.send(&to, &envelope).await {
            Ok(receipt) => {
                #[cfg(feature = "metrics")]
                metrics::counter!("chatgate_messages_sent_total", "kind" => envelope.kind_name())
                    .increment(1);

                Ok(DispatchReceipt {
                    message_id: receipt.message_id,
                    timestamp: Utc::now(),
                })
            },
            Err(e) => {
                #[cfg(feature = "metrics")]
                metrics::counter!("chatgate_message_failures_total").increment(1);

                warn!(to = %to, error = %e, "failed to send message");
                Err(Error::DispatchFailed(e.to_string()))
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chatgate_channels::{SessionEvent, SessionHandle, SessionProvider};

    use {
        super::*,
        crate::{
            manager::ManagerOptions, store::MemoryCredentialStore, testing::FakeProvider,
        },
    };

    #[test]
    fn media_kinds_by_extension() {
        assert_eq!(media_kind("https://cdn.example/a.png"), MediaKind::Image);
        assert_eq!(media_kind("photo.JPEG"), MediaKind::Image);
        assert_eq!(media_kind("https://cdn.example/clip.mp4"), MediaKind::Video);
        assert_eq!(media_kind("/srv/files/report.pdf"), MediaKind::Document);
        assert_eq!(media_kind("notes.txt"), MediaKind::Document);
        assert_eq!(media_kind("voice.ogg"), MediaKind::Audio);
        assert_eq!(media_kind("song.m4a"), MediaKind::Audio);
        assert_eq!(media_kind("archive.xyz"), MediaKind::Image);
        assert_eq!(media_kind("https://cdn.example/noext"), MediaKind::Image);
        assert_eq!(media_kind("https://cdn.example/v.mov?sig=abc.pdf"), MediaKind::Video);
    }

    #[test]
    fn destination_normalization() {
        assert_eq!(
            normalize_destination("5551234567", DEFAULT_DOMAIN),
            "5551234567@s.whatsapp.net"
        );
        assert_eq!(
            normalize_destination("5551234567@s.whatsapp.net", DEFAULT_DOMAIN),
            "5551234567@s.whatsapp.net"
        );
        assert_eq!(
            normalize_destination("120363@g.us", DEFAULT_DOMAIN),
            "120363@g.us"
        );
    }

    #[test]
    fn envelope_selection() {
        let text = OutboundMessage::new("1", "hi");
        assert_eq!(text.envelope(), Envelope::Text { text: "hi".into() });

        let blank = OutboundMessage::new("1", "hi").with_media(Some("  ".into()));
        assert_eq!(blank.media, None);

        let doc = OutboundMessage::new("1", "see attached").with_media(Some("a.docx".into()));
        assert_eq!(doc.envelope(), Envelope::Media {
            kind: MediaKind::Document,
            url: "a.docx".into(),
            caption: "see attached".into(),
        });
    }

    async fn connected_gateway() -> (MessageGateway, Arc<FakeProvider>) {
        let provider = Arc::new(FakeProvider::new());
        let manager = ConnectionManager::new(
            Arc::clone(&provider) as Arc<dyn SessionProvider>,
            Arc::new(MemoryCredentialStore::new()),
            ManagerOptions::default(),
        );
        assert!(manager.connect().await);
        provider.emit(SessionEvent::Open);
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        assert!(manager.is_ready());
        (MessageGateway::new(manager, DEFAULT_DOMAIN), provider)
    }

    #[tokio::test]
    async fn dispatch_requires_ready_session() {
        let provider = Arc::new(FakeProvider::new());
        let manager = ConnectionManager::new(
            Arc::clone(&provider) as Arc<dyn SessionProvider>,
            Arc::new(MemoryCredentialStore::new()),
            ManagerOptions::default(),
        );
        let gateway = MessageGateway::new(manager.clone(), DEFAULT_DOMAIN);
        let msg = OutboundMessage::new("5551234567", "hello");

        assert!(matches!(gateway.dispatch(&msg).await, Err(Error::NotConnected)));

        // Connecting is not ready either.
        assert!(manager.connect().await);
        assert!(matches!(gateway.dispatch(&msg).await, Err(Error::NotConnected)));
        assert!(provider.latest_handle().unwrap().sent().is_empty());
    }

    #[tokio::test]
    async fn dispatch_sends_normalized_envelope() {
        let (gateway, provider) = connected_gateway().await;

        let msg = OutboundMessage::new("5551234567", "look")
            .with_media(Some("https://cdn.example/cat.webp".into()));
        let receipt = gateway.dispatch(&msg).await.unwrap();
        assert_eq!(receipt.message_id, "FAKE0001");

        let sent = provider.latest_handle().unwrap().sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "5551234567@s.whatsapp.net");
        assert_eq!(sent[0].1, Envelope::Media {
            kind: MediaKind::Image,
            url: "https://cdn.example/cat.webp".into(),
            caption: "look".into(),
        });
    }

    #[tokio::test]
    async fn provider_failure_becomes_dispatch_failed() {
        let (gateway, provider) = connected_gateway().await;
        provider
            .latest_handle()
            .unwrap()
            .reject_sends("recipient not on network");

        let err = gateway
            .dispatch(&OutboundMessage::new("1", "x"))
            .await
            .unwrap_err();
        match err {
            Error::DispatchFailed(detail) => assert!(detail.contains("recipient not on network")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn session_dying_under_dispatch_is_dispatch_failed() {
        let (gateway, provider) = connected_gateway().await;
        // Handle dead, close event not yet delivered: the gate is still open.
        provider.latest_handle().unwrap().close().await;
        assert!(gateway.manager().is_ready());

        let err = gateway
            .dispatch(&OutboundMessage::new("1", "x"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DispatchFailed(_)));
    }
}
