//! Domain events published by the command side.
//!
//! The vocabulary is closed: [`EventType`] lists every event the system knows
//! about and [`EventPayload`] pairs each type with the shape of its payload, so
//! a [`DomainEvent`] built in-process can never carry a payload that disagrees
//! with its type.
//!
//! # Wire Format
//!
//! Events travel as JSON:
//!
//! ```json
//! {
//!   "id": "3f0c…",
//!   "type": "ALBUM_LIKED",
//!   "timestamp": "2024-03-01T12:00:00Z",
//!   "payload": { "albumId": "A1", "liked": true },
//!   "metadata": { "albumId": "A1", "liked": "true" }
//! }
//! ```
//!
//! Consumers first parse the body into an [`EventEnvelope`], which keeps `type`
//! as a plain string and `payload` as raw JSON. An unknown type is therefore
//! still a well-formed envelope and can be routed as "no handler registered"
//! instead of being rejected as a malformed body. The typed event is
//! recovered with [`EventEnvelope::decode`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Error types for event encoding and decoding.
#[derive(Error, Debug)]
pub enum EventError {
    /// Failed to serialize event to bytes.
    #[error("Failed to serialize event: {0}")]
    SerializationError(String),

    /// Failed to deserialize an event envelope from bytes.
    #[error("Failed to deserialize event: {0}")]
    DeserializationError(String),

    /// The event type is not part of the vocabulary.
    #[error("Unknown event type: {0}")]
    UnknownEventType(String),

    /// The payload does not have the shape required by the event type.
    #[error("Payload does not match event type {event_type}: {reason}")]
    PayloadMismatch {
        /// Declared event type.
        event_type: EventType,
        /// Why the payload was rejected.
        reason: String,
    },
}

/// The closed set of domain event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    /// A new album was saved on the command side.
    AlbumCreated,
    /// A user liked an album.
    AlbumLiked,
    /// A user disliked an album.
    AlbumDisliked,
    /// An album cover image was stored.
    ImageUploaded,
}

impl EventType {
    /// Every event type, in declaration order.
    pub const ALL: [Self; 4] = [
        Self::AlbumCreated,
        Self::AlbumLiked,
        Self::AlbumDisliked,
        Self::ImageUploaded,
    ];

    /// Wire name used in the `type` field and the routing attribute.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AlbumCreated => "ALBUM_CREATED",
            Self::AlbumLiked => "ALBUM_LIKED",
            Self::AlbumDisliked => "ALBUM_DISLIKED",
            Self::ImageUploaded => "IMAGE_UPLOADED",
        }
    }

    /// Resolve a wire name, returning `None` for names outside the vocabulary.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == name)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| EventError::UnknownEventType(s.to_string()))
    }
}

/// Payload of [`EventType::AlbumCreated`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlbumCreated {
    /// Album identifier.
    pub album_id: String,
    /// Artist name.
    pub artist: String,
    /// Album title.
    pub title: String,
    /// Release year as a four digit string.
    pub year: String,
    /// Identifier of the stored cover image.
    pub image_id: String,
    /// Cover image size in bytes.
    pub image_size: i64,
}

/// Payload of [`EventType::AlbumLiked`] and [`EventType::AlbumDisliked`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlbumReviewed {
    /// Album identifier.
    pub album_id: String,
    /// `true` for a like, `false` for a dislike.
    pub liked: bool,
}

/// Payload of [`EventType::ImageUploaded`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageUploaded {
    /// Album identifier.
    pub album_id: String,
    /// Identifier of the stored image.
    pub image_id: String,
    /// Image size in bytes.
    pub image_size: i64,
    /// Whether a thumbnail must be generated.
    pub requires_processing: bool,
}

/// A typed payload. The variant determines the event type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventPayload {
    /// See [`AlbumCreated`].
    AlbumCreated(AlbumCreated),
    /// A review with `liked == true`.
    AlbumLiked(AlbumReviewed),
    /// A review with `liked == false`.
    AlbumDisliked(AlbumReviewed),
    /// See [`ImageUploaded`].
    ImageUploaded(ImageUploaded),
}

impl EventPayload {
    /// The event type carried by this payload.
    #[must_use]
    pub const fn event_type(&self) -> EventType {
        match self {
            Self::AlbumCreated(_) => EventType::AlbumCreated,
            Self::AlbumLiked(_) => EventType::AlbumLiked,
            Self::AlbumDisliked(_) => EventType::AlbumDisliked,
            Self::ImageUploaded(_) => EventType::ImageUploaded,
        }
    }

    /// Album the payload refers to.
    #[must_use]
    pub fn album_id(&self) -> &str {
        match self {
            Self::AlbumCreated(p) => &p.album_id,
            Self::AlbumLiked(p) | Self::AlbumDisliked(p) => &p.album_id,
            Self::ImageUploaded(p) => &p.album_id,
        }
    }

    fn to_value(&self) -> Result<serde_json::Value, serde_json::Error> {
        match self {
            Self::AlbumCreated(p) => serde_json::to_value(p),
            Self::AlbumLiked(p) | Self::AlbumDisliked(p) => serde_json::to_value(p),
            Self::ImageUploaded(p) => serde_json::to_value(p),
        }
    }

    fn from_value(event_type: EventType, value: serde_json::Value) -> Result<Self, EventError> {
        fn typed<P: DeserializeOwned>(
            event_type: EventType,
            value: serde_json::Value,
        ) -> Result<P, EventError> {
            serde_json::from_value(value).map_err(|e| EventError::PayloadMismatch {
                event_type,
                reason: e.to_string(),
            })
        }

        let payload = match event_type {
            EventType::AlbumCreated => Self::AlbumCreated(typed(event_type, value)?),
            EventType::AlbumLiked => Self::AlbumLiked(typed(event_type, value)?),
            EventType::AlbumDisliked => Self::AlbumDisliked(typed(event_type, value)?),
            EventType::ImageUploaded => Self::ImageUploaded(typed(event_type, value)?),
        };

        match &payload {
            Self::AlbumLiked(review) if !review.liked => Err(EventError::PayloadMismatch {
                event_type,
                reason: "liked flag is false".to_string(),
            }),
            Self::AlbumDisliked(review) if review.liked => Err(EventError::PayloadMismatch {
                event_type,
                reason: "liked flag is true".to_string(),
            }),
            _ => Ok(payload),
        }
    }
}

/// An immutable record of something that happened on the command side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainEvent {
    /// Globally unique id, also the broker grouping and deduplication key.
    pub id: String,
    /// Creation time.
    pub timestamp: DateTime<Utc>,
    /// Typed payload.
    pub payload: EventPayload,
    /// Routing attributes duplicated out of the payload.
    pub metadata: BTreeMap<String, String>,
}

impl DomainEvent {
    /// Create an event with a fresh id and the current time.
    #[must_use]
    pub fn new(payload: EventPayload, metadata: BTreeMap<String, String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            payload,
            metadata,
        }
    }

    /// An `AlbumCreated` event with `albumId` in the metadata.
    #[must_use]
    pub fn album_created(payload: AlbumCreated) -> Self {
        let metadata = BTreeMap::from([("albumId".to_string(), payload.album_id.clone())]);
        Self::new(EventPayload::AlbumCreated(payload), metadata)
    }

    /// An `AlbumLiked` event.
    #[must_use]
    pub fn album_liked(album_id: impl Into<String>) -> Self {
        Self::album_reviewed(album_id.into(), true)
    }

    /// An `AlbumDisliked` event.
    #[must_use]
    pub fn album_disliked(album_id: impl Into<String>) -> Self {
        Self::album_reviewed(album_id.into(), false)
    }

    fn album_reviewed(album_id: String, liked: bool) -> Self {
        let metadata = BTreeMap::from([
            ("albumId".to_string(), album_id.clone()),
            ("liked".to_string(), liked.to_string()),
        ]);
        let review = AlbumReviewed { album_id, liked };
        let payload = if liked {
            EventPayload::AlbumLiked(review)
        } else {
            EventPayload::AlbumDisliked(review)
        };
        Self::new(payload, metadata)
    }

    /// An `ImageUploaded` event with `albumId` and `imageId` in the metadata.
    #[must_use]
    pub fn image_uploaded(payload: ImageUploaded) -> Self {
        let metadata = BTreeMap::from([
            ("albumId".to_string(), payload.album_id.clone()),
            ("imageId".to_string(), payload.image_id.clone()),
        ]);
        Self::new(EventPayload::ImageUploaded(payload), metadata)
    }

    /// The event type, derived from the payload.
    #[must_use]
    pub const fn event_type(&self) -> EventType {
        self.payload.event_type()
    }

    /// Serialize to the JSON wire format.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::SerializationError`] if the payload cannot be encoded.
    pub fn to_json(&self) -> Result<Vec<u8>, EventError> {
        let payload = self
            .payload
            .to_value()
            .map_err(|e| EventError::SerializationError(e.to_string()))?;
        let envelope = EventEnvelope {
            id: self.id.clone(),
            event_type: self.event_type().as_str().to_string(),
            timestamp: self.timestamp,
            payload,
            metadata: self.metadata.clone(),
        };
        serde_json::to_vec(&envelope).map_err(|e| EventError::SerializationError(e.to_string()))
    }
}

/// The wire form of a domain event before its type is resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Event id.
    pub id: String,
    /// Wire type name, possibly outside the known vocabulary.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Creation time.
    pub timestamp: DateTime<Utc>,
    /// Raw payload.
    pub payload: serde_json::Value,
    /// Routing attributes.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl EventEnvelope {
    /// Parse a message body.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::DeserializationError`] if the body is not a
    /// JSON event envelope.
    pub fn from_slice(body: &[u8]) -> Result<Self, EventError> {
        serde_json::from_slice(body).map_err(|e| EventError::DeserializationError(e.to_string()))
    }

    /// The resolved event type, or `None` if the name is unknown.
    #[must_use]
    pub fn known_type(&self) -> Option<EventType> {
        EventType::parse(&self.event_type)
    }

    /// Recover the typed event from the declared `type`.
    ///
    /// # Errors
    ///
    /// - [`EventError::UnknownEventType`] if `type` is outside the vocabulary
    /// - [`EventError::PayloadMismatch`] if `payload` does not fit `type`
    pub fn decode(&self) -> Result<DomainEvent, EventError> {
        let event_type: EventType = self.event_type.parse()?;
        let payload = EventPayload::from_value(event_type, self.payload.clone())?;
        Ok(DomainEvent {
            id: self.id.clone(),
            timestamp: self.timestamp,
            payload,
            metadata: self.metadata.clone(),
        })
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)] // Panics: Test will fail if encoding fails
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_created() -> AlbumCreated {
        AlbumCreated {
            album_id: "A1".to_string(),
            artist: "Sex Pistols".to_string(),
            title: "Never Mind the Bollocks".to_string(),
            year: "1977".to_string(),
            image_id: "img-1".to_string(),
            image_size: 2048,
        }
    }

    #[test]
    fn wire_names_are_screaming_snake_case() {
        assert_eq!(EventType::AlbumCreated.as_str(), "ALBUM_CREATED");
        assert_eq!(EventType::AlbumLiked.as_str(), "ALBUM_LIKED");
        assert_eq!(EventType::AlbumDisliked.as_str(), "ALBUM_DISLIKED");
        assert_eq!(EventType::ImageUploaded.as_str(), "IMAGE_UPLOADED");
        assert_eq!(EventType::parse("ALBUM_ARCHIVED"), None);
        assert!(matches!(
            "nope".parse::<EventType>(),
            Err(EventError::UnknownEventType(name)) if name == "nope"
        ));
    }

    #[test]
    fn constructors_assign_distinct_ids_and_routing_metadata() {
        let a = DomainEvent::album_liked("A1");
        let b = DomainEvent::album_liked("A1");

        assert_ne!(a.id, b.id);
        assert_eq!(a.event_type(), EventType::AlbumLiked);
        assert_eq!(a.metadata.get("albumId").map(String::as_str), Some("A1"));
        assert_eq!(a.metadata.get("liked").map(String::as_str), Some("true"));

        let d = DomainEvent::album_disliked("A2");
        assert_eq!(d.event_type(), EventType::AlbumDisliked);
        assert_eq!(d.metadata.get("liked").map(String::as_str), Some("false"));
    }

    #[test]
    fn json_uses_camel_case_payload_fields() {
        let event = DomainEvent::album_created(sample_created());
        let bytes = event.to_json().expect("serialization should succeed");
        let value: serde_json::Value = serde_json::from_slice(&bytes).expect("valid json");

        assert_eq!(value["type"], "ALBUM_CREATED");
        assert_eq!(value["payload"]["albumId"], "A1");
        assert_eq!(value["payload"]["imageSize"], 2048);
        assert_eq!(value["metadata"]["albumId"], "A1");
    }

    #[test]
    fn envelope_decodes_back_to_the_same_event() {
        let event = DomainEvent::image_uploaded(ImageUploaded {
            album_id: "A1".to_string(),
            image_id: "img-1".to_string(),
            image_size: 10,
            requires_processing: true,
        });
        let bytes = event.to_json().expect("serialization should succeed");

        let envelope = EventEnvelope::from_slice(&bytes).expect("envelope should parse");
        assert_eq!(envelope.known_type(), Some(EventType::ImageUploaded));
        assert_eq!(envelope.decode().expect("decode should succeed"), event);
    }

    #[test]
    fn unknown_type_is_still_a_valid_envelope() {
        let body = json!({
            "id": "e1",
            "type": "ALBUM_ARCHIVED",
            "timestamp": "2024-03-01T12:00:00Z",
            "payload": {"albumId": "A1"}
        });
        let envelope =
            EventEnvelope::from_slice(body.to_string().as_bytes()).expect("envelope should parse");

        assert_eq!(envelope.known_type(), None);
        assert!(envelope.metadata.is_empty());
        assert!(matches!(envelope.decode(), Err(EventError::UnknownEventType(_))));
    }

    #[test]
    fn malformed_body_is_a_deserialization_error() {
        assert!(matches!(
            EventEnvelope::from_slice(b"not json"),
            Err(EventError::DeserializationError(_))
        ));
    }

    #[test]
    fn payload_shape_mismatch_is_rejected() {
        let body = json!({
            "id": "e1",
            "type": "ALBUM_CREATED",
            "timestamp": "2024-03-01T12:00:00Z",
            "payload": {"albumId": "A1", "liked": true}
        });
        let envelope =
            EventEnvelope::from_slice(body.to_string().as_bytes()).expect("envelope should parse");

        assert!(matches!(
            envelope.decode(),
            Err(EventError::PayloadMismatch { event_type: EventType::AlbumCreated, .. })
        ));
    }

    #[test]
    fn liked_flag_must_agree_with_review_type() {
        let body = json!({
            "id": "e1",
            "type": "ALBUM_LIKED",
            "timestamp": "2024-03-01T12:00:00Z",
            "payload": {"albumId": "A1", "liked": false}
        });
        let envelope =
            EventEnvelope::from_slice(body.to_string().as_bytes()).expect("envelope should parse");

        assert!(matches!(
            envelope.decode(),
            Err(EventError::PayloadMismatch { event_type: EventType::AlbumLiked, .. })
        ));
    }
}
