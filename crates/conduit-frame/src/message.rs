use crate::codec::MARKER;
use crate::mutf8;

/// One conduit message: who sent it, what it is about, and what it says.
///
/// Only the wire representation matters; the routing id is opaque to the
/// conduit and exists so receivers can filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConduitMessage {
    user: String,
    id: String,
    payload: String,
}

impl ConduitMessage {
    /// Create a message stamped with the local OS user name.
    pub fn new(id: impl Into<String>, payload: impl Into<String>) -> Self {
        Self::from_parts(local_user(), id, payload)
    }

    /// Create a message with an explicit sender.
    pub fn from_parts(
        user: impl Into<String>,
        id: impl Into<String>,
        payload: impl Into<String>,
    ) -> Self {
        Self {
            user: user.into(),
            id: id.into(),
            payload: payload.into(),
        }
    }

    /// User name of the sending process.
    pub fn user(&self) -> &str {
        &self.user
    }

    /// Routing id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Message body.
    pub fn payload(&self) -> &str {
        &self.payload
    }

    /// The total wire size of this message (marker + prefixed strings).
    pub fn wire_size(&self) -> usize {
        MARKER.len()
            + 6
            + mutf8::encoded_len(&self.user)
            + mutf8::encoded_len(&self.id)
            + mutf8::encoded_len(&self.payload)
    }
}

/// User name of the current OS session.
pub fn local_user() -> String {
    whoami::username()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_stamps_local_user() {
        let msg = ConduitMessage::new("open", "/tmp/sheet.gcs");
        assert_eq!(msg.user(), local_user());
        assert_eq!(msg.id(), "open");
        assert_eq!(msg.payload(), "/tmp/sheet.gcs");
    }

    #[test]
    fn wire_size_counts_marker_and_prefixes() {
        let msg = ConduitMessage::from_parts("al", "x", "");
        assert_eq!(msg.wire_size(), MARKER.len() + 6 + 2 + 1);
    }
}
