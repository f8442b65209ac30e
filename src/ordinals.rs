//! Enumerations that cross the bridge as small integers
//!
//! The embedded runtime decodes these ordinals with one table shared by every
//! platform binding, so the discriminants below must never be renumbered.

use serde::{Serialize, Serializer};

/// Outcome of a deferred deep link lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DeepLinkResolution {
    /// The lookup request itself failed
    LookupFailed = 0,
    /// No link matched the clicked URL
    LinkNotFound = 1,
    /// The link exists but has expired
    LinkExpired = 2,
    /// The link's usage limit was exceeded
    LimitExceeded = 3,
    /// The link resolved successfully
    LinkMatched = 4,
}

impl DeepLinkResolution {
    /// Create a DeepLinkResolution from a u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::LookupFailed),
            1 => Some(Self::LinkNotFound),
            2 => Some(Self::LinkExpired),
            3 => Some(Self::LimitExceeded),
            4 => Some(Self::LinkMatched),
            _ => None,
        }
    }

    /// The stable wire ordinal
    pub fn ordinal(self) -> u8 {
        self as u8
    }
}

impl Serialize for DeepLinkResolution {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.ordinal())
    }
}

/// Result of presenting an inbox message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum InboxPresentationResult {
    /// The message was shown
    Presented = 0,
    /// The message has expired and cannot be shown
    FailedExpired = 1,
    /// Any other failure, including unknown message ids
    Failed = 2,
}

impl InboxPresentationResult {
    /// Create an InboxPresentationResult from a u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Presented),
            1 => Some(Self::FailedExpired),
            2 => Some(Self::Failed),
            _ => None,
        }
    }

    /// The stable wire ordinal
    pub fn ordinal(self) -> u8 {
        self as u8
    }
}

impl Serialize for InboxPresentationResult {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.ordinal())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0, DeepLinkResolution::LookupFailed)]
    #[case(1, DeepLinkResolution::LinkNotFound)]
    #[case(2, DeepLinkResolution::LinkExpired)]
    #[case(3, DeepLinkResolution::LimitExceeded)]
    #[case(4, DeepLinkResolution::LinkMatched)]
    fn deep_link_resolution_ordinals_are_fixed(#[case] ordinal: u8, #[case] resolution: DeepLinkResolution) {
        assert_eq!(resolution.ordinal(), ordinal);
        assert_eq!(DeepLinkResolution::from_u8(ordinal), Some(resolution));
        assert_eq!(serde_json::to_value(resolution).unwrap(), serde_json::json!(ordinal));
    }

    #[rstest]
    #[case(0, InboxPresentationResult::Presented)]
    #[case(1, InboxPresentationResult::FailedExpired)]
    #[case(2, InboxPresentationResult::Failed)]
    fn presentation_result_ordinals_are_fixed(
        #[case] ordinal: u8,
        #[case] result: InboxPresentationResult,
    ) {
        assert_eq!(result.ordinal(), ordinal);
        assert_eq!(InboxPresentationResult::from_u8(ordinal), Some(result));
    }

    #[test]
    fn unknown_ordinals_are_rejected() {
        assert_eq!(DeepLinkResolution::from_u8(5), None);
        assert_eq!(InboxPresentationResult::from_u8(3), None);
    }
}
