//! The outbound delivery seam.
//!
//! The engine talks to messaging platforms through [`DeliveryGateway`] so
//! tests can swap in a recording stub and production wires up the Graph API
//! client.

use async_trait::async_trait;

use crate::error::DeliveryError;
use crate::model::Account;

use super::payload::OutboundMessage;

/// What the platform told us about a successful send.
#[derive(Debug, Clone, Default)]
pub struct DeliveryReceipt {
    /// Platform-assigned message id, when the API returns one.
    pub message_id: Option<String>,
}

/// Participant profile fields fetched from the platform.
#[derive(Debug, Clone, Default)]
pub struct ParticipantProfile {
    pub username: Option<String>,
    pub name: Option<String>,
    pub profile_picture_url: Option<String>,
    pub is_follower: Option<bool>,
}

#[async_trait]
pub trait DeliveryGateway: Send + Sync {
    /// Send one message to `recipient_id` on behalf of `account`.
    async fn send(
        &self,
        account: &Account,
        recipient_id: &str,
        message: &OutboundMessage,
    ) -> Result<DeliveryReceipt, DeliveryError>;

    /// Fetch the participant's public profile.
    async fn fetch_profile(
        &self,
        account: &Account,
        participant_id: &str,
    ) -> Result<ParticipantProfile, DeliveryError>;
}
