use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

macro_rules! event_types {
    ($($variant:ident => $name:literal,)+) => {
        /// EventSub subscription types a trigger can be configured for.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
        #[serde(try_from = "String")]
        pub enum EventType {
            $($variant,)+
        }

        impl EventType {
            pub const ALL: &'static [EventType] = &[$(EventType::$variant,)+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $(EventType::$variant => $name,)+
                }
            }
        }

        impl FromStr for EventType {
            type Err = UnknownEventType;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($name => Ok(EventType::$variant),)+
                    other => Err(UnknownEventType(other.to_string())),
                }
            }
        }
    };
}

event_types! {
    ChannelBan => "channel.ban",
    ChannelPointsCustomRewardAdd => "channel.channel_points_custom_reward.add",
    ChannelPointsCustomRewardRemove => "channel.channel_points_custom_reward.remove",
    ChannelPointsCustomRewardUpdate => "channel.channel_points_custom_reward.update",
    ChannelPointsRedemptionAdd => "channel.channel_points_custom_reward_redemption.add",
    ChannelPointsRedemptionUpdate => "channel.channel_points_custom_reward_redemption.update",
    CharityCampaignDonate => "channel.charity_campaign.donate",
    CharityCampaignProgress => "channel.charity_campaign.progress",
    CharityCampaignStart => "channel.charity_campaign.start",
    CharityCampaignStop => "channel.charity_campaign.stop",
    ChannelCheer => "channel.cheer",
    ChannelFollow => "channel.follow",
    GoalBegin => "channel.goal.begin",
    GoalEnd => "channel.goal.end",
    GoalProgress => "channel.goal.progress",
    HypeTrainBegin => "channel.hype_train.begin",
    HypeTrainEnd => "channel.hype_train.end",
    HypeTrainProgress => "channel.hype_train.progress",
    ModeratorAdd => "channel.moderator.add",
    ModeratorRemove => "channel.moderator.remove",
    PollBegin => "channel.poll.begin",
    PollEnd => "channel.poll.end",
    PollProgress => "channel.poll.progress",
    PredictionBegin => "channel.prediction.begin",
    PredictionEnd => "channel.prediction.end",
    PredictionLock => "channel.prediction.lock",
    PredictionProgress => "channel.prediction.progress",
    ChannelRaid => "channel.raid",
    ShieldModeBegin => "channel.shield_mode.begin",
    ShieldModeEnd => "channel.shield_mode.end",
    ShoutoutCreate => "channel.shoutout.create",
    ShoutoutReceive => "channel.shoutout.receive",
    ChannelSubscribe => "channel.subscribe",
    SubscriptionEnd => "channel.subscription.end",
    SubscriptionGift => "channel.subscription.gift",
    SubscriptionMessage => "channel.subscription.message",
    ChannelUnban => "channel.unban",
    ChannelUpdate => "channel.update",
    StreamOffline => "stream.offline",
    StreamOnline => "stream.online",
    UserAuthorizationGrant => "user.authorization.grant",
    UserAuthorizationRevoke => "user.authorization.revoke",
    UserUpdate => "user.update",
}

impl EventType {
    /// Event types whose condition accepts a `reward_id` filter.
    pub fn accepts_reward_id(&self) -> bool {
        matches!(
            self,
            EventType::ChannelPointsCustomRewardRemove
                | EventType::ChannelPointsCustomRewardUpdate
                | EventType::ChannelPointsRedemptionAdd
                | EventType::ChannelPointsRedemptionUpdate
        )
    }

    /// Authorization events are scoped to the application, not a channel.
    pub fn is_client_scoped(&self) -> bool {
        matches!(
            self,
            EventType::UserAuthorizationGrant | EventType::UserAuthorizationRevoke
        )
    }
}

impl Default for EventType {
    fn default() -> Self {
        EventType::StreamOnline
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for EventType {
    type Error = UnknownEventType;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl Serialize for EventType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unsupported event type: {0}")]
pub struct UnknownEventType(pub String);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RaidDirection {
    /// The channel starts a raid.
    From,
    /// The channel receives a raid.
    #[default]
    To,
}

/// Event-type-dependent extras for the subscription condition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuxiliaryCondition {
    #[serde(rename = "rewardId", default, skip_serializing_if = "Option::is_none")]
    pub reward_id: Option<String>,
    #[serde(rename = "raidDirection", default)]
    pub raid_direction: RaidDirection,
}

/// Desired subscription state for one trigger instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionDescriptor {
    #[serde(rename = "event", default)]
    pub event_type: EventType,
    pub channel_name: String,
    #[serde(rename = "additional", default)]
    pub auxiliary: AuxiliaryCondition,
}

pub type Condition = BTreeMap<String, String>;

impl SubscriptionDescriptor {
    /// Build the condition payload for the resolved target entity.
    pub fn condition(&self, target_entity_id: &str, client_id: &str) -> Condition {
        let mut condition = Condition::new();
        match self.event_type {
            EventType::ChannelRaid => {
                let key = match self.auxiliary.raid_direction {
                    RaidDirection::From => "from_broadcaster_user_id",
                    RaidDirection::To => "to_broadcaster_user_id",
                };
                condition.insert(key.into(), target_entity_id.into());
            }
            EventType::UserUpdate => {
                condition.insert("user_id".into(), target_entity_id.into());
            }
            t if t.is_client_scoped() => {
                condition.insert("client_id".into(), client_id.into());
            }
            t => {
                condition.insert("broadcaster_user_id".into(), target_entity_id.into());
                if t.accepts_reward_id() {
                    if let Some(reward) = self.auxiliary.reward_id.as_deref().filter(|r| !r.is_empty()) {
                        condition.insert("reward_id".into(), reward.into());
                    }
                }
            }
        }
        condition
    }
}

// ─── Helix wire types ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transport {
    pub method: String,
    #[serde(default)]
    pub callback: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
}

/// The remote service's view of a subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionRecord {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub condition: Value,
    pub transport: Transport,
    #[serde(default)]
    pub status: String,
}

impl SubscriptionRecord {
    pub fn matches(&self, event_type: EventType, callback_url: &str) -> bool {
        self.event_type == event_type.as_str()
            && self.transport.callback.as_deref() == Some(callback_url)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CreateSubscriptionRequest {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub version: &'static str,
    pub condition: Condition,
    pub transport: Transport,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Pagination {
    #[serde(default)]
    pub cursor: Option<String>,
}

/// One page of `GET /eventsub/subscriptions`.
#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionPage {
    pub data: Vec<SubscriptionRecord>,
    #[serde(default)]
    pub pagination: Pagination,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct User {
    pub id: String,
    #[serde(default)]
    pub login: String,
}

#[derive(Debug, Deserialize)]
pub struct DataEnvelope<T> {
    pub data: Vec<T>,
}

/// A webhook delivery queued for event.publish, not yet sent to host.
#[derive(Debug, Clone)]
pub struct PendingEvent {
    pub delivery_id: String,
    pub received_at: chrono::DateTime<chrono::Utc>,
    pub instance_id: String,
    pub event_type: String,
    pub data: Value,
}
