use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const CURRENCY: &str = "EGP";

/// Attached to the matching event fired before the lead is persisted.
pub const REGISTRATION_CONTENT_NAME: &str = "First Aid Course Registration";
pub const REGISTRATION_VALUE: f64 = 100.0;

/// Attached to the confirmation fired on the thank-you view (venue fee, used for ROAS).
pub const COURSE_CONTENT_NAME: &str = "First Aid Course";
pub const VENUE_FEE_VALUE: f64 = 90.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LeadStatus {
    #[default]
    New,
    Contacted,
    Confirmed,
    Rejected,
}

impl LeadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LeadStatus::New => "new",
            LeadStatus::Contacted => "contacted",
            LeadStatus::Confirmed => "confirmed",
            LeadStatus::Rejected => "rejected",
        }
    }
}

impl fmt::Display for LeadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LeadStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "new" => Ok(LeadStatus::New),
            "contacted" => Ok(LeadStatus::Contacted),
            "confirmed" => Ok(LeadStatus::Confirmed),
            "rejected" => Ok(LeadStatus::Rejected),
            other => Err(format!("unknown lead status: {other}")),
        }
    }
}

/// A persisted registration: the submitter plus the referred buddy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lead {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub user_name: String,
    pub user_phone: String,
    pub friend_name: String,
    pub friend_phone: String,
    #[serde(default)]
    pub status: LeadStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segment_id: Option<String>,
}

/// Raw form input, also used as the insert row for the lead store.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct LeadForm {
    pub user_name: String,
    pub user_phone: String,
    pub friend_name: String,
    pub friend_phone: String,
}

impl LeadForm {
    pub fn has_friend(&self) -> bool {
        !self.friend_name.trim().is_empty() || !self.friend_phone.trim().is_empty()
    }
}

/// A lead typed in by the admin rather than submitted through the form.
/// The store has no email/source columns, so those land in the buddy fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManualLead {
    pub user_name: String,
    pub user_phone: String,
    pub email: Option<String>,
    pub source: Option<String>,
}

impl ManualLead {
    pub fn into_form(self) -> LeadForm {
        LeadForm {
            user_name: self.user_name,
            user_phone: self.user_phone,
            friend_name: self.email.unwrap_or_default(),
            friend_phone: self.source.unwrap_or_default(),
        }
    }
}

/// A CRM pipeline column leads can be filed under.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CrmSegment {
    pub id: String,
    pub name: String,
    pub color: String,
    pub order_index: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewSegment {
    pub name: String,
    pub color: String,
    pub order_index: i32,
}

/// Partial segment update; absent fields are left unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SegmentPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_index: Option<i32>,
}

impl SegmentPatch {
    pub fn apply(&self, segment: &mut CrmSegment) {
        if let Some(name) = &self.name {
            segment.name = name.clone();
        }
        if let Some(color) = &self.color {
            segment.color = color.clone();
        }
        if let Some(order_index) = self.order_index {
            segment.order_index = order_index;
        }
    }
}

/// Pipeline used when the hosted segment table is missing or unreachable.
pub fn default_segments() -> Vec<CrmSegment> {
    [
        ("1", "جديد", "blue"),
        ("2", "تم التواصل", "yellow"),
        ("3", "مؤكد", "green"),
        ("4", "مرفوض", "red"),
    ]
    .into_iter()
    .zip(0..)
    .map(|((id, name, color), order_index)| CrmSegment {
        id: id.to_string(),
        name: name.to_string(),
        color: color.to_string(),
        order_index,
        created_at: None,
    })
    .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Facebook,
    TikTok,
    Snapchat,
}

impl Network {
    pub const ALL: [Network; 3] = [Network::Facebook, Network::TikTok, Network::Snapchat];

    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Facebook => "facebook",
            Network::TikTok => "tiktok",
            Network::Snapchat => "snapchat",
        }
    }

    /// Only Meta reconciles duplicate client events by an explicit event id.
    pub fn supports_event_id(&self) -> bool {
        matches!(self, Network::Facebook)
    }

    /// The event each network uses to record a captured lead.
    pub fn conversion_kind(&self) -> EventKind {
        match self {
            Network::Facebook => EventKind::Lead,
            Network::TikTok => EventKind::SubmitForm,
            Network::Snapchat => EventKind::SignUp,
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    PageView,
    InitiateCheckout,
    Lead,
    SubmitForm,
    SignUp,
}

impl EventKind {
    /// Event name as the network's dashboards know it. These strings are
    /// matched verbatim by existing analytics reports.
    pub fn wire_name(self, network: Network) -> &'static str {
        match (self, network) {
            (EventKind::PageView, Network::Facebook) => "PageView",
            (EventKind::PageView, Network::TikTok) => "Pageview",
            (EventKind::PageView, Network::Snapchat) => "PAGE_VIEW",
            (EventKind::InitiateCheckout, _) => "InitiateCheckout",
            (EventKind::Lead, _) => "Lead",
            (EventKind::SubmitForm, _) => "SubmitForm",
            (EventKind::SignUp, _) => "SIGN_UP",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomData {
    pub content_name: String,
    pub value: f64,
    pub currency: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub friend_referral: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub friend_count: Option<u8>,
}

impl CustomData {
    pub fn registration(form: &LeadForm) -> Self {
        Self {
            content_name: REGISTRATION_CONTENT_NAME.to_string(),
            value: REGISTRATION_VALUE,
            currency: CURRENCY.to_string(),
            friend_referral: Some(form.has_friend()),
            friend_count: Some(if form.friend_name.trim().is_empty() { 0 } else { 1 }),
        }
    }

    pub fn venue_fee() -> Self {
        Self {
            content_name: COURSE_CONTENT_NAME.to_string(),
            value: VENUE_FEE_VALUE,
            currency: CURRENCY.to_string(),
            friend_referral: None,
            friend_count: None,
        }
    }

    pub fn checkout_started() -> Self {
        Self {
            content_name: COURSE_CONTENT_NAME.to_string(),
            value: 0.0,
            currency: CURRENCY.to_string(),
            friend_referral: None,
            friend_count: None,
        }
    }
}

/// Hashed advanced-matching keys. Never carries raw PII.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchingPayload {
    #[serde(rename = "ph")]
    pub hashed_phone: String,
    #[serde(rename = "fn")]
    pub hashed_first_name: String,
    #[serde(rename = "ln", default, skip_serializing_if = "Option::is_none")]
    pub hashed_last_name: Option<String>,
}

/// A transient, never-persisted notification for one or more pixels.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversionEvent {
    pub kind: EventKind,
    pub dedup_key: Option<String>,
    pub custom_data: Option<CustomData>,
    pub matching: Option<MatchingPayload>,
    pub event_id: Option<String>,
}

impl ConversionEvent {
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            dedup_key: None,
            custom_data: None,
            matching: None,
            event_id: None,
        }
    }

    pub fn with_custom_data(mut self, data: CustomData) -> Self {
        self.custom_data = Some(data);
        self
    }

    pub fn with_matching(mut self, matching: Option<MatchingPayload>) -> Self {
        self.matching = matching;
        self
    }

    pub fn with_event_id(mut self, event_id: Option<String>) -> Self {
        self.event_id = event_id;
        self
    }

    pub fn with_dedup_key(mut self, key: String) -> Self {
        self.dedup_key = Some(key);
        self
    }

    /// Restates this event for a specific network: conversion kinds are
    /// mapped to the network's own taxonomy, and event ids are dropped where
    /// the network cannot deduplicate by them.
    pub fn for_network(&self, network: Network) -> ConversionEvent {
        let kind = match self.kind {
            EventKind::Lead | EventKind::SubmitForm | EventKind::SignUp => {
                network.conversion_kind()
            }
            other => other,
        };
        let mut event = self.clone();
        event.kind = kind;
        if !network.supports_event_id() {
            event.event_id = None;
        }
        if network != Network::Facebook {
            event.custom_data = None;
            event.matching = None;
        }
        event
    }
}
