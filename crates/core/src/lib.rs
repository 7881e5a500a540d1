pub mod hashing;
pub mod models;
pub mod validation;

pub use models::{
    default_segments, ConversionEvent, CrmSegment, CustomData, EventKind, Lead, LeadForm,
    LeadStatus, ManualLead, MatchingPayload, Network, NewSegment, SegmentPatch,
};
