mod audit;
pub mod orchestrator;
pub mod submission;

pub use orchestrator::{
    ConfirmOutcome, ConversionOrchestrator, MatchingEnricher, Sha256Enricher,
};
pub use submission::{SubmissionFlow, SubmitError, ThankYouRedirect};
