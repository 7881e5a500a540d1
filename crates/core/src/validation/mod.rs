mod rules;

use crate::models::LeadForm;

pub use rules::is_egyptian_mobile;

/// Validates a buddy registration, collecting every problem found.
pub fn validate_lead_form(form: &LeadForm) -> Result<(), Vec<String>> {
    let mut errs = Vec::new();
    if let Err(mut e) = rules::name_checks(form) {
        errs.append(&mut e);
    }
    if let Err(mut e) = rules::phone_checks(form) {
        errs.append(&mut e);
    }
    if errs.is_empty() {
        Ok(())
    } else {
        Err(errs)
    }
}
