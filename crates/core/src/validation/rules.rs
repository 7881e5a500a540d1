use crate::models::LeadForm;

const NAME_MIN_CHARS: usize = 3;
const NAME_MAX_CHARS: usize = 100;

/// `01` + one of `0`, `1`, `2`, `5` + eight digits.
pub fn is_egyptian_mobile(phone: &str) -> bool {
    let bytes = phone.as_bytes();
    bytes.len() == 11
        && bytes.iter().all(u8::is_ascii_digit)
        && bytes.starts_with(b"01")
        && matches!(bytes[2], b'0' | b'1' | b'2' | b'5')
}

fn check_name(label: &str, name: &str, errs: &mut Vec<String>) {
    let len = name.trim().chars().count();
    if len < NAME_MIN_CHARS {
        errs.push(format!("{label}: must be at least {NAME_MIN_CHARS} characters"));
    } else if len > NAME_MAX_CHARS {
        errs.push(format!("{label}: must be at most {NAME_MAX_CHARS} characters"));
    }
}

fn check_phone(label: &str, phone: &str, errs: &mut Vec<String>) {
    if !is_egyptian_mobile(phone.trim()) {
        errs.push(format!(
            "{label}: must be 11 digits starting with 010, 011, 012 or 015"
        ));
    }
}

pub fn name_checks(form: &LeadForm) -> Result<(), Vec<String>> {
    let mut errs = Vec::new();
    check_name("user_name", &form.user_name, &mut errs);
    check_name("friend_name", &form.friend_name, &mut errs);
    if errs.is_empty() {
        Ok(())
    } else {
        Err(errs)
    }
}

pub fn phone_checks(form: &LeadForm) -> Result<(), Vec<String>> {
    let mut errs = Vec::new();
    check_phone("user_phone", &form.user_phone, &mut errs);
    check_phone("friend_phone", &form.friend_phone, &mut errs);

    // The buddy must be a different person
    if form.user_phone.trim() == form.friend_phone.trim() {
        errs.push("friend_phone: your phone and your friend's phone must differ".to_string());
    }

    if errs.is_empty() {
        Ok(())
    } else {
        Err(errs)
    }
}
