use chrono::NaiveTime;
use chrono_tz::Tz;

use crate::limits::*;
use crate::model::*;

use super::conflict::validate_timestamp;
use super::lifecycle::initial_status;
use super::{EngineError, FieldError};

/// Trimmed, lower-cased. Contacts are matched on this form.
pub(crate) fn normalize_email(email: &str) -> String {
    email.trim().to_ascii_lowercase()
}

fn check_name(field: &'static str, name: &str, errors: &mut Vec<FieldError>) {
    let name = name.trim();
    if name.is_empty() {
        errors.push(FieldError::new(field, "must not be empty"));
    } else if name.len() > MAX_NAME_LEN {
        errors.push(FieldError::new(field, format!("longer than {MAX_NAME_LEN} bytes")));
    }
}

fn email_problem(email: &str) -> Option<&'static str> {
    let email = email.trim();
    if email.is_empty() {
        return Some("must not be empty");
    }
    if email.len() > MAX_EMAIL_LEN {
        return Some("too long");
    }
    if email.chars().any(char::is_whitespace) {
        return Some("must not contain whitespace");
    }
    let Some((local, domain)) = email.split_once('@') else {
        return Some("missing '@'");
    };
    if domain.contains('@') {
        return Some("more than one '@'");
    }
    if local.is_empty() {
        return Some("missing local part");
    }
    if !domain.contains('.') || domain.starts_with('.') || domain.ends_with('.') {
        return Some("domain must contain a dot");
    }
    None
}

fn phone_problem(phone: &str) -> Option<&'static str> {
    let phone = phone.trim();
    if phone.len() > MAX_PHONE_LEN {
        return Some("too long");
    }
    let allowed = |c: char| c.is_ascii_digit() || matches!(c, ' ' | '-' | '(' | ')' | '.');
    let body = phone.strip_prefix('+').unwrap_or(phone);
    if !body.chars().all(allowed) {
        return Some("may only contain digits, spaces, and + - ( ) .");
    }
    let digits = body.chars().filter(char::is_ascii_digit).count();
    if !(MIN_PHONE_DIGITS..=MAX_PHONE_DIGITS).contains(&digits) {
        return Some("must have 7 to 15 digits");
    }
    None
}

/// Every field problem in a booking request, reported together.
pub(crate) fn booking_request(request: &BookingRequest) -> Result<BookingStatus, EngineError> {
    let mut errors = Vec::new();

    check_name("name", &request.contact.name, &mut errors);
    if let Some(problem) = email_problem(&request.contact.email) {
        errors.push(FieldError::new("email", problem));
    }
    if let Some(phone) = request.contact.phone.as_deref()
        && let Some(problem) = phone_problem(phone)
    {
        errors.push(FieldError::new("phone", problem));
    }
    if let Some(notes) = &request.notes
        && notes.len() > MAX_NOTES_LEN
    {
        errors.push(FieldError::new("notes", format!("longer than {MAX_NOTES_LEN} bytes")));
    }
    if let Err(e) = validate_timestamp("scheduled_at", request.requested_at) {
        errors.push(e);
    }
    let status = initial_status(request.origin, request.initial_status);
    if let Err(e) = &status {
        errors.push(e.clone());
    }

    match status {
        Ok(status) if errors.is_empty() => Ok(status),
        _ => Err(EngineError::Validation(errors)),
    }
}

pub(crate) fn name(field: &'static str, value: &str) -> Result<(), EngineError> {
    let mut errors = Vec::new();
    check_name(field, value, &mut errors);
    if errors.is_empty() {
        Ok(())
    } else {
        Err(EngineError::Validation(errors))
    }
}

pub(crate) fn optional_text(field: &'static str, value: Option<&str>) -> Result<(), EngineError> {
    match value {
        Some(v) if v.len() > MAX_NOTES_LEN => Err(EngineError::invalid(
            field,
            format!("longer than {MAX_NOTES_LEN} bytes"),
        )),
        _ => Ok(()),
    }
}

pub(crate) fn timezone(name: &str) -> Result<Tz, EngineError> {
    name.trim()
        .parse::<Tz>()
        .map_err(|_| EngineError::invalid("timezone", format!("unknown IANA zone {name:?}")))
}

pub(crate) fn duration(minutes: u32) -> Result<(), EngineError> {
    if minutes == 0 || minutes > MAX_DURATION_MINUTES {
        return Err(EngineError::invalid(
            "duration_minutes",
            format!("must be between 1 and {MAX_DURATION_MINUTES}"),
        ));
    }
    Ok(())
}

pub(crate) fn rule_window(
    day_of_week: u8,
    start: NaiveTime,
    end: NaiveTime,
    resource: Option<&str>,
) -> Result<(), EngineError> {
    let mut errors = Vec::new();
    if day_of_week > 6 {
        errors.push(FieldError::new("day_of_week", "must be 0 (Sunday) to 6 (Saturday)"));
    }
    if start >= end {
        errors.push(FieldError::new("end_time", "must be after start_time"));
    }
    if resource.is_some_and(|r| r.len() > MAX_RESOURCE_LABEL_LEN) {
        errors.push(FieldError::new("resource", "label too long"));
    }
    if errors.is_empty() {
        Ok(())
    } else {
        Err(EngineError::Validation(errors))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    fn request(name: &str, email: &str, phone: Option<&str>) -> BookingRequest {
        BookingRequest::new(
            Ulid::new(),
            Ulid::new(),
            2_000_000_000_000,
            ContactInput {
                name: name.into(),
                email: email.into(),
                phone: phone.map(str::to_string),
            },
        )
    }

    fn fields(err: EngineError) -> Vec<&'static str> {
        match err {
            EngineError::Validation(errors) => errors.into_iter().map(|e| e.field).collect(),
            other => panic!("expected Validation, got {other:?}"),
        }
    }

    #[test]
    fn well_formed_request_passes() {
        let req = request("Ada Lovelace", "ada@example.com", Some("+44 (20) 7946-0958"));
        assert_eq!(booking_request(&req).unwrap(), BookingStatus::Pending);
    }

    #[test]
    fn all_field_errors_reported_together() {
        let req = request("  ", "not-an-email", Some("12"));
        assert_eq!(fields(booking_request(&req).unwrap_err()), vec!["name", "email", "phone"]);
    }

    #[test]
    fn email_shapes() {
        assert_eq!(email_problem("a@b.co"), None);
        assert_eq!(email_problem(" Ada@Example.COM "), None);
        assert!(email_problem("@example.com").is_some());
        assert!(email_problem("a@b@c.com").is_some());
        assert!(email_problem("a@localhost").is_some());
        assert!(email_problem("a b@c.com").is_some());
        assert!(email_problem("").is_some());
    }

    #[test]
    fn phone_shapes() {
        assert_eq!(phone_problem("555-0100 12"), None);
        assert_eq!(phone_problem("+1 (555) 010.0199"), None);
        assert!(phone_problem("555-01a0").is_some());
        assert!(phone_problem("1+5550100").is_some());
        assert!(phone_problem("123456").is_some());
        assert!(phone_problem("1234567890123456").is_some());
    }

    #[test]
    fn public_confirmed_is_a_status_error() {
        let req = request("Ada", "ada@example.com", None).by_staff(BookingStatus::Confirmed);
        assert_eq!(booking_request(&req).unwrap(), BookingStatus::Confirmed);

        let mut req = request("Ada", "ada@example.com", None);
        req.initial_status = BookingStatus::Confirmed;
        assert_eq!(fields(booking_request(&req).unwrap_err()), vec!["status"]);
    }

    #[test]
    fn out_of_range_timestamp_rejected() {
        let mut req = request("Ada", "ada@example.com", None);
        req.requested_at = 0;
        assert_eq!(fields(booking_request(&req).unwrap_err()), vec!["scheduled_at"]);
    }

    #[test]
    fn emails_normalized_for_matching() {
        assert_eq!(normalize_email("  Ada@Example.COM "), "ada@example.com");
    }

    #[test]
    fn timezone_and_duration() {
        assert_eq!(timezone("Europe/Paris").unwrap(), chrono_tz::Europe::Paris);
        assert!(timezone("Mars/Olympus").is_err());
        assert!(duration(0).is_err());
        assert!(duration(30).is_ok());
        assert!(duration(MAX_DURATION_MINUTES + 1).is_err());
    }

    #[test]
    fn rule_window_checks() {
        let t = |s| NaiveTime::parse_from_str(s, "%H:%M").unwrap();
        assert!(rule_window(1, t("09:00"), t("17:00"), None).is_ok());
        assert!(rule_window(7, t("09:00"), t("17:00"), None).is_err());
        assert!(rule_window(1, t("17:00"), t("09:00"), None).is_err());
        assert!(rule_window(1, t("09:00"), t("09:00"), None).is_err());
    }
}
