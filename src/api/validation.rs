//! Input validation for API requests.
//!
//! Each function returns a plain message; handlers collect them with
//! `ValidationErrorBuilder` from the `error` module so that nothing is
//! mutated when any field is bad.

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    /// Pragmatic email check: one `@`, a dotted domain, no whitespace
    static ref EMAIL_REGEX: Regex = Regex::new(
        r"^[A-Za-z0-9.!#$%&'*+/=?^_`{|}~-]+@[A-Za-z0-9]([A-Za-z0-9-]*[A-Za-z0-9])?(\.[A-Za-z0-9]([A-Za-z0-9-]*[A-Za-z0-9])?)+$"
    ).unwrap();

    /// Letters (any script), spaces, apostrophes, dots and dashes
    static ref NAME_REGEX: Regex = Regex::new(r"^[\p{L}][\p{L} .'-]*$").unwrap();

    static ref CODE_REGEX: Regex = Regex::new(r"^\d{6}$").unwrap();
}

/// Validate an email address
pub fn validate_email(email: &str) -> Result<(), String> {
    let email = email.trim();
    if email.is_empty() {
        return Err("Email is required".to_string());
    }

    if email.len() > 254 {
        return Err("Email is too long (max 254 characters)".to_string());
    }

    if !EMAIL_REGEX.is_match(email) {
        return Err("Invalid email format".to_string());
    }

    Ok(())
}

/// Validate a required person name
pub fn validate_name(name: &str, label: &str) -> Result<(), String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("{} is required", label));
    }

    if name.chars().count() > 100 {
        return Err(format!("{} is too long (max 100 characters)", label));
    }

    if !NAME_REGEX.is_match(name) {
        return Err(format!("{} contains invalid characters", label));
    }

    Ok(())
}

/// Validate an optional person name (middle name)
pub fn validate_optional_name(name: &Option<String>, label: &str) -> Result<(), String> {
    match name.as_deref().map(str::trim) {
        None | Some("") => Ok(()),
        Some(n) => validate_name(n, label),
    }
}

/// Presence and upper bound only; the minimum length is a lifecycle rule
pub fn validate_password_present(password: &str) -> Result<(), String> {
    if password.is_empty() {
        return Err("Password is required".to_string());
    }

    if password.len() > 128 {
        return Err("Password is too long (max 128 characters)".to_string());
    }

    Ok(())
}

/// Validate a six-digit one-time code
pub fn validate_code(code: &str) -> Result<(), String> {
    if code.trim().is_empty() {
        return Err("Code is required".to_string());
    }

    if !CODE_REGEX.is_match(code.trim()) {
        return Err("Code must be 6 digits".to_string());
    }

    Ok(())
}

/// Validate a non-empty identifier
pub fn validate_id(id: &str, field_name: &str) -> Result<(), String> {
    if id.trim().is_empty() {
        return Err(format!("{} is required", field_name));
    }

    if id.len() > 128 {
        return Err(format!("Invalid {} format", field_name));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_email() {
        assert!(validate_email("a@x.com").is_ok());
        assert!(validate_email("  First.Last+tag@dept.school.edu ").is_ok());

        assert!(validate_email("").is_err());
        assert!(validate_email("no-at-sign").is_err());
        assert!(validate_email("a@localhost").is_err());
        assert!(validate_email("a b@x.com").is_err());
        assert!(validate_email("a@-x.com").is_err());
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("Ada", "First name").is_ok());
        assert!(validate_name("O'Neil-Smith", "Last name").is_ok());
        assert!(validate_name("José María", "First name").is_ok());

        assert_eq!(
            validate_name("  ", "First name"),
            Err("First name is required".to_string())
        );
        assert!(validate_name("<script>", "First name").is_err());
        assert!(validate_name(&"a".repeat(101), "First name").is_err());
    }

    #[test]
    fn test_validate_optional_name() {
        assert!(validate_optional_name(&None, "Middle name").is_ok());
        assert!(validate_optional_name(&Some(String::new()), "Middle name").is_ok());
        assert!(validate_optional_name(&Some("Byron".to_string()), "Middle name").is_ok());
        assert!(validate_optional_name(&Some("1234".to_string()), "Middle name").is_err());
    }

    #[test]
    fn test_validate_password_present() {
        assert!(validate_password_present("abc").is_ok());
        assert!(validate_password_present("").is_err());
        assert!(validate_password_present(&"x".repeat(129)).is_err());
    }

    #[test]
    fn test_validate_code() {
        assert!(validate_code("012345").is_ok());
        assert!(validate_code(" 012345 ").is_ok());
        assert!(validate_code("12345").is_err());
        assert!(validate_code("abcdef").is_err());
        assert!(validate_code("").is_err());
    }

    #[test]
    fn test_validate_id() {
        assert!(validate_id("550e8400-e29b-41d4-a716-446655440000", "User ID").is_ok());
        assert!(validate_id("legacy-17", "User ID").is_ok());
        assert!(validate_id("", "User ID").is_err());
    }
}
