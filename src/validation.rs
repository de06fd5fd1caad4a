use crate::error::AppError;
use axum::http::StatusCode;
use lettre::Address;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Strength {
    Weak,
    Medium,
    Strong,
}

#[derive(Debug, Clone, Serialize)]
pub struct PasswordReport {
    pub is_valid: bool,
    pub errors: Vec<&'static str>,
    pub strength: Strength,
    pub score: u8,
}

const SPECIALS: &str = "!@#$%^&*()_+-=[]{};':\"\\|,.<>/?";
const COMMON_SEQUENCES: [&str; 6] = ["123456", "654321", "abcdef", "qwerty", "password", "admin"];

fn has_common_pattern(password: &str) -> bool {
    let mut chars = password.chars();
    let all_same = match chars.next() {
        Some(first) => password.chars().count() > 1 && chars.all(|c| c == first),
        None => false,
    };
    let lower = password.to_lowercase();

    all_same
        || COMMON_SEQUENCES.iter().any(|seq| lower.contains(seq))
        || (!password.is_empty() && password.chars().all(|c| c.is_ascii_alphabetic()))
        || (!password.is_empty() && password.chars().all(|c| c.is_ascii_digit()))
}

pub fn password_strength(password: &str) -> PasswordReport {
    let mut errors = Vec::new();
    let mut score: u8 = 0;
    let len = password.chars().count();

    if len < 8 {
        errors.push("Password must be at least 8 characters long");
    } else {
        score += 1;
    }
    if len >= 12 {
        score += 1;
    }

    let checks: [(fn(char) -> bool, &'static str); 4] = [
        (
            |c| c.is_ascii_uppercase(),
            "Password must contain at least one uppercase letter",
        ),
        (
            |c| c.is_ascii_lowercase(),
            "Password must contain at least one lowercase letter",
        ),
        (
            |c| c.is_ascii_digit(),
            "Password must contain at least one number",
        ),
        (
            |c| SPECIALS.contains(c),
            "Password must contain at least one special character (!@#$%^&*()_+-=[]{}|;:,.<>?)",
        ),
    ];
    for (check, message) in checks {
        if password.chars().any(check) {
            score += 1;
        } else {
            errors.push(message);
        }
    }

    if has_common_pattern(password) {
        errors.push("Password contains common patterns or sequences");
        score = score.saturating_sub(1);
    }

    let strength = match score {
        0..=2 => Strength::Weak,
        3..=4 => Strength::Medium,
        _ => Strength::Strong,
    };

    PasswordReport {
        is_valid: errors.is_empty(),
        errors,
        strength,
        score,
    }
}

/// Parses an address the way the mailer will, so anything accepted here
/// can be mailed later.
pub fn parse_email(email: &str) -> Result<Address, AppError> {
    email
        .parse::<Address>()
        .map_err(|_| AppError::from(StatusCode::BAD_REQUEST, "invalid email address"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strong_password() {
        let report = password_strength("Zenith#Club2025");
        assert!(report.is_valid, "{:?}", report.errors);
        assert_eq!(report.score, 6);
        assert_eq!(report.strength, Strength::Strong);
    }

    #[test]
    fn short_password_lists_every_problem() {
        let report = password_strength("abc");
        assert!(!report.is_valid);
        assert!(report
            .errors
            .contains(&"Password must be at least 8 characters long"));
        assert!(report
            .errors
            .contains(&"Password must contain at least one number"));
        // letters only
        assert!(report
            .errors
            .contains(&"Password contains common patterns or sequences"));
        assert_eq!(report.strength, Strength::Weak);
    }

    #[test]
    fn common_sequences_cost_a_point() {
        let report = password_strength("Password#1");
        assert!(!report.is_valid);
        // length, upper, lower, digit, special, minus one
        assert_eq!(report.score, 4);
        assert_eq!(report.strength, Strength::Medium);
    }

    #[test]
    fn email_shapes() {
        assert!(parse_email("student.one@stvincentngp.edu.in").is_ok());
        assert!(parse_email("a+b@x.io").is_ok());
        assert!(parse_email("ivan@example.xn--p1ai").is_ok());

        for bad in [
            "no-at-sign.com",
            "@college.edu",
            "a..b@college.edu",
            ".a@college.edu",
            "a.@college.edu",
            "a@-x-.edu",
        ] {
            let err = parse_email(bad).unwrap_err();
            assert_eq!(err.status(), StatusCode::BAD_REQUEST, "{bad}");
        }
    }
}
