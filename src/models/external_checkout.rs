use serde::{Deserialize, Serialize};

/// Tax id captured before the buyer leaves for a redirect gateway.
///
/// Proof of intent only: it lets a later manual confirmation find the right
/// user and course, and never grants access by itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalCheckoutRecord {
    pub user_id: String,
    pub course_id: String,
    /// Normalized CPF (11 digits, no punctuation)
    pub tax_id: String,
    pub captured_at: i64,
}

#[derive(Debug, Deserialize)]
pub struct SaveCpfRequest {
    pub course_id: String,
    pub cpf: String,
}

fn check_digit(digits: &[u32], first_weight: u32) -> u32 {
    let sum: u32 = digits
        .iter()
        .zip((2..=first_weight).rev())
        .map(|(d, w)| d * w)
        .sum();
    match (sum * 10) % 11 {
        10 => 0,
        r => r,
    }
}

/// Strip formatting from a CPF and validate both check digits.
///
/// Accepts `529.982.247-25`, `52998224725` and whitespace-padded variants.
/// Sequences of one repeated digit pass the checksum but are not issued, so
/// they are rejected.
pub fn normalize_cpf(raw: &str) -> Option<String> {
    let cleaned: String = raw
        .chars()
        .filter(|c| !matches!(c, '.' | '-' | ' '))
        .collect();

    if cleaned.len() != 11 || !cleaned.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }

    let digits: Vec<u32> = cleaned.chars().filter_map(|c| c.to_digit(10)).collect();
    if digits.iter().all(|d| *d == digits[0]) {
        return None;
    }

    if check_digit(&digits[..9], 10) != digits[9] || check_digit(&digits[..10], 11) != digits[10] {
        return None;
    }

    Some(cleaned)
}
