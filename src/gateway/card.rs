use serde::{Deserialize, Serialize};
use std::fmt;
use utoipa::ToSchema;

/// Card network, inferred from the leading digit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema, strum::Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum CardBrand {
    Visa,
    Mastercard,
    Amex,
    Unknown,
}

pub fn detect_card_brand(number: &str) -> CardBrand {
    match number.trim_start().chars().next() {
        Some('4') => CardBrand::Visa,
        Some('5') | Some('2') => CardBrand::Mastercard,
        Some('3') => CardBrand::Amex,
        _ => CardBrand::Unknown,
    }
}

/// Raw card fields. Lives only for the duration of a tokenization call and
/// is never persisted or logged.
#[derive(Clone, Deserialize)]
pub struct CardData {
    /// Digits only
    pub number: String,
    pub cvc: String,
    /// Two digits, "01".."12"
    pub exp_month: String,
    /// Two digits, e.g. "29"
    pub exp_year: String,
    pub card_holder: String,
}

impl fmt::Debug for CardData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CardData")
            .field("number", &format_args!("**** {}", self.last_four()))
            .field("cvc", &"***")
            .field("exp_month", &self.exp_month)
            .field("exp_year", &self.exp_year)
            .field("card_holder", &self.card_holder)
            .finish()
    }
}

impl CardData {
    pub fn new(
        number: &str,
        cvc: &str,
        exp_month: &str,
        exp_year: &str,
        card_holder: &str,
    ) -> Self {
        Self {
            number: number.chars().filter(char::is_ascii_digit).collect(),
            cvc: cvc.trim().to_string(),
            exp_month: exp_month.trim().to_string(),
            exp_year: exp_year.trim().to_string(),
            card_holder: card_holder.trim().to_string(),
        }
    }

    pub fn last_four(&self) -> &str {
        let len = self.number.len();
        &self.number[len.saturating_sub(4)..]
    }

    /// Issuer identification number (first six digits).
    pub fn bin(&self) -> &str {
        &self.number[..self.number.len().min(6)]
    }

    pub fn brand(&self) -> CardBrand {
        detect_card_brand(&self.number)
    }

    /// Audit-safe view of the card.
    pub fn summary(&self) -> CardSummary {
        CardSummary {
            brand: self.brand(),
            last_four: self.last_four().to_string(),
            exp_month: self.exp_month.clone(),
            exp_year: self.exp_year.clone(),
            token: None,
        }
    }
}

/// What is retained about a card once the charge attempt is over.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct CardSummary {
    pub brand: CardBrand,
    #[schema(example = "4242")]
    pub last_four: String,
    #[schema(example = "08")]
    pub exp_month: String,
    #[schema(example = "29")]
    pub exp_year: String,
    /// Single-use payment token, when the processor reports it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl CardSummary {
    pub fn with_token(mut self, token: Option<&str>) -> Self {
        self.token = token.map(str::to_string);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("4242424242424242", CardBrand::Visa)]
    #[case("5555555555554444", CardBrand::Mastercard)]
    #[case("2223003122003222", CardBrand::Mastercard)]
    #[case("378282246310005", CardBrand::Amex)]
    #[case("6011111111111117", CardBrand::Unknown)]
    #[case("", CardBrand::Unknown)]
    fn detects_brand_from_leading_digit(#[case] number: &str, #[case] expected: CardBrand) {
        assert_eq!(detect_card_brand(number), expected);
    }

    #[test]
    fn new_strips_separators_from_number() {
        let card = CardData::new("4242 4242-4242 4242", "123", "08", "29", " Ana Gómez ");
        assert_eq!(card.number, "4242424242424242");
        assert_eq!(card.card_holder, "Ana Gómez");
        assert_eq!(card.last_four(), "4242");
        assert_eq!(card.bin(), "424242");
    }

    #[test]
    fn debug_output_redacts_number_and_cvc() {
        let card = CardData::new("4111111111111112", "987", "12", "30", "Test Holder");
        let rendered = format!("{:?}", card);
        assert!(!rendered.contains("4111111111111112"));
        assert!(!rendered.contains("987"));
        assert!(rendered.contains("**** 1112"));
    }

    #[test]
    fn summary_keeps_only_audit_fields() {
        let card = CardData::new("5555555555554444", "321", "01", "28", "Holder");
        let summary = card.summary().with_token(Some("tok_test_1"));
        let stored = serde_json::to_value(&summary).unwrap();
        assert_eq!(
            stored,
            serde_json::json!({
                "brand": "MASTERCARD",
                "last_four": "4444",
                "exp_month": "01",
                "exp_year": "28",
                "token": "tok_test_1"
            })
        );
    }
}
