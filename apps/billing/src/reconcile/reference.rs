//! Decodes a payment record's embedded intent into a typed [`CreditIntent`].
//!
//! Two wire formats coexist:
//! - structured `metadata` keys (`account_ref`, `package_id`,
//!   `credits_amount`) — the preferred path for all new integrations;
//! - the legacy composite `external_reference`
//!   `"<account_ref>_<units>_<timestamp_ms>"`, kept for backward
//!   compatibility only. Account references may themselves contain `_`
//!   (email-shaped ids), so the legacy format is decoded by popping the last
//!   two tokens off the end, never by splitting from the front.
//!
//! A quantity of zero or less, or a non-numeric quantity token, is a hard
//! decode failure rather than a zero-credit no-op: silently succeeding with
//! no effect would mask upstream data corruption.

use super::types::{CreditIntent, PaymentRecord};

pub const METADATA_ACCOUNT_REF_KEY: &str = "account_ref";
pub const METADATA_PACKAGE_ID_KEY: &str = "package_id";
pub const METADATA_CREDITS_AMOUNT_KEY: &str = "credits_amount";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("payment carries no decodable credit intent")]
    Unparseable,
    #[error("account reference is missing")]
    MissingAccountRef,
    #[error("invalid {field}: {value:?}")]
    InvalidQuantity { field: &'static str, value: String },
}

/// Priority rule: structured metadata wins whenever both the package id and
/// the credits amount are present; only then is the legacy reference tried.
/// Metadata that is present but invalid fails hard instead of falling back.
pub fn decode(record: &PaymentRecord) -> Result<CreditIntent, DecodeError> {
    let package_id = trimmed_metadata(record, METADATA_PACKAGE_ID_KEY);
    let credits_amount = trimmed_metadata(record, METADATA_CREDITS_AMOUNT_KEY);
    if let (Some(package_id), Some(credits_amount)) = (package_id, credits_amount) {
        let account_ref = trimmed_metadata(record, METADATA_ACCOUNT_REF_KEY)
            .or_else(|| {
                let reference = record.external_reference.trim();
                (!reference.is_empty()).then_some(reference)
            })
            .ok_or(DecodeError::MissingAccountRef)?;
        let credits_amount = parse_positive_quantity("credits_amount", credits_amount)?;
        return Ok(CreditIntent::CreditsPurchase {
            account_ref: account_ref.to_string(),
            package_id: package_id.to_string(),
            credits_amount,
        });
    }

    let (account_ref, units_to_add) = decode_legacy_reference(&record.external_reference)?;
    Ok(CreditIntent::ReviewPackagePurchase {
        account_ref,
        units_to_add,
    })
}

/// Decodes `"<account_ref>_<units>_<timestamp_ms>"`. The trailing timestamp
/// is discarded; the unit count must be a positive integer; everything before
/// the final two `_` tokens is the account reference verbatim.
pub fn decode_legacy_reference(reference: &str) -> Result<(String, i64), DecodeError> {
    let mut tail = reference.trim().rsplitn(3, '_');
    let _timestamp = tail.next().ok_or(DecodeError::Unparseable)?;
    let units_token = tail.next().ok_or(DecodeError::Unparseable)?;
    let account_ref = tail.next().ok_or(DecodeError::Unparseable)?;
    if account_ref.is_empty() {
        return Err(DecodeError::Unparseable);
    }
    let units = parse_positive_quantity("unit count", units_token)?;
    Ok((account_ref.to_string(), units))
}

fn trimmed_metadata<'a>(record: &'a PaymentRecord, key: &str) -> Option<&'a str> {
    record
        .metadata
        .get(key)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
}

fn parse_positive_quantity(field: &'static str, token: &str) -> Result<i64, DecodeError> {
    let value = token
        .parse::<i64>()
        .map_err(|_| DecodeError::InvalidQuantity {
            field,
            value: token.to_string(),
        })?;
    if value <= 0 {
        return Err(DecodeError::InvalidQuantity {
            field,
            value: token.to_string(),
        });
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::super::types::{PaymentStatus, CreditIntent, PaymentRecord};
    use super::{DecodeError, decode, decode_legacy_reference};

    fn record(external_reference: &str, metadata: &[(&str, &str)]) -> PaymentRecord {
        PaymentRecord {
            id: "P1".to_string(),
            status: PaymentStatus::Approved,
            amount: 1500,
            external_reference: external_reference.to_string(),
            metadata: metadata
                .iter()
                .map(|(key, value)| (key.to_string(), value.to_string()))
                .collect::<HashMap<_, _>>(),
        }
    }

    #[test]
    fn decodes_structured_metadata_as_credits_purchase() {
        let record = record(
            "",
            &[
                ("account_ref", "u1"),
                ("package_id", "pkg_10"),
                ("credits_amount", "10"),
            ],
        );
        assert_eq!(
            decode(&record),
            Ok(CreditIntent::CreditsPurchase {
                account_ref: "u1".to_string(),
                package_id: "pkg_10".to_string(),
                credits_amount: 10,
            })
        );
    }

    #[test]
    fn metadata_takes_priority_over_a_valid_legacy_reference() {
        let record = record(
            "user42_5_1700000000000",
            &[
                ("account_ref", "u1"),
                ("package_id", "pkg_10"),
                ("credits_amount", "10"),
            ],
        );
        assert!(matches!(
            decode(&record),
            Ok(CreditIntent::CreditsPurchase { .. })
        ));
    }

    #[test]
    fn metadata_account_ref_falls_back_to_external_reference() {
        let record = record(
            "u9",
            &[("package_id", "pkg_5"), ("credits_amount", "5")],
        );
        assert_eq!(
            decode(&record),
            Ok(CreditIntent::CreditsPurchase {
                account_ref: "u9".to_string(),
                package_id: "pkg_5".to_string(),
                credits_amount: 5,
            })
        );
    }

    #[test]
    fn invalid_metadata_amount_fails_hard_instead_of_falling_back() {
        // The legacy reference here is perfectly valid; a present-but-broken
        // metadata amount must still fail rather than silently credit via the
        // fallback path.
        let record = record(
            "user42_5_1700000000000",
            &[("package_id", "pkg_10"), ("credits_amount", "0")],
        );
        assert_eq!(
            decode(&record),
            Err(DecodeError::InvalidQuantity {
                field: "credits_amount",
                value: "0".to_string(),
            })
        );
    }

    #[test]
    fn decodes_legacy_reference_into_review_package_purchase() {
        let record = record("user42_5_1700000000000", &[]);
        assert_eq!(
            decode(&record),
            Ok(CreditIntent::ReviewPackagePurchase {
                account_ref: "user42".to_string(),
                units_to_add: 5,
            })
        );
    }

    #[test]
    fn legacy_account_ref_keeps_embedded_underscores() {
        assert_eq!(
            decode_legacy_reference("a_b@example.com_3_1690000000000"),
            Ok(("a_b@example.com".to_string(), 3))
        );
        assert_eq!(
            decode_legacy_reference("one_two_three_7_1690000000000"),
            Ok(("one_two_three".to_string(), 7))
        );
    }

    #[test]
    fn legacy_reference_requires_three_tokens() {
        assert_eq!(
            decode_legacy_reference("user42"),
            Err(DecodeError::Unparseable)
        );
        assert_eq!(
            decode_legacy_reference("user42_5"),
            Err(DecodeError::Unparseable)
        );
        assert_eq!(decode_legacy_reference(""), Err(DecodeError::Unparseable));
    }

    #[test]
    fn legacy_reference_rejects_empty_account_ref() {
        assert_eq!(
            decode_legacy_reference("_5_1700000000000"),
            Err(DecodeError::Unparseable)
        );
    }

    #[test]
    fn legacy_reference_rejects_non_positive_or_non_numeric_units() {
        for reference in [
            "user42_0_1700000000000",
            "user42_-2_1700000000000",
            "user42_five_1700000000000",
        ] {
            assert!(
                matches!(
                    decode_legacy_reference(reference),
                    Err(DecodeError::InvalidQuantity { .. })
                ),
                "expected {reference:?} to be rejected"
            );
        }
    }

    #[test]
    fn record_with_neither_path_is_unparseable() {
        let record = record("", &[]);
        assert_eq!(decode(&record), Err(DecodeError::Unparseable));
    }
}
