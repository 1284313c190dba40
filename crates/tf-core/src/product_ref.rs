//! Validation of `InputProductReference.Reference` naming conventions.
//!
//! The server accepts references that look like Copernicus product names
//! (Sentinel-1/2/3/5P family codes); anything else is presumed to be a
//! data-source-specific free-form query and is only validated when a
//! `data_source_name` isn't given. Which family a reference must match is
//! determined by the workflow's declared `input_product_type`, not guessed
//! from the reference alone: a Sentinel-1 reference submitted against a
//! Sentinel-2 workflow is rejected even though it is itself well-formed.

use regex::Regex;
use std::sync::OnceLock;
use tf_error::{ErrorCode, TfError};

fn s1_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^S1[AB_]_[A-Z0-9_]+$").expect("valid regex"))
}

fn s2_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^S2[AB_]_MSIL(1C|2A)[A-Z0-9_]*$").expect("valid regex"))
}

fn s3_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^S3[AB_]_[A-Z0-9_]+$").expect("valid regex"))
}

fn s5p_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^S5P_(OFFL|OPER|NRTI)_[A-Z0-9_]+$").expect("valid regex"))
}

/// Select the regex family a reference must match for the given workflow
/// `input_product_type`, keyed by its mission prefix (`S1`/`S2`/`S3`/`S5P`).
fn pattern_for_product_type(input_product_type: &str) -> Option<&'static Regex> {
    if input_product_type.starts_with("S5P") {
        Some(s5p_pattern())
    } else if input_product_type.starts_with("S1") {
        Some(s1_pattern())
    } else if input_product_type.starts_with("S2") {
        Some(s2_pattern())
    } else if input_product_type.starts_with("S3") {
        Some(s3_pattern())
    } else {
        None
    }
}

/// Validate that a bare product reference (no `data_source_name`) looks like
/// a recognised Sentinel product name for `input_product_type`'s mission
/// family.
///
/// References accompanied by a `data_source_name` skip this check: they're
/// resolved by that data source's own query syntax, not by name matching.
pub fn validate_product_reference_name(reference: &str, input_product_type: &str) -> Result<(), TfError> {
    let matches = match pattern_for_product_type(input_product_type) {
        Some(pattern) => pattern.is_match(reference),
        None => false,
    };
    if matches {
        Ok(())
    } else {
        Err(TfError::new(
            ErrorCode::ProductReferenceInvalid,
            format!(
                "'{reference}' does not match the product naming convention for '{input_product_type}'"
            ),
        )
        .with_context("reference", reference.to_string())
        .with_context("input_product_type", input_product_type.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinel1_name_accepted_for_s1_workflow() {
        assert!(validate_product_reference_name("S1A_IW_GRDH_1SDV_20260101T000000", "S1_GRD").is_ok());
    }

    #[test]
    fn sentinel2_name_accepted_for_s2_workflow() {
        assert!(validate_product_reference_name("S2A_MSIL1C_20260101T000000_N0500", "S2MSIL1C").is_ok());
    }

    #[test]
    fn sentinel3_name_accepted_for_s3_workflow() {
        assert!(validate_product_reference_name("S3A_OL_1_EFR____20260101T000000", "S3_OL_1").is_ok());
    }

    #[test]
    fn sentinel5p_name_accepted_for_s5p_workflow() {
        assert!(
            validate_product_reference_name("S5P_OFFL_L2__NO2____20260101T000000", "S5P_L2__NO2").is_ok()
        );
    }

    #[test]
    fn garbage_name_rejected() {
        let err = validate_product_reference_name("not-a-product-name", "S2MSIL1C").unwrap_err();
        assert_eq!(err.code, ErrorCode::ProductReferenceInvalid);
    }

    #[test]
    fn lowercase_family_code_rejected() {
        assert!(validate_product_reference_name("s2a_msil1c_20260101", "S2MSIL1C").is_err());
    }

    #[test]
    fn sentinel1_name_rejected_against_s2_workflow() {
        // Concrete scenario: a well-formed S1 reference submitted against a
        // workflow declared for S2 input must fail, not fall through to a
        // generic "looks like some Sentinel product" check.
        let err =
            validate_product_reference_name("S1A_IW_GRDH_1SDV_20260101T000000", "S2MSIL1C").unwrap_err();
        assert_eq!(err.code, ErrorCode::ProductReferenceInvalid);
    }

    #[test]
    fn unrecognized_product_type_family_rejects_everything() {
        assert!(validate_product_reference_name("S2A_MSIL1C_20260101T000000", "UNKNOWN").is_err());
    }
}
