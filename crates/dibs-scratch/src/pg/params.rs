//! Connection params passed to [`PgInstance::connect`](super::PgInstance).
//!
//! Params are `key=value` pairs joined by `&`, e.g.
//! `statement_timeout=5000&lock_timeout=1000`. Each pair becomes a runtime
//! setting of every session in the pool (`-c key=value`).

use crate::error::InstanceError;

/// Splits a params string into `(key, value)` pairs. Empty input yields no
/// pairs.
pub(crate) fn parse_params(params: &str) -> Result<Vec<(&str, &str)>, InstanceError> {
    let invalid = |reason: &str| InstanceError::InvalidParams {
        params: params.to_owned(),
        reason: reason.to_owned(),
    };

    params
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| invalid(&format!("expected key=value, got {pair:?}")))?;
            if key.is_empty() {
                return Err(invalid("empty key"));
            }
            if !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.') {
                return Err(invalid(&format!("invalid setting name {key:?}")));
            }
            Ok((key, value))
        })
        .collect()
}

/// Builds the libpq `options` string: `search_path` first, then each param.
/// The schema is quoted so its case survives.
pub(crate) fn session_options(schema: &str, params: &[(&str, &str)]) -> String {
    let mut options = format!("-c search_path={}", escape_option(&super::quote_ident(schema)));
    for (key, value) in params {
        options.push_str(&format!(" -c {key}={}", escape_option(value)));
    }
    options
}

// Spaces and backslashes are significant in the options string.
fn escape_option(value: &str) -> String {
    value.replace('\\', "\\\\").replace(' ', "\\ ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_empty_params() {
        assert!(parse_params("").unwrap().is_empty());
        assert!(parse_params("&&").unwrap().is_empty());
    }

    #[test]
    fn test_pairs() {
        assert_eq!(
            parse_params("statement_timeout=5000&lock_timeout=1000").unwrap(),
            vec![("statement_timeout", "5000"), ("lock_timeout", "1000")]
        );
        assert_eq!(
            parse_params("application_name=").unwrap(),
            vec![("application_name", "")]
        );
    }

    #[test]
    fn test_malformed() {
        let err = parse_params("statement_timeout").unwrap_err();
        insta::assert_snapshot!(
            err.to_string(),
            @r#"invalid connection params "statement_timeout": expected key=value, got "statement_timeout""#
        );
        assert!(parse_params("=5").is_err());
        assert!(parse_params("a b=5").is_err());
    }

    #[test]
    fn test_session_options() {
        assert_eq!(
            session_options("_dibs_tmp", &[("statement_timeout", "5000")]),
            r#"-c search_path="_dibs_tmp" -c statement_timeout=5000"#
        );
        assert_eq!(
            session_options("my schema", &[]),
            r#"-c search_path="my\ schema""#
        );
    }

    #[test]
    fn test_session_options_keeps_case() {
        assert_eq!(
            session_options("Tmp_Mixed", &[]),
            r#"-c search_path="Tmp_Mixed""#
        );
        assert_eq!(
            session_options("we\"ird", &[]),
            r#"-c search_path="we""ird""#
        );
    }

    proptest! {
        #[test]
        fn prop_well_formed_params_parse(
            pairs in proptest::collection::vec(("[a-z_]{1,12}", "[a-zA-Z0-9]{0,8}"), 0..6)
        ) {
            let joined = pairs
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join("&");
            let parsed = parse_params(&joined).unwrap();
            prop_assert_eq!(parsed.len(), pairs.len());
            for ((k, v), (pk, pv)) in pairs.iter().zip(parsed) {
                prop_assert_eq!(k.as_str(), pk);
                prop_assert_eq!(v.as_str(), pv);
            }
        }
    }
}
