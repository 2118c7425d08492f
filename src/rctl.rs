//! Resource limit compilation for rctl(8).
//!
//! A `Rctl` block in the job file carries human quantities (`512M`, `2g`,
//! `0x400`). [`compile_limits`] parses them with `expand_number(3)`
//! semantics and renders the `:<resource>:<action>=<amount>[/<per>]` suffix
//! of an rctl rule. The jail subject (`jail:<name>`) is prepended by
//! [`crate::jail::JailControl::apply_limits`].

use crate::error::{Error, Result};
use crate::spec::{RctlOpts, RctlResource};
use std::collections::BTreeMap;
use std::fmt;

/// One compiled resource limit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceLimit {
    pub resource: RctlResource,
    pub action: String,
    pub amount: u64,
    pub per: Option<String>,
}

impl ResourceLimit {
    /// Rule string without the subject, e.g. `:memoryuse:deny=536870912`.
    pub fn rule(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ResourceLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, ":{}:{}={}", self.resource, self.action, self.amount)?;
        if let Some(per) = &self.per {
            write!(f, "/{}", per)?;
        }
        Ok(())
    }
}

/// Compiled limits of one jail, in resource order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LimitRules {
    limits: Vec<ResourceLimit>,
}

impl LimitRules {
    pub fn iter(&self) -> impl Iterator<Item = &ResourceLimit> {
        self.limits.iter()
    }

    pub fn len(&self) -> usize {
        self.limits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.limits.is_empty()
    }

    /// Rule strings in application order.
    pub fn rules(&self) -> Vec<String> {
        self.limits.iter().map(ResourceLimit::rule).collect()
    }

    /// Mapping from rule string to numeric amount.
    pub fn to_map(&self) -> BTreeMap<String, u64> {
        self.limits.iter().map(|l| (l.rule(), l.amount)).collect()
    }
}

/// Compiles the `Rctl` block of a job into rule strings.
///
/// Limits with an empty or zero amount are skipped.
///
/// # Errors
///
/// - [`Error::InvalidLimitAmount`] if an amount does not parse
/// - [`Error::InvalidLimitAction`] if a limit has an amount but no action
pub fn compile_limits(rctl: &BTreeMap<RctlResource, RctlOpts>) -> Result<LimitRules> {
    let mut limits = Vec::new();

    for (resource, opts) in rctl {
        let amount = opts.amount.trim();
        if amount.is_empty() {
            continue;
        }
        let amount =
            expand_number(amount).ok_or_else(|| Error::InvalidLimitAmount(resource.to_string()))?;
        if amount == 0 {
            continue;
        }
        let action = opts.action.trim();
        if action.is_empty() {
            return Err(Error::InvalidLimitAction(resource.to_string()));
        }
        let per = opts.per.trim();

        limits.push(ResourceLimit {
            resource: *resource,
            action: action.to_string(),
            amount,
            per: (!per.is_empty()).then(|| per.to_string()),
        });
    }

    Ok(LimitRules { limits })
}

/// Parses a quantity the way `expand_number(3)` does.
///
/// Accepts a decimal, `0x` hexadecimal or `0`-prefixed octal integer followed
/// by at most one unit suffix (`B`, `K`, `M`, `G`, `T`, `P`, `E`, any case),
/// each a power of 1024. A unit other than `B` may itself be followed by one
/// `B`, so `512MB` equals `512M`. Returns `None` on trailing garbage or
/// overflow.
pub fn expand_number(input: &str) -> Option<u64> {
    let s = input.trim_start();
    let s = s.strip_prefix('+').unwrap_or(s);

    let hex = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .filter(|rest| rest.starts_with(|c: char| c.is_ascii_hexdigit()));

    let (radix, digits) = match hex {
        Some(rest) => (16, rest),
        // The leading zero itself counts as a digit, so "0" and "0k" are valid.
        None if s.starts_with('0') => (8, &s[1..]),
        None => (10, s),
    };

    let end = digits
        .find(|c: char| !c.is_digit(radix))
        .unwrap_or(digits.len());
    let (number, suffix) = digits.split_at(end);
    if radix == 10 && number.is_empty() {
        return None;
    }

    let mut value: u64 = 0;
    for c in number.chars() {
        value = value
            .checked_mul(u64::from(radix))?
            .checked_add(u64::from(c.to_digit(radix)?))?;
    }

    let suffix = suffix.to_ascii_lowercase();
    let unit = match suffix.strip_suffix('b') {
        Some(unit) if !unit.is_empty() && unit != "b" => unit,
        _ => suffix.as_str(),
    };
    let shift = match unit {
        "" | "b" => 0,
        "k" => 10,
        "m" => 20,
        "g" => 30,
        "t" => 40,
        "p" => 50,
        "e" => 60,
        _ => return None,
    };

    value.checked_mul(1u64 << shift)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(action: &str, amount: &str, per: &str) -> RctlOpts {
        RctlOpts {
            action: action.to_string(),
            amount: amount.to_string(),
            per: per.to_string(),
        }
    }

    #[test]
    fn test_expand_number_plain() {
        assert_eq!(expand_number("0"), Some(0));
        assert_eq!(expand_number("42"), Some(42));
        assert_eq!(expand_number("+7"), Some(7));
        assert_eq!(expand_number("  12"), Some(12));
    }

    #[test]
    fn test_expand_number_suffixes() {
        assert_eq!(expand_number("1k"), Some(1024));
        assert_eq!(expand_number("1K"), Some(1024));
        assert_eq!(expand_number("512M"), Some(512 * 1024 * 1024));
        assert_eq!(expand_number("2g"), Some(2 << 30));
        assert_eq!(expand_number("1T"), Some(1 << 40));
        assert_eq!(expand_number("1p"), Some(1 << 50));
        assert_eq!(expand_number("1E"), Some(1 << 60));
        assert_eq!(expand_number("100b"), Some(100));
    }

    #[test]
    fn test_expand_number_trailing_byte_unit() {
        assert_eq!(expand_number("512MB"), Some(512 * 1024 * 1024));
        assert_eq!(expand_number("12mb"), Some(12 << 20));
        assert_eq!(expand_number("1Kb"), Some(1024));
        assert_eq!(expand_number("2GB"), Some(2 << 30));
        assert_eq!(expand_number("0x1kB"), Some(1024));
        assert_eq!(expand_number("100BB"), None);
        assert_eq!(expand_number("1MBB"), None);
    }

    #[test]
    fn test_expand_number_prefixes() {
        assert_eq!(expand_number("0x10"), Some(16));
        assert_eq!(expand_number("0X1k"), Some(1024));
        assert_eq!(expand_number("010"), Some(8));
        assert_eq!(expand_number("0k"), Some(0));
    }

    #[test]
    fn test_expand_number_rejects_garbage() {
        assert_eq!(expand_number(""), None);
        assert_eq!(expand_number("M"), None);
        assert_eq!(expand_number("12MK"), None);
        assert_eq!(expand_number("1.5G"), None);
        assert_eq!(expand_number("-1"), None);
        assert_eq!(expand_number("08"), None);
        assert_eq!(expand_number("0x"), None);
        assert_eq!(expand_number("12 "), None);
    }

    #[test]
    fn test_expand_number_overflow() {
        assert_eq!(expand_number("18446744073709551615"), Some(u64::MAX));
        assert_eq!(expand_number("18446744073709551616"), None);
        assert_eq!(expand_number("16E"), None);
        assert_eq!(expand_number("15E"), Some(15 << 60));
    }

    #[test]
    fn test_rule_format() {
        let mut rctl = BTreeMap::new();
        rctl.insert(RctlResource::Memoryuse, opts("deny", "512M", ""));
        rctl.insert(RctlResource::Readbps, opts("throttle", "1M", "s"));

        let rules = compile_limits(&rctl).unwrap();
        assert_eq!(
            rules.rules(),
            vec![":memoryuse:deny=536870912", ":readbps:throttle=1048576/s"]
        );
        assert_eq!(rules.to_map()[":memoryuse:deny=536870912"], 536870912);
    }

    #[test]
    fn test_empty_and_zero_omitted() {
        let mut rctl = BTreeMap::new();
        rctl.insert(RctlResource::Cputime, opts("deny", "", ""));
        rctl.insert(RctlResource::Maxproc, opts("deny", "0", ""));
        rctl.insert(RctlResource::Nthr, opts("", "", ""));
        assert!(compile_limits(&rctl).unwrap().is_empty());
    }

    #[test]
    fn test_invalid_amount_names_category() {
        let mut rctl = BTreeMap::new();
        rctl.insert(RctlResource::Openfiles, opts("deny", "lots", ""));
        let err = compile_limits(&rctl).unwrap_err();
        assert!(matches!(err, Error::InvalidLimitAmount(ref c) if c == "openfiles"));
        assert_eq!(err.to_string(), "amount for openfiles is invalid");
    }

    #[test]
    fn test_missing_action() {
        let mut rctl = BTreeMap::new();
        rctl.insert(RctlResource::Pcpu, opts("", "50", ""));
        let err = compile_limits(&rctl).unwrap_err();
        assert!(matches!(err, Error::InvalidLimitAction(ref c) if c == "pcpu"));
    }

    #[test]
    fn test_rules_follow_resource_order() {
        let mut rctl = BTreeMap::new();
        rctl.insert(RctlResource::Writeiops, opts("throttle", "100", "s"));
        rctl.insert(RctlResource::Cputime, opts("sigterm", "3600", ""));
        let rules = compile_limits(&rctl).unwrap();
        let resources: Vec<_> = rules.iter().map(|l| l.resource).collect();
        assert_eq!(resources, vec![RctlResource::Cputime, RctlResource::Writeiops]);
    }
}
