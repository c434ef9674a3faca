//! Device filter rules.
//!
//! A filter is an ordered list of rules matched against a device's class
//! (and its interfaces' classes), vendor id, product id and bcd version.
//! The first matching rule decides; with no match the default policy from
//! the check flags applies.

use std::fmt::{Display, Write as _};

/// A single filter rule. `-1` fields are wildcards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rule {
    pub device_class: i32,
    pub vendor_id: i32,
    pub product_id: i32,
    pub device_version_bcd: i32,
    pub allow: bool,
}

/// Class/subclass/protocol triple of one interface, for matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceClass {
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterError {
    /// A separator set was empty.
    EmptySeparator,
    /// A rule did not have exactly five valid integer tokens.
    MalformedRule,
    /// A field was outside its allowed range.
    FieldOutOfRange,
}

impl Display for FilterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FilterError::EmptySeparator => write!(f, "separator set is empty"),
            FilterError::MalformedRule => write!(f, "malformed filter rule"),
            FilterError::FieldOutOfRange => write!(f, "filter rule field out of range"),
        }
    }
}

impl std::error::Error for FilterError {}

/// Why a device was not allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// A rule matched and denies the device.
    RuleDenied,
    /// No rule matched and the default policy is deny.
    NoRuleMatched,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct CheckFlags {
    /// Allow devices no rule matches (default is deny).
    pub default_allow: bool,
    /// Do not skip non-boot HID interfaces of composite devices.
    pub dont_skip_non_boot_hid: bool,
}

/// Integer token in decimal, hex (`0x…`) or octal (`0…`), optionally signed.
fn parse_int(token: &str) -> Option<i64> {
    let (neg, rest) = match token.as_bytes().first()? {
        b'-' => (true, &token[1..]),
        b'+' => (false, &token[1..]),
        _ => (false, token),
    };
    let (digits, radix) = if let Some(hex) = rest.strip_prefix("0x").or(rest.strip_prefix("0X")) {
        (hex, 16)
    } else if rest.len() > 1 && rest.starts_with('0') {
        (&rest[1..], 8)
    } else {
        (rest, 10)
    };
    if digits.is_empty() {
        return None;
    }
    let v = i64::from_str_radix(digits, radix).ok()?;
    Some(if neg { -v } else { v })
}

/// Split on any character of `sep`, collapsing runs and ignoring leading and
/// trailing separators.
fn tokens<'a>(s: &'a str, sep: &'a str) -> impl Iterator<Item = &'a str> {
    s.split(move |c| sep.contains(c)).filter(|t| !t.is_empty())
}

/// Parse a filter string into rules.
///
/// Separator arguments are character *sets*: any character of `token_sep`
/// separates fields, any character of `rule_sep` separates rules. Both sets
/// must be non-empty. Empty rules (runs of rule separators) are ignored.
pub fn string_to_rules(
    filter: &str,
    token_sep: &str,
    rule_sep: &str,
) -> Result<Vec<Rule>, FilterError> {
    if token_sep.is_empty() || rule_sep.is_empty() {
        return Err(FilterError::EmptySeparator);
    }

    let mut rules = Vec::new();
    for rule_str in tokens(filter, rule_sep) {
        let mut fields = [0i64; 5];
        let mut n = 0;
        for token in tokens(rule_str, token_sep) {
            if n == 5 {
                return Err(FilterError::MalformedRule);
            }
            fields[n] = parse_int(token).ok_or(FilterError::MalformedRule)?;
            n += 1;
        }
        if n != 5 {
            return Err(FilterError::MalformedRule);
        }
        let rule = Rule {
            device_class: fields[0] as i32,
            vendor_id: fields[1] as i32,
            product_id: fields[2] as i32,
            device_version_bcd: fields[3] as i32,
            allow: fields[4] != 0,
        };
        verify(std::slice::from_ref(&rule))?;
        rules.push(rule);
    }
    Ok(rules)
}

/// Canonical string form: class as `0x%02x`, the 16-bit fields as `0x%04x`,
/// wildcards as `-1`, joined by the first character of each separator set.
pub fn rules_to_string(
    rules: &[Rule],
    token_sep: &str,
    rule_sep: &str,
) -> Result<String, FilterError> {
    verify(rules)?;
    let t = token_sep.chars().next().ok_or(FilterError::EmptySeparator)?;
    let r = rule_sep.chars().next().ok_or(FilterError::EmptySeparator)?;

    let mut out = String::new();
    for (i, rule) in rules.iter().enumerate() {
        if i > 0 {
            out.push(r);
        }
        let mut field = |v: i32, width: usize| {
            if v != -1 {
                let _ = write!(out, "0x{v:0width$x}");
            } else {
                out.push_str("-1");
            }
            out.push(t);
        };
        field(rule.device_class, 2);
        field(rule.vendor_id, 4);
        field(rule.product_id, 4);
        field(rule.device_version_bcd, 4);
        out.push(if rule.allow { '1' } else { '0' });
    }
    Ok(out)
}

/// Check rule field ranges.
pub fn verify(rules: &[Rule]) -> Result<(), FilterError> {
    for rule in rules {
        if rule.device_class < -1 || rule.device_class > 255 {
            return Err(FilterError::FieldOutOfRange);
        }
        for v in [rule.vendor_id, rule.product_id, rule.device_version_bcd] {
            if v < -1 || v > 65535 {
                return Err(FilterError::FieldOutOfRange);
            }
        }
    }
    Ok(())
}

fn check_one(
    rules: &[Rule],
    device_class: u8,
    vendor_id: u16,
    product_id: u16,
    device_version_bcd: u16,
    default_allow: bool,
) -> Result<(), Rejection> {
    for rule in rules {
        if (rule.device_class == -1 || rule.device_class == device_class as i32)
            && (rule.vendor_id == -1 || rule.vendor_id == vendor_id as i32)
            && (rule.product_id == -1 || rule.product_id == product_id as i32)
            && (rule.device_version_bcd == -1
                || rule.device_version_bcd == device_version_bcd as i32)
        {
            return if rule.allow {
                Ok(())
            } else {
                Err(Rejection::RuleDenied)
            };
        }
    }
    if default_allow {
        Ok(())
    } else {
        Err(Rejection::NoRuleMatched)
    }
}

/// Match a device against the rules.
///
/// The device class is tested first, skipping 0x00 ("see per-interface")
/// and 0xef ("miscellaneous"), then each interface class. Non-boot HID
/// interfaces (class 3, subclass 0, protocol 0) of composite devices are
/// skipped unless `dont_skip_non_boot_hid` is set; if that skips every
/// interface the check is re-run with skipping disabled so a composite HID
/// device cannot pass vacuously.
pub fn check(
    rules: &[Rule],
    device_class: u8,
    interfaces: &[InterfaceClass],
    vendor_id: u16,
    product_id: u16,
    device_version_bcd: u16,
    flags: CheckFlags,
) -> Result<(), CheckError> {
    verify(rules).map_err(CheckError::Invalid)?;

    if device_class != 0x00 && device_class != 0xef {
        check_one(
            rules,
            device_class,
            vendor_id,
            product_id,
            device_version_bcd,
            flags.default_allow,
        )
        .map_err(CheckError::Rejected)?;
    }

    let mut num_skipped = 0;
    for intf in interfaces {
        if !flags.dont_skip_non_boot_hid
            && interfaces.len() > 1
            && intf.class == 0x03
            && intf.subclass == 0x00
            && intf.protocol == 0x00
        {
            num_skipped += 1;
            continue;
        }
        check_one(
            rules,
            intf.class,
            vendor_id,
            product_id,
            device_version_bcd,
            flags.default_allow,
        )
        .map_err(CheckError::Rejected)?;
    }

    if !interfaces.is_empty() && num_skipped == interfaces.len() {
        return check(
            rules,
            device_class,
            interfaces,
            vendor_id,
            product_id,
            device_version_bcd,
            CheckFlags {
                dont_skip_non_boot_hid: true,
                ..flags
            },
        );
    }

    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckError {
    Invalid(FilterError),
    Rejected(Rejection),
}

impl Display for CheckError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CheckError::Invalid(e) => write!(f, "invalid filter rules: {e}"),
            CheckError::Rejected(Rejection::RuleDenied) => {
                write!(f, "device denied by filter rule")
            }
            CheckError::Rejected(Rejection::NoRuleMatched) => {
                write!(f, "device matched no filter rule")
            }
        }
    }
}

impl std::error::Error for CheckError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(s: &str) -> Vec<Rule> {
        string_to_rules(s, ",", "|").unwrap()
    }

    #[test]
    fn empty_filter() {
        assert_eq!(parse("").len(), 0);
        assert_eq!(parse("|||").len(), 0);
    }

    #[test]
    fn one_and_two_rules() {
        let rules = parse("0x03,-1,-1,-1,0");
        assert_eq!(
            rules,
            vec![Rule {
                device_class: 3,
                vendor_id: -1,
                product_id: -1,
                device_version_bcd: -1,
                allow: false,
            }]
        );
        assert_eq!(parse("0x03,-1,-1,-1,0|-1,-1,-1,-1,1").len(), 2);
    }

    #[test]
    fn separator_runs_collapse() {
        let canonical = "0x03,-1,-1,-1,0|-1,-1,-1,-1,1";
        for mangled in [
            "|0x03,-1,-1,-1,0|-1,-1,-1,-1,1|",
            "0x03,-1,-1,-1,0|||-1,-1,-1,-1,1",
            "||||0x03,-1,-1,-1,0|||-1,-1,-1,-1,1||||",
        ] {
            let rules = parse(mangled);
            assert_eq!(rules_to_string(&rules, ",", "|").unwrap(), canonical);
        }
    }

    #[test]
    fn multi_char_separator_sets() {
        let rules = string_to_rules("\t 0x03,-1;-1;-1,0\n\n", ",;", " \t\n").unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(
            rules_to_string(&rules, ",;", " \t\n").unwrap(),
            "0x03,-1,-1,-1,0"
        );

        let rules = string_to_rules("\n\t0x03;-1,-1,-1,0\n\n-1,-1,-1;-1;1", ",;", " \t\n").unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(
            rules_to_string(&rules, ",;", " \t\n").unwrap(),
            "0x03,-1,-1,-1,0 -1,-1,-1,-1,1"
        );
    }

    #[test]
    fn field_ranges() {
        assert_eq!(
            string_to_rules("0x100,-1,-1,-1,0", ",", "|"),
            Err(FilterError::FieldOutOfRange)
        );
        assert_eq!(
            string_to_rules("-2,-1,-1,-1,0", ",", "|"),
            Err(FilterError::FieldOutOfRange)
        );
        assert_eq!(
            string_to_rules("0x03,0x10000,-1,-1,0", ",", "|"),
            Err(FilterError::FieldOutOfRange)
        );
        assert_eq!(
            string_to_rules("0x03,-1,-1,0x10000,0", ",", "|"),
            Err(FilterError::FieldOutOfRange)
        );
    }

    #[test]
    fn malformed_rules() {
        assert_eq!(
            string_to_rules("0x03,-1,-1,-1", ",", "|"),
            Err(FilterError::MalformedRule)
        );
        assert_eq!(
            string_to_rules("0x03,-1,-1,-1,0,1", ",", "|"),
            Err(FilterError::MalformedRule)
        );
        assert_eq!(
            string_to_rules("0x03,zz,-1,-1,0", ",", "|"),
            Err(FilterError::MalformedRule)
        );
        assert_eq!(
            string_to_rules("0x03,-1,-1,-1,0", "", "|"),
            Err(FilterError::EmptySeparator)
        );
    }

    #[test]
    fn class_match_denies() {
        let rules = parse("0x03,-1,-1,-1,0");
        let r = check(&rules, 0x03, &[], 0x1234, 0x5678, 0x0100, CheckFlags::default());
        assert_eq!(r, Err(CheckError::Rejected(Rejection::RuleDenied)));

        // Class 8 matches nothing: decided by the default policy.
        let r = check(
            &rules,
            0x08,
            &[],
            0x1234,
            0x5678,
            0x0100,
            CheckFlags {
                default_allow: true,
                ..Default::default()
            },
        );
        assert_eq!(r, Ok(()));
        let r = check(&rules, 0x08, &[], 0x1234, 0x5678, 0x0100, CheckFlags::default());
        assert_eq!(r, Err(CheckError::Rejected(Rejection::NoRuleMatched)));
    }

    #[test]
    fn non_boot_hid_skip() {
        // Deny HID; device is composite with one non-boot HID interface and
        // one storage interface. HID is skipped, storage allowed.
        let rules = parse("0x03,-1,-1,-1,0|-1,-1,-1,-1,1");
        let intfs = [
            InterfaceClass {
                class: 0x03,
                subclass: 0,
                protocol: 0,
            },
            InterfaceClass {
                class: 0x08,
                subclass: 6,
                protocol: 80,
            },
        ];
        assert_eq!(
            check(&rules, 0x00, &intfs, 1, 2, 3, CheckFlags::default()),
            Ok(())
        );

        // With the skip override the HID interface is matched and denied.
        assert_eq!(
            check(
                &rules,
                0x00,
                &intfs,
                1,
                2,
                3,
                CheckFlags {
                    dont_skip_non_boot_hid: true,
                    ..Default::default()
                }
            ),
            Err(CheckError::Rejected(Rejection::RuleDenied))
        );
    }

    #[test]
    fn vacuous_pass_rerun() {
        // Every interface would be skipped: the check re-runs with skipping
        // off, so the deny rule fires anyway.
        let rules = parse("0x03,-1,-1,-1,0");
        let intfs = [
            InterfaceClass {
                class: 0x03,
                subclass: 0,
                protocol: 0,
            },
            InterfaceClass {
                class: 0x03,
                subclass: 0,
                protocol: 0,
            },
        ];
        assert_eq!(
            check(
                &rules,
                0x00,
                &intfs,
                1,
                2,
                3,
                CheckFlags {
                    default_allow: true,
                    ..Default::default()
                }
            ),
            Err(CheckError::Rejected(Rejection::RuleDenied))
        );
    }

    #[test]
    fn boot_hid_not_skipped() {
        // Boot keyboard (subclass 1) is not skipped even in a composite.
        let rules = parse("0x03,-1,-1,-1,0");
        let intfs = [
            InterfaceClass {
                class: 0x03,
                subclass: 1,
                protocol: 1,
            },
            InterfaceClass {
                class: 0x08,
                subclass: 6,
                protocol: 80,
            },
        ];
        assert_eq!(
            check(
                &rules,
                0x00,
                &intfs,
                1,
                2,
                3,
                CheckFlags {
                    default_allow: true,
                    ..Default::default()
                }
            ),
            Err(CheckError::Rejected(Rejection::RuleDenied))
        );
    }
}
