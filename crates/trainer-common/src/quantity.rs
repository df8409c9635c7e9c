//! Kubernetes resource quantity arithmetic
//!
//! Quantities are parsed into exact milli-unit integers so requests can be
//! summed and scaled across replicas without floating point drift. Formatting
//! keeps the suffix family the quantity was written in.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use k8s_openapi::api::core::v1::{PodSpec, ResourceRequirements};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

use crate::{Error, Result};

/// Resource list keyed by resource name, as used by container requests and limits
pub type ResourceList = BTreeMap<String, Quantity>;

/// Suffix family a quantity is expressed in
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum QuantityFormat {
    /// Powers of 1000 (`k`, `M`, `G`, ...), plain numbers and millis (`m`)
    #[default]
    DecimalSI,
    /// Powers of 1024 (`Ki`, `Mi`, `Gi`, ...)
    BinarySI,
}

const DECIMAL_SUFFIXES: [&str; 6] = ["k", "M", "G", "T", "P", "E"];
const BINARY_SUFFIXES: [&str; 6] = ["Ki", "Mi", "Gi", "Ti", "Pi", "Ei"];

/// A quantity held as an exact number of milli-units
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ParsedQuantity {
    millis: i128,
    format: QuantityFormat,
}

impl ParsedQuantity {
    /// A zero quantity in the given format
    pub fn zero(format: QuantityFormat) -> Self {
        Self { millis: 0, format }
    }

    /// Build from whole units
    pub fn from_units(units: i64, format: QuantityFormat) -> Self {
        Self {
            millis: i128::from(units) * 1000,
            format,
        }
    }

    /// Value in milli-units
    pub fn milli_value(&self) -> i128 {
        self.millis
    }

    /// Suffix family used when formatting
    pub fn format(&self) -> QuantityFormat {
        self.format
    }

    /// Whether the value is exactly zero
    pub fn is_zero(&self) -> bool {
        self.millis == 0
    }

    /// Sum of two quantities, keeping the format of `self`
    pub fn add(self, other: Self) -> Self {
        Self {
            millis: self.millis.saturating_add(other.millis),
            format: self.format,
        }
    }

    /// Multiply by a replica count
    pub fn scale(self, factor: i64) -> Self {
        Self {
            millis: self.millis.saturating_mul(i128::from(factor)),
            format: self.format,
        }
    }

    /// Round up to whole units (`2500m` becomes 3)
    pub fn ceil_units(&self) -> i64 {
        let units = div_ceil(self.millis, 1000);
        i64::try_from(units).unwrap_or(if units > 0 { i64::MAX } else { i64::MIN })
    }

    /// Convert back into the k8s-openapi wire type
    pub fn to_quantity(&self) -> Quantity {
        Quantity(self.to_string())
    }
}

impl FromStr for ParsedQuantity {
    type Err = Error;

    fn from_str(raw: &str) -> Result<Self> {
        let s = raw.trim();
        let invalid = || Error::validation(format!("invalid quantity '{}'", raw));

        let split = s
            .char_indices()
            .find(|(i, c)| {
                let sign = *i == 0 && (*c == '+' || *c == '-');
                !(c.is_ascii_digit() || *c == '.' || sign)
            })
            .map(|(i, _)| i)
            .unwrap_or(s.len());
        let (number, suffix) = s.split_at(split);

        let (negative, digits) = match number.as_bytes().first() {
            Some(b'-') => (true, &number[1..]),
            Some(b'+') => (false, &number[1..]),
            _ => (false, number),
        };
        let (whole, frac) = digits.split_once('.').unwrap_or((digits, ""));
        let all_digits = |part: &str| part.chars().all(|c| c.is_ascii_digit());
        if (whole.is_empty() && frac.is_empty()) || !all_digits(whole) || !all_digits(frac) {
            return Err(invalid());
        }

        let mantissa: i128 = format!("{whole}{frac}").parse().map_err(|_| invalid())?;
        let frac_scale = pow10(frac.len() as u32).ok_or_else(invalid)?;

        let (multiplier, divisor, format) = parse_suffix(suffix).ok_or_else(invalid)?;

        let numerator = mantissa
            .checked_mul(1000)
            .and_then(|n| n.checked_mul(multiplier))
            .ok_or_else(invalid)?;
        let denominator = frac_scale.checked_mul(divisor).ok_or_else(invalid)?;

        let magnitude = div_ceil(numerator, denominator);
        Ok(Self {
            millis: if negative { -magnitude } else { magnitude },
            format,
        })
    }
}

impl TryFrom<&Quantity> for ParsedQuantity {
    type Error = Error;

    fn try_from(q: &Quantity) -> Result<Self> {
        q.0.parse()
    }
}

impl fmt::Display for ParsedQuantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.millis % 1000 != 0 {
            return write!(f, "{}m", self.millis);
        }
        let mut value = self.millis / 1000;
        if value == 0 {
            return write!(f, "0");
        }
        let (base, suffixes): (i128, &[&str]) = match self.format {
            QuantityFormat::DecimalSI => (1000, &DECIMAL_SUFFIXES),
            QuantityFormat::BinarySI => (1024, &BINARY_SUFFIXES),
        };
        let mut suffix = "";
        for &candidate in suffixes {
            if value % base != 0 {
                break;
            }
            value /= base;
            suffix = candidate;
        }
        write!(f, "{value}{suffix}")
    }
}

/// Returns (multiplier, divisor, format) for a quantity suffix
fn parse_suffix(suffix: &str) -> Option<(i128, i128, QuantityFormat)> {
    match suffix {
        "" => return Some((1, 1, QuantityFormat::DecimalSI)),
        "m" => return Some((1, 1000, QuantityFormat::DecimalSI)),
        _ => {}
    }
    if let Some(pos) = DECIMAL_SUFFIXES.iter().position(|s| *s == suffix) {
        return Some((1000i128.pow(pos as u32 + 1), 1, QuantityFormat::DecimalSI));
    }
    if let Some(pos) = BINARY_SUFFIXES.iter().position(|s| *s == suffix) {
        return Some((1024i128.pow(pos as u32 + 1), 1, QuantityFormat::BinarySI));
    }
    let exponent = suffix
        .strip_prefix('e')
        .or_else(|| suffix.strip_prefix('E'))?
        .parse::<i32>()
        .ok()?;
    let scale = pow10(exponent.unsigned_abs())?;
    if exponent >= 0 {
        Some((scale, 1, QuantityFormat::DecimalSI))
    } else {
        Some((1, scale, QuantityFormat::DecimalSI))
    }
}

fn pow10(exp: u32) -> Option<i128> {
    if exp > 30 {
        return None;
    }
    10i128.checked_pow(exp)
}

fn div_ceil(numerator: i128, denominator: i128) -> i128 {
    if numerator >= 0 {
        (numerator + denominator - 1) / denominator
    } else {
        numerator / denominator
    }
}

// =============================================================================
// Resource lists
// =============================================================================

/// Parse a single entry of a resource list
pub fn parse_quantity(q: &Quantity) -> Result<ParsedQuantity> {
    ParsedQuantity::try_from(q)
}

/// Add every entry of `other` into `total`; missing kinds count as zero
pub fn add_resource_lists(total: &mut ResourceList, other: &ResourceList) -> Result<()> {
    for (name, quantity) in other {
        let addend = parse_quantity(quantity)?;
        let sum = match total.get(name) {
            Some(existing) => parse_quantity(existing)?.add(addend),
            None => addend,
        };
        total.insert(name.clone(), sum.to_quantity());
    }
    Ok(())
}

/// Per-kind maximum of `current` and `other`, stored into `current`
pub fn max_resource_lists(current: &mut ResourceList, other: &ResourceList) -> Result<()> {
    for (name, quantity) in other {
        let candidate = parse_quantity(quantity)?;
        let keep_existing = match current.get(name) {
            Some(existing) => parse_quantity(existing)?.milli_value() >= candidate.milli_value(),
            None => false,
        };
        if !keep_existing {
            current.insert(name.clone(), candidate.to_quantity());
        }
    }
    Ok(())
}

/// Multiply every entry by `factor`
pub fn scale_resource_list(list: &ResourceList, factor: i32) -> Result<ResourceList> {
    list.iter()
        .map(|(name, q)| {
            let scaled = parse_quantity(q)?.scale(i64::from(factor));
            Ok((name.clone(), scaled.to_quantity()))
        })
        .collect()
}

/// Effective requests of one container.
///
/// Kinds that only appear under limits default their request to the limit,
/// matching API server defaulting for templates that were never admitted.
pub fn container_requests(resources: Option<&ResourceRequirements>) -> ResourceList {
    let Some(resources) = resources else {
        return ResourceList::new();
    };
    let mut requests = resources.requests.clone().unwrap_or_default();
    for (name, limit) in resources.limits.iter().flatten() {
        requests.entry(name.clone()).or_insert_with(|| limit.clone());
    }
    requests
}

/// Requests of one pod: the larger of the summed app containers and the
/// largest init container, plus pod overhead.
pub fn pod_requests(spec: &PodSpec) -> Result<ResourceList> {
    let mut total = ResourceList::new();
    for container in &spec.containers {
        add_resource_lists(&mut total, &container_requests(container.resources.as_ref()))?;
    }
    for init in spec.init_containers.iter().flatten() {
        max_resource_lists(&mut total, &container_requests(init.resources.as_ref()))?;
    }
    if let Some(overhead) = &spec.overhead {
        add_resource_lists(&mut total, overhead)?;
    }
    Ok(total)
}
