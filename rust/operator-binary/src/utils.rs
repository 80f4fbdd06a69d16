use std::fmt::Write as _; // import without risk of name clashing
use std::{
    fmt::{Debug, LowerHex},
    ops::Deref,
};

use stackable_operator::{
    cpu::CpuQuantity,
    k8s_openapi::apimachinery::pkg::api::resource::Quantity,
    memory::{BinaryMultiple, MemoryQuantity},
};

/// Helper for formatting byte arrays
pub struct FmtByteSlice<'a>(pub &'a [u8]);
impl LowerHex for FmtByteSlice<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in self.0 {
            f.write_fmt(format_args!("{:02x}", byte))?;
        }
        Ok(())
    }
}

/// Combines the messages of an error and its sources into a [`String`] of the form `"error: source 1: source 2: root error"`
pub fn error_full_message(err: &dyn std::error::Error) -> String {
    // Build the full hierarchy of error messages by walking up the stack until an error
    // without `source` set is encountered and concatenating all encountered error strings.
    let mut full_msg = format!("{}", err);
    let mut curr_err = err.source();
    while let Some(curr_source) = curr_err {
        let _ = write!(full_msg, ": {}", curr_source);
        curr_err = curr_source.source();
    }
    full_msg
}

/// Wrapper for (mostly) secret values that should not be logged.
#[derive(Clone, PartialEq, Eq)]
pub struct Unloggable<T>(pub T);

impl<T> Debug for Unloggable<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("<redacted>")
    }
}

impl<T> Deref for Unloggable<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Parses a Kubernetes resource quantity (such as `500m`, `1.5Gi` or `2e3`) into its numeric value.
///
/// Covers the decimal suffixes and exponents that [`CpuQuantity`] and [`MemoryQuantity`] reject.
/// Returns [`None`] for strings that are not valid quantities.
fn parse_quantity(quantity: &str) -> Option<f64> {
    const SUFFIXES: &[(&str, f64)] = &[
        ("Ki", 1024.0),
        ("Mi", 1024.0 * 1024.0),
        ("Gi", 1024.0 * 1024.0 * 1024.0),
        ("Ti", 1024.0 * 1024.0 * 1024.0 * 1024.0),
        ("Pi", 1024.0 * 1024.0 * 1024.0 * 1024.0 * 1024.0),
        ("Ei", 1024.0 * 1024.0 * 1024.0 * 1024.0 * 1024.0 * 1024.0),
        ("n", 1e-9),
        ("u", 1e-6),
        ("m", 1e-3),
        ("k", 1e3),
        ("M", 1e6),
        ("G", 1e9),
        ("T", 1e12),
        ("P", 1e15),
        ("E", 1e18),
    ];
    let quantity = quantity.trim();
    let (number, multiplier) = SUFFIXES
        .iter()
        .find_map(|(suffix, multiplier)| {
            quantity
                .strip_suffix(suffix)
                .map(|number| (number, *multiplier))
        })
        .unwrap_or((quantity, 1.0));
    if number.is_empty() || number.ends_with(['e', 'E']) {
        return None;
    }
    let value = number.parse::<f64>().ok()?;
    value.is_finite().then_some(value * multiplier)
}

fn memory_kibi(quantity: &Quantity) -> Option<f32> {
    // Plain byte counts and decimal suffixes are left to `parse_quantity`
    if !quantity.0.ends_with('i') {
        return None;
    }
    let memory = quantity.0.parse::<MemoryQuantity>().ok()?;
    Some(memory.scale_to(BinaryMultiple::Kibi).value)
}

/// Compares two quantities of `resource` by value, so that `0.5` equals `500m` and `1Gi`
/// equals `1024Mi`.
///
/// Falls back to comparing the raw strings if either side cannot be parsed.
pub fn quantity_eq(resource: &str, a: &Quantity, b: &Quantity) -> bool {
    match resource {
        "cpu" => {
            if let (Ok(a), Ok(b)) = (a.0.parse::<CpuQuantity>(), b.0.parse::<CpuQuantity>()) {
                return a == b;
            }
        }
        "memory" => {
            if let (Some(a), Some(b)) = (memory_kibi(a), memory_kibi(b)) {
                return (a - b).abs() <= f32::EPSILON * a.abs().max(b.abs()) * 4.0;
            }
        }
        _ => {}
    }
    match (parse_quantity(&a.0), parse_quantity(&b.0)) {
        (Some(a), Some(b)) => (a - b).abs() <= f64::EPSILON * a.abs().max(b.abs()) * 4.0,
        _ => a.0 == b.0,
    }
}
