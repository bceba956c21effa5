//! Checkpoint validators
//!
//! Each checkpoint kind maps to a pure function `(expected, answer) -> bool`.
//! Validators never see session or container state, so new exercise types are
//! added by registering another function under a new kind.

use std::collections::HashMap;
use std::net::Ipv4Addr;

/// Dotted-quad or `/N` netmask must equal the expected mask
pub const SUBNET_MASK: &str = "subnet_mask";
/// `a.b.c.d/N` must describe the expected network
pub const CIDR_NETWORK: &str = "cidr_network";
/// Trimmed, case-insensitive string equality
pub const EXACT: &str = "exact";

/// Pure checkpoint validator
pub type ValidatorFn = fn(expected: &str, answer: &str) -> bool;

/// Validators keyed by checkpoint kind
#[derive(Clone)]
pub struct ValidatorRegistry {
    validators: HashMap<String, ValidatorFn>,
}

impl ValidatorRegistry {
    /// Registry without any validators
    pub fn empty() -> Self {
        Self {
            validators: HashMap::new(),
        }
    }

    /// Registry with the built-in networking validators
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register(SUBNET_MASK, validate_subnet_mask);
        registry.register(CIDR_NETWORK, validate_cidr_network);
        registry.register(EXACT, validate_exact);
        registry
    }

    /// Register a validator, returning the one it replaced
    pub fn register(&mut self, kind: impl Into<String>, validator: ValidatorFn) -> Option<ValidatorFn> {
        self.validators.insert(kind.into(), validator)
    }

    pub fn get(&self, kind: &str) -> Option<ValidatorFn> {
        self.validators.get(kind).copied()
    }

    pub fn supports(&self, kind: &str) -> bool {
        self.validators.contains_key(kind)
    }

    /// Run the validator for `kind`; `None` if the kind is unknown
    pub fn validate(&self, kind: &str, expected: &str, answer: &str) -> Option<bool> {
        self.get(kind).map(|validator| validator(expected, answer))
    }

    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<_> = self.validators.keys().cloned().collect();
        kinds.sort();
        kinds
    }
}

impl Default for ValidatorRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl std::fmt::Debug for ValidatorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValidatorRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

pub fn validate_subnet_mask(expected: &str, answer: &str) -> bool {
    match (parse_netmask(expected), parse_netmask(answer)) {
        (Some(want), Some(got)) => want == got,
        _ => false,
    }
}

pub fn validate_cidr_network(expected: &str, answer: &str) -> bool {
    match (parse_cidr(expected), parse_cidr(answer)) {
        (Some(want), Some(got)) => want == got,
        _ => false,
    }
}

pub fn validate_exact(expected: &str, answer: &str) -> bool {
    expected.trim().eq_ignore_ascii_case(answer.trim())
}

/// Parse a netmask into its prefix length.
///
/// Accepts `255.255.255.0` or `/24`. Masks with non-contiguous one-bits are
/// rejected.
pub fn parse_netmask(raw: &str) -> Option<u8> {
    let raw = raw.trim();
    if let Some(prefix) = raw.strip_prefix('/') {
        return prefix.parse::<u8>().ok().filter(|p| *p <= 32);
    }
    let bits = u32::from(raw.parse::<Ipv4Addr>().ok()?);
    if bits.leading_ones() + bits.trailing_zeros() != 32 {
        return None;
    }
    Some(bits.leading_ones() as u8)
}

/// Parse `a.b.c.d/N` into (network address, prefix), zeroing host bits
pub fn parse_cidr(raw: &str) -> Option<(Ipv4Addr, u8)> {
    let (addr, prefix) = raw.trim().split_once('/')?;
    let addr: Ipv4Addr = addr.trim().parse().ok()?;
    let prefix: u8 = prefix.trim().parse().ok().filter(|p: &u8| *p <= 32)?;
    let network = u32::from(addr) & prefix_mask(prefix);
    Some((Ipv4Addr::from(network), prefix))
}

fn prefix_mask(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix))
    }
}
