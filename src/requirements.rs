//! Dependency-version constraints and the runtime environment they are
//! checked against.
//!
//! Catalog entries declare constraints such as `tokenizers>=0.20`; the check
//! runs before any checkpoint download so an unusable entry fails fast.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::fmt;

use crate::error::{LoaderError, Result};

/// A dotted numeric version. Non-numeric suffixes are ignored when parsing,
/// so `0.7.2-alpha.1` compares as `0.7.2`. Trailing zeros do not matter:
/// `1.0` equals `1.0.0`.
#[derive(Debug, Clone)]
pub struct Version(Vec<u64>);

impl Version {
    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = Vec::new();
        for piece in s.split('.') {
            let digits: String = piece.chars().take_while(|c| c.is_ascii_digit()).collect();
            if digits.is_empty() {
                break;
            }
            parts.push(digits.parse().ok()?);
            if digits.len() != piece.len() {
                break;
            }
        }
        if parts.is_empty() {
            None
        } else {
            Some(Self(parts))
        }
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.0.len().max(other.0.len());
        for i in 0..len {
            let a = self.0.get(i).copied().unwrap_or(0);
            let b = other.0.get(i).copied().unwrap_or(0);
            match a.cmp(&b) {
                Ordering::Equal => continue,
                ord => return ord,
            }
        }
        Ordering::Equal
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|p| p.to_string()).collect();
        write!(f, "{}", parts.join("."))
    }
}

/// Comparison operator of a constraint string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintOp {
    Ge,
    Gt,
    Le,
    Lt,
    Eq,
    Ne,
}

/// One parsed constraint, e.g. `candle>=0.7`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    pub component: String,
    pub op: ConstraintOp,
    pub version: Version,
}

impl Requirement {
    /// Parse `name>=1.2`, `name<2`, `name==1.0` and friends.
    pub fn parse(s: &str) -> Option<Self> {
        let ops = [
            (">=", ConstraintOp::Ge),
            ("<=", ConstraintOp::Le),
            ("==", ConstraintOp::Eq),
            ("!=", ConstraintOp::Ne),
            (">", ConstraintOp::Gt),
            ("<", ConstraintOp::Lt),
        ];
        for (sym, op) in ops {
            if let Some(idx) = s.find(sym) {
                let component = s[..idx].trim();
                let version = Version::parse(s[idx + sym.len()..].trim())?;
                if component.is_empty() {
                    return None;
                }
                return Some(Self {
                    component: component.to_string(),
                    op,
                    version,
                });
            }
        }
        None
    }

    fn satisfied_by(&self, installed: &Version) -> bool {
        match self.op {
            ConstraintOp::Ge => installed >= &self.version,
            ConstraintOp::Gt => installed > &self.version,
            ConstraintOp::Le => installed <= &self.version,
            ConstraintOp::Lt => installed < &self.version,
            ConstraintOp::Eq => installed == &self.version,
            ConstraintOp::Ne => installed != &self.version,
        }
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self.op {
            ConstraintOp::Ge => ">=",
            ConstraintOp::Gt => ">",
            ConstraintOp::Le => "<=",
            ConstraintOp::Lt => "<",
            ConstraintOp::Eq => "==",
            ConstraintOp::Ne => "!=",
        };
        write!(f, "{}{}{}", self.component, op, self.version)
    }
}

/// Versions of the hosting runtime's components plus the set of optional
/// extensions it was built with. Detected once per process; tests build
/// their own instances.
#[derive(Debug, Clone)]
pub struct RuntimeEnv {
    components: HashMap<String, Version>,
    extensions: HashSet<String>,
}

impl RuntimeEnv {
    /// Probe the compiled-in runtime.
    pub fn detect() -> Self {
        let mut env = Self {
            components: HashMap::new(),
            extensions: HashSet::new(),
        };
        // Versions match the pins in Cargo.toml; a mismatch here shows up as
        // an UnsatisfiedRequirement naming the stale component.
        env.insert_component("candle", "0.7.2");
        env.insert_component("tokenizers", "0.20.3");
        env.insert_component("llm-loader", env!("CARGO_PKG_VERSION"));
        if cfg!(feature = "cuda") {
            env.extensions.insert("cuda".to_string());
        }
        if cfg!(feature = "flash-attn") {
            env.extensions.insert("flash-attn".to_string());
        }
        if let Ok(extra) = std::env::var("LLM_LOADER_EXTENSIONS") {
            for name in extra.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                env.extensions.insert(name.to_string());
            }
        }
        env
    }

    /// An environment with no components or extensions.
    pub fn empty() -> Self {
        Self {
            components: HashMap::new(),
            extensions: HashSet::new(),
        }
    }

    pub fn with_component(mut self, name: &str, version: &str) -> Self {
        self.insert_component(name, version);
        self
    }

    pub fn with_extension(mut self, name: &str) -> Self {
        self.extensions.insert(name.to_string());
        self
    }

    fn insert_component(&mut self, name: &str, version: &str) {
        if let Some(v) = Version::parse(version) {
            self.components.insert(name.to_string(), v);
        }
    }

    pub fn component(&self, name: &str) -> Option<&Version> {
        self.components.get(name)
    }

    pub fn has_extension(&self, name: &str) -> bool {
        self.extensions.contains(name)
    }

    /// True when `component` is installed at a version at least `min`.
    pub fn at_least(&self, component: &str, min: &str) -> bool {
        match (self.components.get(component), Version::parse(min)) {
            (Some(installed), Some(min)) => installed >= &min,
            _ => false,
        }
    }

    /// Check a single constraint, naming the offending key in the error.
    pub fn check(&self, key: &str, requirement: &Requirement) -> Result<()> {
        let installed = self.components.get(&requirement.component);
        let ok = installed.map(|v| requirement.satisfied_by(v)).unwrap_or(false);
        if ok {
            Ok(())
        } else {
            Err(LoaderError::UnsatisfiedRequirement {
                key: key.to_string(),
                requirement: requirement.to_string(),
                installed: installed
                    .map(|v| v.to_string())
                    .unwrap_or_else(|| "absent".to_string()),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_ordering() {
        let a = Version::parse("0.7.2").unwrap();
        let b = Version::parse("0.7").unwrap();
        let c = Version::parse("0.10").unwrap();
        assert!(a > b);
        assert!(c > a);
        assert_eq!(Version::parse("1.0.0").unwrap(), Version::parse("1.0").unwrap());
    }

    #[test]
    fn test_version_ignores_suffix() {
        assert_eq!(
            Version::parse("0.3.0-alpha.1").unwrap(),
            Version::parse("0.3.0").unwrap()
        );
    }

    #[test]
    fn test_requirement_parse() {
        let req = Requirement::parse("tokenizers>=0.20").unwrap();
        assert_eq!(req.component, "tokenizers");
        assert_eq!(req.op, ConstraintOp::Ge);
        assert_eq!(req.to_string(), "tokenizers>=0.20");

        assert!(Requirement::parse("no-operator").is_none());
        assert!(Requirement::parse(">=1.0").is_none());
    }

    #[test]
    fn test_check_unsatisfied_names_key() {
        let env = RuntimeEnv::empty().with_component("candle", "0.6.0");
        let req = Requirement::parse("candle>=0.7").unwrap();
        let err = env.check("llama2-7b-chat", &req).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("llama2-7b-chat"));
        assert!(msg.contains("candle>=0.7"));
        assert!(msg.contains("0.6.0"));
    }

    #[test]
    fn test_check_absent_component() {
        let env = RuntimeEnv::empty();
        let req = Requirement::parse("candle>=0.7").unwrap();
        let err = env.check("x", &req).unwrap_err();
        assert!(err.to_string().contains("absent"));
    }

    #[test]
    fn test_detect_has_pins() {
        let env = RuntimeEnv::detect();
        assert!(env.at_least("candle", "0.7"));
        assert!(env.at_least("tokenizers", "0.20"));
        assert!(!env.at_least("candle", "99.0"));
    }
}
