//! Dotted version parsing, ordering and upgrade-path rules
//!
//! Versions have the shape `major.minor.patch[-pre][+build]`. Build metadata
//! is accepted and dropped: it never takes part in ordering.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use crate::Error;

/// A parsed `major.minor.patch[-pre]` version
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Version {
    /// Major component
    pub major: u64,
    /// Minor component
    pub minor: u64,
    /// Patch component
    pub patch: u64,
    /// Pre-release qualifier, empty for releases
    pub pre: String,
}

impl Version {
    /// Create a release version
    pub fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
            pre: String::new(),
        }
    }

    /// Parse a version string, failing with `MalformedVersion`
    pub fn parse(raw: &str) -> Result<Self, Error> {
        let without_build = match raw.split_once('+') {
            Some((v, build)) if !build.is_empty() => v,
            Some(_) => return Err(Error::malformed_version(raw, "empty build metadata")),
            None => raw,
        };

        let (core, pre) = match without_build.split_once('-') {
            Some((_, "")) => return Err(Error::malformed_version(raw, "empty pre-release")),
            Some((core, pre)) => (core, pre),
            None => (without_build, ""),
        };

        let mut parts = core.split('.');
        let major = parse_component(raw, "major", parts.next())?;
        let minor = parse_component(raw, "minor", parts.next())?;
        let patch = parse_component(raw, "patch", parts.next())?;
        if parts.next().is_some() {
            return Err(Error::malformed_version(
                raw,
                "expected exactly three numeric components",
            ));
        }

        Ok(Self {
            major,
            minor,
            patch,
            pre: pre.to_string(),
        })
    }

    /// Whether this version is greater than or equal to `other`
    pub fn gte(&self, other: &Version) -> bool {
        self >= other
    }

    /// Whether this version is strictly greater than `other`
    pub fn gt(&self, other: &Version) -> bool {
        self > other
    }

    /// Whether this is a pre-release (snapshot) build
    pub fn is_pre_release(&self) -> bool {
        !self.pre.is_empty()
    }
}

fn parse_component(raw: &str, name: &str, part: Option<&str>) -> Result<u64, Error> {
    let part = part.ok_or_else(|| Error::malformed_version(raw, format!("missing {name}")))?;
    if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Error::malformed_version(
            raw,
            format!("{name} '{part}' is not a number"),
        ));
    }
    part.parse::<u64>()
        .map_err(|e| Error::malformed_version(raw, format!("{name} '{part}': {e}")))
}

impl FromStr for Version {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if self.is_pre_release() {
            write!(f, "-{}", self.pre)?;
        }
        Ok(())
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.major
            .cmp(&other.major)
            .then(self.minor.cmp(&other.minor))
            .then(self.patch.cmp(&other.patch))
            .then_with(|| compare_pre(&self.pre, &other.pre))
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Pre-release precedence: a release sorts after any pre-release of the same
/// triple; qualifiers compare identifier by identifier.
fn compare_pre(a: &str, b: &str) -> Ordering {
    match (a.is_empty(), b.is_empty()) {
        (true, true) => return Ordering::Equal,
        (true, false) => return Ordering::Greater,
        (false, true) => return Ordering::Less,
        (false, false) => {}
    }

    let mut left = a.split('.');
    let mut right = b.split('.');
    loop {
        match (left.next(), right.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(l), Some(r)) => {
                let ord = match (l.parse::<u64>(), r.parse::<u64>()) {
                    (Ok(ln), Ok(rn)) => ln.cmp(&rn).then_with(|| l.cmp(r)),
                    (Ok(_), Err(_)) => Ordering::Less,
                    (Err(_), Ok(_)) => Ordering::Greater,
                    (Err(_), Err(_)) => l.cmp(r),
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
        }
    }
}

/// Minimum version across a sequence of version strings.
///
/// Returns `Ok(None)` for an empty sequence. Any malformed entry aborts the
/// whole computation: a minimum over a partially parsed fleet is not reported.
pub fn min_version<I, S>(versions: I) -> Result<Option<Version>, Error>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut min: Option<Version> = None;
    for raw in versions {
        let v = Version::parse(raw.as_ref())?;
        min = match min {
            Some(current) if current <= v => Some(current),
            _ => Some(v),
        };
    }
    Ok(min)
}

/// Report whether upgrading from `from` to `to` is allowed.
///
/// The major version may stay the same or grow by exactly one, and the
/// destination must be strictly newer than the source.
pub fn is_valid_upgrade(from: &str, to: &str) -> Result<bool, Error> {
    let src = Version::parse(from)?;
    let dst = Version::parse(to)?;
    Ok(is_valid_upgrade_path(&src, &dst))
}

/// Parsed form of [`is_valid_upgrade`]
pub fn is_valid_upgrade_path(from: &Version, to: &Version) -> bool {
    let valid_major = to.major == from.major || to.major == from.major + 1;
    valid_major && !from.gte(to)
}

/// Whether a version string names a pre-release build
pub fn is_pre_release(raw: &str) -> Result<bool, Error> {
    Ok(Version::parse(raw)?.is_pre_release())
}
