//! Resource locators: parsing, normalization, and context switching.
//!
//! A locator has the shape `scheme://authority/path/to/name`, where the
//! scheme and authority are optional. A missing scheme means `local`.
//! Runs of slashes collapse to one, and a trailing slash marks a directory
//! (its `name` is empty).
//!
//! | input                    | scheme | authority | chopped_path | folder   | name   |
//! |--------------------------|--------|-----------|--------------|----------|--------|
//! | `agave://system/path/`   | agave  | system    | `/path`      | `/path`  |        |
//! | `agave://system/path`    | agave  | system    | `/path`      | `/`      | `path` |
//! | `/a//b/c`                | local  |           | `/a/b/c`     | `/a/b`   | `c`    |
//!
//! Locators never touch storage; data movement goes through
//! [`crate::data::DataManager`].

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use geneflow_types::error::LocatorError;
use regex::Regex;

static URI_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(([^:/]+):)?(//([^/]*))?(.*?)$").expect("locator pattern is valid")
});

static PATH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(.*?)(/?)([^/]+)?$").expect("path pattern is valid"));

static SLASHES_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/+").expect("slash pattern is valid"));

// ---------------------------------------------------------------------------
// Scheme
// ---------------------------------------------------------------------------

/// Storage backend a locator addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Scheme {
    /// The engine host's filesystem.
    Local,
    /// A remote execution platform's storage system.
    Agave,
}

impl Scheme {
    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::Local => "local",
            Scheme::Agave => "agave",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scheme {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(Scheme::Local),
            "agave" => Ok(Scheme::Agave),
            other => Err(format!("unrecognized scheme '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Locator
// ---------------------------------------------------------------------------

/// An immutable, parsed resource address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Locator {
    scheme: Scheme,
    authority: String,
    path: String,
    chopped_path: String,
    folder: String,
    name: String,
}

impl Locator {
    /// Parse a locator string.
    ///
    /// Fails with `MalformedLocation` on an empty string, an unrecognized
    /// scheme, or input the locator grammar cannot match (e.g. newlines).
    pub fn parse(input: &str) -> Result<Self, LocatorError> {
        if input.is_empty() {
            return Err(LocatorError::malformed(input, "empty location"));
        }

        let caps = URI_RE
            .captures(input)
            .ok_or_else(|| LocatorError::malformed(input, "unparsable location"))?;

        let scheme = match caps.get(2) {
            Some(m) => m
                .as_str()
                .parse::<Scheme>()
                .map_err(|reason| LocatorError::malformed(input, reason))?,
            None => Scheme::Local,
        };
        let authority = caps.get(4).map_or("", |m| m.as_str());
        let path = caps.get(5).map_or("", |m| m.as_str());

        Self::from_parts(scheme, authority, path)
            .ok_or_else(|| LocatorError::malformed(input, "unparsable path"))
    }

    /// Build a locator from already-split components. An empty path means `/`.
    fn from_parts(scheme: Scheme, authority: &str, raw_path: &str) -> Option<Self> {
        let raw_path = if raw_path.is_empty() { "/" } else { raw_path };
        let path = SLASHES_RE.replace_all(raw_path, "/").into_owned();

        let caps = PATH_RE.captures(&path)?;
        let head = caps.get(1).map_or("", |m| m.as_str());
        let sep = caps.get(2).map_or("", |m| m.as_str());
        let name = caps.get(3).map_or("", |m| m.as_str()).to_string();
        let folder = if head.is_empty() { sep } else { head }.to_string();

        let chopped_path = if name.is_empty() {
            folder.clone()
        } else if folder == "/" || folder.is_empty() {
            format!("{folder}{name}")
        } else {
            format!("{folder}/{name}")
        };

        Some(Self {
            scheme,
            authority: authority.to_string(),
            path,
            chopped_path,
            folder,
            name,
        })
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn authority(&self) -> &str {
        &self.authority
    }

    /// Full path after slash collapsing; keeps a trailing slash.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Path without a trailing slash (except the root).
    pub fn chopped_path(&self) -> &str {
        &self.chopped_path
    }

    pub fn folder(&self) -> &str {
        &self.folder
    }

    /// Leaf name; empty when the locator denotes a directory.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_directory(&self) -> bool {
        self.name.is_empty()
    }

    /// `scheme:[//authority]chopped_path`, the form substituted into templates.
    pub fn chopped_uri(&self) -> String {
        let mut uri = format!("{}:", self.scheme);
        if !self.authority.is_empty() {
            uri.push_str("//");
            uri.push_str(&self.authority);
        }
        uri.push_str(&self.chopped_path);
        uri
    }

    /// Canonical string form: the chopped URI, plus a trailing slash when
    /// the locator denotes a directory other than the root. Parsing this
    /// string yields an equal locator.
    pub fn serialize(&self) -> String {
        let mut uri = self.chopped_uri();
        if self.is_directory() && !self.chopped_path.ends_with('/') {
            uri.push('/');
        }
        uri
    }

    /// Re-home this locator's leaf name under `target`.
    ///
    /// A named leaf becomes a same-named leaf inside `target`'s directory;
    /// a directory locator maps onto `target` itself, as a directory.
    pub fn switch_context(&self, target: &Locator) -> Locator {
        let separator = if target.chopped_path == "/" { "" } else { "/" };
        let path = format!("{}{separator}{}", target.chopped_path, self.name);
        Self::from_parts(target.scheme, &target.authority, &path)
            .unwrap_or_else(|| target.clone())
    }

    /// Locator of a child entry of this locator.
    pub fn join(&self, child: &str) -> Result<Locator, LocatorError> {
        let child = child.trim_start_matches('/');
        if child.is_empty() {
            return Err(LocatorError::malformed(
                self.serialize(),
                "cannot join an empty name",
            ));
        }
        let separator = if self.chopped_path.ends_with('/') { "" } else { "/" };
        let path = format!("{}{separator}{child}", self.chopped_path);
        Self::from_parts(self.scheme, &self.authority, &path)
            .ok_or_else(|| LocatorError::malformed(path, "unparsable path"))
    }

    /// The same location, marked as a directory.
    pub fn as_directory(&self) -> Locator {
        if self.is_directory() {
            return self.clone();
        }
        let path = format!("{}/", self.chopped_path);
        Self::from_parts(self.scheme, &self.authority, &path).unwrap_or_else(|| self.clone())
    }
}

impl FromStr for Locator {
    type Err = LocatorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Locator::parse(s)
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.serialize())
    }
}
